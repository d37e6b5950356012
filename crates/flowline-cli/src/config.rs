//! Configuration file loading.
//!
//! Resolution order for the path: `--config`, then `FLOWLINE_CONFIG` (both
//! handled by clap), then `./flowline.toml`. A missing or malformed file is
//! not fatal; it logs a warning and yields the defaults.

use std::path::Path;

use flowline_types::config::FlowlineConfig;

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "flowline.toml";

/// Load `path`, falling back to defaults on any error.
pub fn load_config(path: &Path) -> FlowlineConfig {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return FlowlineConfig::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read config file, using defaults");
            return FlowlineConfig::default();
        }
    };

    match toml::from_str::<FlowlineConfig>(&raw) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded configuration");
            config
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed config file, using defaults");
            FlowlineConfig::default()
        }
    }
}

/// Render the effective configuration as TOML.
pub fn render_config(config: &FlowlineConfig) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::config::QueueMode;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml"));
        assert_eq!(config.engine.max_concurrent_workflows, 10);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nmax_concurrent_workflows = 3\n\n[scheduler]\ndefault_timezone = \"+02:00\"\n\n[queue]\nmode = \"fifo\""
        )
        .unwrap();

        let config = load_config(file.path());
        assert_eq!(config.engine.max_concurrent_workflows, 3);
        assert_eq!(config.engine.default_step_timeout_ms, 30_000);
        assert_eq!(config.scheduler.default_timezone, "+02:00");
        assert_eq!(config.scheduler.history_limit, 100);
        assert_eq!(config.queue.mode, QueueMode::Fifo);
        assert_eq!(config.events.capacity, 1024);
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nmax_concurrent_workflows = ").unwrap();
        let config = load_config(file.path());
        assert_eq!(config.engine.max_concurrent_workflows, 10);
    }

    #[test]
    fn test_rendered_config_reloads() {
        let mut config = FlowlineConfig::default();
        config.scheduler.concurrency = 9;
        let rendered = render_config(&config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowline.toml");
        std::fs::write(&path, rendered).unwrap();
        assert_eq!(load_config(&path).scheduler.concurrency, 9);
    }
}
