//! Workflow-level and step-level machine configurations.

use std::sync::{Arc, LazyLock};

use flowline_types::workflow::{StepStatus, WorkflowStatus};

use super::{StateMachine, StateMachineConfig, TransitionRule};

/// Events driving a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowEvent {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    RequestApproval,
    Approve,
    Reject,
}

/// Events driving a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepEvent {
    Start,
    Wait,
    Resume,
    Complete,
    Fail,
    Skip,
    Retry,
}

type WorkflowConfig = StateMachineConfig<WorkflowStatus, WorkflowEvent, ()>;
type StepConfig = StateMachineConfig<StepStatus, StepEvent, ()>;

static WORKFLOW_CONFIG: LazyLock<Arc<WorkflowConfig>> = LazyLock::new(|| {
    use WorkflowEvent as E;
    use WorkflowStatus as S;
    Arc::new(StateMachineConfig {
        initial: S::Pending,
        rules: vec![
            TransitionRule::new([S::Pending], E::Start, S::Running),
            TransitionRule::new([S::Running], E::Pause, S::Paused),
            TransitionRule::new([S::Paused], E::Resume, S::Running),
            TransitionRule::new([S::Running], E::Complete, S::Completed),
            TransitionRule::new(
                [S::Pending, S::Running, S::Paused, S::WaitingApproval],
                E::Fail,
                S::Failed,
            ),
            TransitionRule::new(
                [S::Pending, S::Running, S::Paused, S::WaitingApproval],
                E::Cancel,
                S::Cancelled,
            ),
            TransitionRule::new([S::Running], E::RequestApproval, S::WaitingApproval),
            TransitionRule::new([S::WaitingApproval], E::Approve, S::Running),
            TransitionRule::new([S::WaitingApproval], E::Reject, S::Running),
        ],
        final_states: vec![S::Completed, S::Failed, S::Cancelled],
    })
});

static STEP_CONFIG: LazyLock<Arc<StepConfig>> = LazyLock::new(|| {
    use StepEvent as E;
    use StepStatus as S;
    Arc::new(StateMachineConfig {
        initial: S::Pending,
        rules: vec![
            TransitionRule::new([S::Pending], E::Start, S::Running),
            TransitionRule::new([S::Pending, S::Running], E::Wait, S::Waiting),
            TransitionRule::new([S::Waiting], E::Resume, S::Running),
            TransitionRule::new([S::Running], E::Complete, S::Completed),
            TransitionRule::new([S::Running, S::Waiting], E::Fail, S::Failed),
            TransitionRule::new(
                [S::Pending, S::Running, S::Waiting, S::Failed],
                E::Skip,
                S::Skipped,
            ),
            TransitionRule::new([S::Failed], E::Retry, S::Pending),
        ],
        final_states: vec![S::Completed, S::Skipped],
    })
});

/// Machine for one workflow instance, starting in `Pending`.
pub fn workflow_machine() -> StateMachine<WorkflowStatus, WorkflowEvent, ()> {
    StateMachine::new(WORKFLOW_CONFIG.clone(), ())
}

/// Machine for one step execution, starting in `Pending`.
pub fn step_machine() -> StateMachine<StepStatus, StepEvent, ()> {
    StateMachine::new(STEP_CONFIG.clone(), ())
}
