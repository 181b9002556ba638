use crate::types::TaskState;

/// What a caller should do after polling a task once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Still in flight; requeue without mutating anything else.
    Pending,
    /// Completed successfully; the caller may clear its task reference and advance.
    Success,
    /// Completed with a failure; the caller should record `TaskFailure` and
    /// schedule a retry roughly a minute out.
    Failed,
}

/// Classify a polled [`TaskState`] into the caller-facing outcome.
///
/// A pure function so the state machine's handling of "task still running vs
/// task terminal" is unit-testable without a hypervisor.
#[must_use]
pub fn classify(state: TaskState) -> TaskOutcome {
    match state {
        TaskState::Queued | TaskState::Running => TaskOutcome::Pending,
        TaskState::Success => TaskOutcome::Success,
        TaskState::Failed => TaskOutcome::Failed,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queued_and_running_are_pending() {
        assert_eq!(classify(TaskState::Queued), TaskOutcome::Pending);
        assert_eq!(classify(TaskState::Running), TaskOutcome::Pending);
    }

    #[test]
    fn terminal_states_classify() {
        assert_eq!(classify(TaskState::Success), TaskOutcome::Success);
        assert_eq!(classify(TaskState::Failed), TaskOutcome::Failed);
    }
}
