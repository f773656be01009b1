//! Pure transition function of the suite polling protocol.

use crate::service::{SuiteRunSnapshot, SuiteStatus};

/// Phase of a single suite run as seen by the poller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteState {
    /// The run has not been requested yet.
    Starting,
    /// Waiting for the suite and its first test case to start running.
    AwaitingSetup,
    /// The local executable has been launched for the current run.
    RunningTest,
    /// The suite reported a terminal status.
    Finished,
    /// Polling was abandoned after an error.
    Failed,
}

/// What the poller does after observing a snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollAction {
    /// Sleep for one interval and poll again.
    Wait,
    /// Launch the local executable, then keep polling.
    Launch,
    /// Stop polling with the given verdict.
    Finish(SuiteStatus),
}

/// Something that happens to a run outside of a polled snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunEvent {
    /// The suite run was accepted by the service.
    Started,
    /// A remote call or the launch failed.
    Errored,
}

/// Computes the state that follows `event`.
///
/// A finished run stays finished; any other run that errors is abandoned.
#[must_use]
pub const fn apply_event(state: SuiteState, event: RunEvent) -> SuiteState {
    match (state, event) {
        (SuiteState::Starting, RunEvent::Started) => SuiteState::AwaitingSetup,
        (SuiteState::Finished, _) => SuiteState::Finished,
        (_, RunEvent::Errored) => SuiteState::Failed,
        (other, RunEvent::Started) => other,
    }
}

/// Computes the next state and action from the current state and a snapshot.
///
/// Launching requires the suite and its first test case to both report
/// RUNNING in the same snapshot. Once the executable has been launched the
/// poller never relaunches it for the same run. A terminal suite status
/// finishes the run from any polling state.
#[must_use]
pub fn next_state(state: SuiteState, snapshot: &SuiteRunSnapshot) -> (SuiteState, PollAction) {
    if snapshot.status.is_terminal() {
        return (
            SuiteState::Finished,
            PollAction::Finish(snapshot.status.clone()),
        );
    }

    match state {
        SuiteState::Starting | SuiteState::AwaitingSetup => {
            let first_test_running =
                matches!(snapshot.first_test_status(), Some(SuiteStatus::Running));
            if snapshot.status == SuiteStatus::Running && first_test_running {
                (SuiteState::RunningTest, PollAction::Launch)
            } else {
                (SuiteState::AwaitingSetup, PollAction::Wait)
            }
        }
        SuiteState::RunningTest => (SuiteState::RunningTest, PollAction::Wait),
        SuiteState::Finished | SuiteState::Failed => (state, PollAction::Wait),
    }
}
