//! Process lifecycle states and the legal transition table.
//!
//! Every mutation of a process's state goes through a single swap primitive
//! (see [`crate::process::Process`]); this module only defines which edges
//! that primitive will accept.

use serde::Serialize;

/// Lifecycle state of a managed backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    /// No child process exists.
    Stopped,
    /// Child spawned, waiting for the health check to pass.
    Starting,
    /// Serving requests.
    Ready,
    /// Draining in-flight requests and issuing sleep endpoints.
    SleepPending,
    /// Child alive but idle; GPU memory released by the backend.
    Asleep,
    /// Issuing wake endpoints and re-running the health check.
    Waking,
    /// Child is being terminated.
    Stopping,
    /// Terminal; the process will never be used again.
    Shutdown,
}

impl ProcessState {
    /// Whether the OS child is expected to be alive in this state.
    pub fn expects_child(self) -> bool {
        !matches!(self, ProcessState::Stopped | ProcessState::Shutdown)
    }

    /// Legal edges of the lifecycle graph. Anything not listed here is
    /// rejected by the swap primitive.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Stopped, Shutdown)
                | (Starting, Ready)
                | (Starting, Stopped)
                | (Ready, SleepPending)
                | (Ready, Stopping)
                | (SleepPending, Asleep)
                | (SleepPending, Stopping)
                | (Asleep, Waking)
                | (Asleep, Stopping)
                | (Waking, Ready)
                | (Waking, Stopping)
                | (Waking, Stopped)
                | (Stopping, Stopped)
                | (Stopping, Shutdown)
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::SleepPending => "sleepPending",
            ProcessState::Asleep => "asleep",
            ProcessState::Waking => "waking",
            ProcessState::Stopping => "stopping",
            ProcessState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Errors from the state-swap primitive.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum StateError {
    #[error("state is {actual}, expected {expected}")]
    Conflict {
        expected: ProcessState,
        actual: ProcessState,
    },

    #[error("illegal transition {from} -> {to}")]
    Illegal { from: ProcessState, to: ProcessState },
}

#[cfg(test)]
mod tests {
    use super::ProcessState::*;
    use super::*;

    const ALL: [ProcessState; 8] = [
        Stopped,
        Starting,
        Ready,
        SleepPending,
        Asleep,
        Waking,
        Stopping,
        Shutdown,
    ];

    #[test]
    fn transition_table_matches_lifecycle() {
        let legal = [
            (Stopped, Starting),
            (Stopped, Shutdown),
            (Starting, Ready),
            (Starting, Stopped),
            (Ready, SleepPending),
            (Ready, Stopping),
            (SleepPending, Asleep),
            (SleepPending, Stopping),
            (Asleep, Waking),
            (Asleep, Stopping),
            (Waking, Ready),
            (Waking, Stopping),
            (Waking, Stopped),
            (Stopping, Stopped),
            (Stopping, Shutdown),
        ];

        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn shutdown_is_terminal() {
        for to in ALL {
            assert!(!Shutdown.can_transition_to(to));
        }
    }

    #[test]
    fn child_liveness_per_state() {
        assert!(!Stopped.expects_child());
        assert!(!Shutdown.expects_child());
        for s in [Starting, Ready, SleepPending, Asleep, Waking, Stopping] {
            assert!(s.expects_child(), "{s} should hold a live child");
        }
    }
}
