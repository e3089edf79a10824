//! Pure state machine for agent lifecycle control
//!
//! This module implements a pure functional state machine with NO I/O.
//! All transitions are deterministic and testable.
//!
//! Key design principles:
//! - Pure function: transition(status, event) -> (status, actions)
//! - No async, no I/O, no dependencies on other foreman crates' runtime
//! - Unrecognized transitions are conservative no-ops (never panic)
//! - Critical is terminal until an explicit ManualReset

use foreman_core::AgentStatus;

/// Events fed into the state machine by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisionEvent {
    /// The supervisor wants the agent process started
    SpawnRequested,
    /// The launcher reported a live process
    Spawned { pid: u32 },
    /// The launcher failed to start the process
    SpawnFailed { reason: String },
    /// The agent showed signs of life this cycle
    HeartbeatSeen,
    /// No heartbeat within the liveness window
    HeartbeatMissed,
    /// Restart budget allowed a restart
    RestartApproved,
    /// Restart budget throttled the restart; retry on a later cycle
    RestartDenied { retry_after_secs: i64 },
    /// Restart budget exhausted inside the rolling window
    BudgetExhausted,
    /// Operator cleared a Critical agent
    ManualReset,
    /// Orderly shutdown of the agent
    StopRequested,
}

/// Side effects the supervisor executes after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Launch the agent process
    Launch,
    /// Kill the agent's current process
    Kill,
    /// Rewrite the agent record in the state store
    PersistStatus,
    /// Emit a deduplicated operator escalation
    Alert { key: String, message: String },
}

/// Pure state transition function.
///
/// Takes the agent's current status and an event, returns the new status and
/// the actions to execute. Unrecognized combinations leave the status
/// unchanged with no actions; this function never panics.
pub fn transition(
    agent: &str,
    status: AgentStatus,
    event: SupervisionEvent,
) -> (AgentStatus, Vec<SupervisorAction>) {
    use AgentStatus::*;
    use SupervisionEvent as E;
    use SupervisorAction as A;

    // Critical is terminal: only a manual reset leaves it
    if status == Critical {
        return match event {
            E::ManualReset => (Unknown, vec![A::PersistStatus]),
            _ => (Critical, vec![]),
        };
    }

    match (status, event) {
        (Unknown | Stopped, E::SpawnRequested) => {
            (Starting, vec![A::Launch, A::PersistStatus])
        }

        (Starting | Restarting, E::Spawned { .. }) => (Available, vec![A::PersistStatus]),

        (Starting | Restarting, E::SpawnFailed { .. }) => (Stopped, vec![A::PersistStatus]),

        (Available | Busy | Idle, E::HeartbeatMissed) => {
            (Unresponsive, vec![A::PersistStatus])
        }

        (Unresponsive, E::HeartbeatSeen) => (Available, vec![A::PersistStatus]),

        // Restart of a process that may still be running: kill first
        (Available | Busy | Idle | Unresponsive, E::RestartApproved) => {
            (Restarting, vec![A::Kill, A::Launch, A::PersistStatus])
        }

        (Unknown | Stopped | Starting, E::RestartApproved) => {
            (Restarting, vec![A::Launch, A::PersistStatus])
        }

        (status, E::RestartDenied { .. }) => (status, vec![]),

        (_, E::BudgetExhausted) => (
            Critical,
            vec![
                A::PersistStatus,
                A::Alert {
                    key: format!("agent_critical:{}", agent),
                    message: format!(
                        "agent_critical: {} exhausted its restart budget; automatic recovery disabled until manual reset",
                        agent
                    ),
                },
            ],
        ),

        (_, E::StopRequested) => (Stopped, vec![A::Kill, A::PersistStatus]),

        // Everything else: conservative no-op
        (status, _) => (status, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentStatus::*;

    #[test]
    fn test_spawn_path() {
        let (status, actions) = transition("builder", Stopped, SupervisionEvent::SpawnRequested);
        assert_eq!(status, Starting);
        assert!(actions.contains(&SupervisorAction::Launch));

        let (status, actions) =
            transition("builder", status, SupervisionEvent::Spawned { pid: 4242 });
        assert_eq!(status, Available);
        assert_eq!(actions, vec![SupervisorAction::PersistStatus]);
    }

    #[test]
    fn test_spawn_failure_goes_stopped() {
        let (status, _) = transition(
            "builder",
            Starting,
            SupervisionEvent::SpawnFailed {
                reason: "no such file".to_string(),
            },
        );
        assert_eq!(status, Stopped);
    }

    #[test]
    fn test_unresponsive_round_trip() {
        let (status, _) = transition("builder", Busy, SupervisionEvent::HeartbeatMissed);
        assert_eq!(status, Unresponsive);

        let (status, _) = transition("builder", status, SupervisionEvent::HeartbeatSeen);
        assert_eq!(status, Available);
    }

    #[test]
    fn test_restart_of_live_process_kills_first() {
        let (status, actions) =
            transition("builder", Unresponsive, SupervisionEvent::RestartApproved);
        assert_eq!(status, Restarting);
        assert_eq!(
            actions,
            vec![
                SupervisorAction::Kill,
                SupervisorAction::Launch,
                SupervisorAction::PersistStatus,
            ]
        );
    }

    #[test]
    fn test_restart_of_dead_process_skips_kill() {
        let (status, actions) = transition("builder", Stopped, SupervisionEvent::RestartApproved);
        assert_eq!(status, Restarting);
        assert!(!actions.contains(&SupervisorAction::Kill));
        assert!(actions.contains(&SupervisorAction::Launch));
    }

    #[test]
    fn test_budget_exhaustion_is_critical_with_alert() {
        let (status, actions) =
            transition("builder", Restarting, SupervisionEvent::BudgetExhausted);
        assert_eq!(status, Critical);

        let alert = actions.iter().find_map(|a| match a {
            SupervisorAction::Alert { key, message } => Some((key, message)),
            _ => None,
        });
        let (key, message) = alert.expect("exhaustion must alert");
        assert_eq!(key, "agent_critical:builder");
        assert!(message.contains("agent_critical"));
    }

    #[test]
    fn test_critical_is_terminal_until_reset() {
        for event in [
            SupervisionEvent::SpawnRequested,
            SupervisionEvent::RestartApproved,
            SupervisionEvent::HeartbeatSeen,
            SupervisionEvent::BudgetExhausted,
        ] {
            let (status, actions) = transition("builder", Critical, event);
            assert_eq!(status, Critical);
            assert!(actions.is_empty());
        }

        let (status, _) = transition("builder", Critical, SupervisionEvent::ManualReset);
        assert_eq!(status, Unknown);
    }

    #[test]
    fn test_restart_denied_is_a_no_op() {
        let (status, actions) = transition(
            "builder",
            Unresponsive,
            SupervisionEvent::RestartDenied {
                retry_after_secs: 42,
            },
        );
        assert_eq!(status, Unresponsive);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_stop_from_any_live_status() {
        for status in [Starting, Available, Busy, Idle, Unresponsive, Restarting] {
            let (next, actions) = transition("builder", status, SupervisionEvent::StopRequested);
            assert_eq!(next, Stopped);
            assert!(actions.contains(&SupervisorAction::Kill));
        }
    }

    #[test]
    fn test_unrecognized_transition_never_panics() {
        // Spawned while already Available: stale launcher echo, ignore
        let (status, actions) =
            transition("builder", Available, SupervisionEvent::Spawned { pid: 1 });
        assert_eq!(status, Available);
        assert!(actions.is_empty());

        let (status, actions) = transition("builder", Unknown, SupervisionEvent::HeartbeatMissed);
        assert_eq!(status, Unknown);
        assert!(actions.is_empty());
    }
}
