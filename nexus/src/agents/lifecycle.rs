//! Agent Lifecycle Management
//!
//! Runtime state machine for registered agents:
//!
//! ```text
//! STARTING -> ACTIVE <-> THROTTLED
//!     \          |          /
//!      `---> STOPPING <----'
//!                |
//!             STOPPED
//!
//! any non-terminal state -> CRASHED -> STARTING (restart) | STOPPED (budget exhausted)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current status of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Registered, waiting for the first heartbeat
    Starting,

    /// Heartbeating and receiving messages
    Active,

    /// Missed heartbeats or saturated mailbox
    Throttled,

    /// Unregister in progress
    Stopping,

    /// Terminal
    Stopped,

    /// Liveness timeout or unhandled fault
    Crashed,
}

impl AgentStatus {
    /// Check whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;

        match (self, next) {
            (Starting, Active) | (Starting, Stopping) => true,
            (Active, Throttled) | (Active, Stopping) => true,
            (Throttled, Active) | (Throttled, Stopping) => true,
            (Stopping, Stopped) => true,
            (Crashed, Starting) | (Crashed, Stopped) => true,
            (Stopped, _) | (Crashed, _) => false,
            (_, Crashed) => true,
            _ => false,
        }
    }

    /// Statuses that block a new registration under the same id
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AgentStatus::Starting
                | AgentStatus::Active
                | AgentStatus::Throttled
                | AgentStatus::Stopping
        )
    }

    /// Statuses the liveness monitor still watches
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            AgentStatus::Starting | AgentStatus::Active | AgentStatus::Throttled
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Starting => "STARTING",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Throttled => "THROTTLED",
            AgentStatus::Stopping => "STOPPING",
            AgentStatus::Stopped => "STOPPED",
            AgentStatus::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

/// Why an agent was throttled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    MissedHeartbeats,
    MailboxSaturated,
}
