//! Session state and the notifications observers receive

use guardian::ProxyUsage;

/// Lifecycle state of the proxy session.
///
/// Transitions:
/// - NotReady/Ready/Paused/Error → Activating (start)
/// - Activating → Active (pass issued and valid now)
/// - Activating → Paused (usage exhausted)
/// - Activating → Error (transport failure or issuance failure)
/// - Activating → NotReady (start abandoned by stop)
/// - Active → Active (rotation)
/// - Active → Paused (rotation or usage refresh saw zero remaining)
/// - Active → Error (rotation failed)
/// - Active → Ready (stop)
/// - Paused → Active (resume rotation at quota reset)
/// - Paused → Ready (usage refresh saw quota available)
/// - Paused → NotReady (stop)
/// - NotReady → Ready (usage refresh saw quota available)
/// - any → NotReady (reset)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProxyState {
    #[default]
    NotReady,
    Ready,
    Activating,
    Active,
    Paused,
    Error,
}

impl ProxyState {
    pub const ALL: [ProxyState; 6] = [
        ProxyState::NotReady,
        ProxyState::Ready,
        ProxyState::Activating,
        ProxyState::Active,
        ProxyState::Paused,
        ProxyState::Error,
    ];

    /// State label for health/logging/metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyState::NotReady => "not_ready",
            ProxyState::Ready => "ready",
            ProxyState::Activating => "activating",
            ProxyState::Active => "active",
            ProxyState::Paused => "paused",
            ProxyState::Error => "error",
        }
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Broadcast to every subscriber of a manager.
///
/// A usage change is always delivered before the state change it causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    StateChanged {
        state: ProxyState,
        previous: ProxyState,
    },
    UsageChanged {
        usage: ProxyUsage,
    },
}
