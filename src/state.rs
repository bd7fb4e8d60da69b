use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a session ended in [`ConnectionState::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// No transport backend or adapter is present
    LinkUnavailable,
    /// The link dropped right after it was established; the ring is owned elsewhere
    PeerBusy,
    /// Pairing failed or never completed
    BondRejected,
    /// A required channel is missing; this is not the expected device
    ProtocolMismatch,
    /// The connection attempt exceeded its wall-clock budget
    Timeout,
    /// Automatic reconnection or subscription retries ran out
    RetriesExhausted,
}

impl FailureReason {
    /// Whether a fresh connection attempt could plausibly succeed
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::PeerBusy | Self::ProtocolMismatch)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkUnavailable => write!(f, "link unavailable"),
            Self::PeerBusy => write!(f, "peer busy"),
            Self::BondRejected => write!(f, "bond rejected"),
            Self::ProtocolMismatch => write!(f, "protocol mismatch"),
            Self::Timeout => write!(f, "timeout"),
            Self::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

/// Lifecycle state of a ring session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing in progress
    Idle,
    /// Discovering nearby devices
    Scanning,
    /// Opening the physical link
    Connecting,
    /// Pairing with the device
    Bonding,
    /// Locating the required channels
    DiscoveringServices,
    /// Enabling notifications and running the readiness handshake
    Subscribing,
    /// Streaming validated data; commands are accepted
    Ready,
    /// Link is down; either waiting to reconnect or torn down by the caller
    Disconnected,
    /// Terminal failure
    Failed(FailureReason),
}

impl ConnectionState {
    /// Whether the session is between connect intent and `Ready`
    #[must_use]
    pub const fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Bonding | Self::DiscoveringServices | Self::Subscribing
        )
    }

    /// Whether commands are accepted
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the session failed for good
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Compute the state that follows `event`.
    ///
    /// The function is total: any pair not listed in the lifecycle leaves the
    /// state unchanged. `Failed` absorbs every event.
    #[must_use]
    pub fn on(self, event: SessionEvent) -> Self {
        use ConnectionState as S;
        use SessionEvent as E;

        match (self, event) {
            (S::Failed(_), _) => self,
            (_, E::DisconnectRequested) => S::Disconnected,

            (S::Idle, E::ScanStarted) => S::Scanning,
            (S::Scanning, E::ScanFinished) => S::Idle,

            (S::Idle | S::Disconnected, E::ConnectRequested) => S::Connecting,
            (S::Connecting, E::LinkOpened { bonded: false }) => S::Bonding,
            (S::Connecting, E::LinkOpened { bonded: true }) | (S::Bonding, E::BondSucceeded) => {
                S::DiscoveringServices
            }
            (S::Bonding, E::BondFailed) => S::Failed(FailureReason::BondRejected),
            (S::DiscoveringServices, E::ChannelsLocated) => S::Subscribing,
            (S::DiscoveringServices, E::ChannelMissing) => {
                S::Failed(FailureReason::ProtocolMismatch)
            }
            (S::Subscribing, E::Subscribed) => S::Ready,
            (S::Subscribing, E::SubscriptionFailed) | (S::Disconnected, E::RetriesExhausted) => {
                S::Failed(FailureReason::RetriesExhausted)
            }

            (s, E::LinkLost { early: true }) if s.is_establishing() || s.is_ready() => {
                S::Failed(FailureReason::PeerBusy)
            }
            (s, E::LinkLost { early: false }) if s.is_establishing() || s.is_ready() => {
                S::Disconnected
            }
            (s, E::TimedOut) if s.is_establishing() => S::Failed(FailureReason::Timeout),
            (s, E::AttemptFailed) if s.is_establishing() => S::Disconnected,
            (s, E::Unavailable) if s.is_establishing() || s == S::Idle => {
                S::Failed(FailureReason::LinkUnavailable)
            }

            _ => self,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Bonding => write!(f, "Bonding"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Inputs that drive [`ConnectionState::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A scan started
    ScanStarted,
    /// A scan finished
    ScanFinished,
    /// The caller (or the reconnect loop) wants a link
    ConnectRequested,
    /// The link is up; `bonded` reports the platform pairing state
    LinkOpened {
        /// Whether the device was already paired
        bonded: bool,
    },
    /// Pairing completed
    BondSucceeded,
    /// Pairing failed or timed out
    BondFailed,
    /// Every required channel was found
    ChannelsLocated,
    /// A required channel is absent
    ChannelMissing,
    /// Notifications are enabled and the handshake was acknowledged
    Subscribed,
    /// A subscription kept failing past its retry budget
    SubscriptionFailed,
    /// The transport reported link loss
    LinkLost {
        /// Whether the loss happened inside the peer-busy window
        early: bool,
    },
    /// The connection attempt ran out of time
    TimedOut,
    /// The attempt failed for a retryable reason
    AttemptFailed,
    /// No transport backend is present
    Unavailable,
    /// The reconnect budget is spent
    RetriesExhausted,
    /// The caller asked to tear the session down
    DisconnectRequested,
}

/// One observed state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// State before the event
    pub from: ConnectionState,
    /// State after the event
    pub to: ConnectionState,
    /// Event that caused the change
    pub event: SessionEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[SessionEvent]) -> ConnectionState {
        events
            .iter()
            .fold(ConnectionState::Idle, |state, event| state.on(*event))
    }

    #[test]
    fn test_paired_device_reaches_ready() {
        let state = run(&[
            SessionEvent::ConnectRequested,
            SessionEvent::LinkOpened { bonded: true },
            SessionEvent::ChannelsLocated,
            SessionEvent::Subscribed,
        ]);
        assert_eq!(state, ConnectionState::Ready);
    }

    #[test]
    fn test_unpaired_device_goes_through_bonding() {
        let state = ConnectionState::Connecting.on(SessionEvent::LinkOpened { bonded: false });
        assert_eq!(state, ConnectionState::Bonding);
        assert_eq!(
            state.on(SessionEvent::BondSucceeded),
            ConnectionState::DiscoveringServices
        );
        assert_eq!(
            state.on(SessionEvent::BondFailed),
            ConnectionState::Failed(FailureReason::BondRejected)
        );
    }

    #[test]
    fn test_failure_edges() {
        assert_eq!(
            ConnectionState::DiscoveringServices.on(SessionEvent::ChannelMissing),
            ConnectionState::Failed(FailureReason::ProtocolMismatch)
        );
        assert_eq!(
            ConnectionState::Subscribing.on(SessionEvent::SubscriptionFailed),
            ConnectionState::Failed(FailureReason::RetriesExhausted)
        );
        assert_eq!(
            ConnectionState::Bonding.on(SessionEvent::TimedOut),
            ConnectionState::Failed(FailureReason::Timeout)
        );
        assert_eq!(
            ConnectionState::Disconnected.on(SessionEvent::RetriesExhausted),
            ConnectionState::Failed(FailureReason::RetriesExhausted)
        );
        assert_eq!(
            ConnectionState::Connecting.on(SessionEvent::Unavailable),
            ConnectionState::Failed(FailureReason::LinkUnavailable)
        );
    }

    #[test]
    fn test_link_loss_classification() {
        assert_eq!(
            ConnectionState::Connecting.on(SessionEvent::LinkLost { early: true }),
            ConnectionState::Failed(FailureReason::PeerBusy)
        );
        assert_eq!(
            ConnectionState::Ready.on(SessionEvent::LinkLost { early: false }),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::Disconnected.on(SessionEvent::ConnectRequested),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_disconnect_from_any_live_state() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Bonding,
            ConnectionState::Subscribing,
            ConnectionState::Ready,
        ] {
            assert_eq!(
                state.on(SessionEvent::DisconnectRequested),
                ConnectionState::Disconnected
            );
        }
    }

    #[test]
    fn test_failed_is_absorbing() {
        let failed = ConnectionState::Failed(FailureReason::PeerBusy);
        assert_eq!(failed.on(SessionEvent::DisconnectRequested), failed);
        assert_eq!(failed.on(SessionEvent::ConnectRequested), failed);
    }

    #[test]
    fn test_unlisted_pairs_are_ignored() {
        assert_eq!(
            ConnectionState::Ready.on(SessionEvent::ChannelsLocated),
            ConnectionState::Ready
        );
        assert_eq!(
            ConnectionState::Idle.on(SessionEvent::Subscribed),
            ConnectionState::Idle
        );
        assert_eq!(
            ConnectionState::Ready.on(SessionEvent::TimedOut),
            ConnectionState::Ready
        );
    }

    #[test]
    fn test_retryable_reasons() {
        assert!(!FailureReason::PeerBusy.is_retryable());
        assert!(!FailureReason::ProtocolMismatch.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(FailureReason::RetriesExhausted.is_retryable());
    }
}
