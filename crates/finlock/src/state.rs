use serde::{Deserialize, Serialize};

/// Status of an authorization session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Instrument unlocked, window open
    Active,
    /// Closed by a settled transaction (terminal)
    Completed,
    /// Closed by an explicit lock request (terminal)
    Cancelled,
    /// Closed by a provider decline, or by a failed unlock (terminal)
    Declined,
    /// Closed because the window elapsed (terminal)
    Expired,
}

impl SessionStatus {
    /// Whether this is a terminal status (no further transitions accepted)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Declined => "declined",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "declined" => Some(SessionStatus::Declined),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Triggers that close a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transaction drawn against the session settled
    Settle,
    /// The provider declined an authorization on the instrument
    Decline,
    /// Unlocking the instrument failed after the session was persisted
    UnlockFailed,
    /// The user asked for the instrument to be locked
    CancelRequest,
    /// The window elapsed
    Expire,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Settle => write!(f, "settle"),
            SessionEvent::Decline => write!(f, "decline"),
            SessionEvent::UnlockFailed => write!(f, "unlock_failed"),
            SessionEvent::CancelRequest => write!(f, "cancel_request"),
            SessionEvent::Expire => write!(f, "expire"),
        }
    }
}

impl SessionEvent {
    /// Terminal status this event drives an active session into
    pub fn target(&self) -> SessionStatus {
        match self {
            SessionEvent::Settle => SessionStatus::Completed,
            SessionEvent::Decline | SessionEvent::UnlockFailed => SessionStatus::Declined,
            SessionEvent::CancelRequest => SessionStatus::Cancelled,
            SessionEvent::Expire => SessionStatus::Expired,
        }
    }
}

/// Result of applying an event to a stored status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The session moves from active into the given terminal status
    Close(SessionStatus),
    /// The session is already terminal; the event is absorbed
    NoOp,
}

/// Apply an event to the current status.
///
/// Pure function with no side effects. Every event closes an active session,
/// and every event on a terminal session is a no-op rather than an error, so
/// duplicate or racing triggers converge on whichever one landed first.
pub fn apply_event(current: SessionStatus, event: SessionEvent) -> Transition {
    if current.is_terminal() {
        return Transition::NoOp;
    }
    Transition::Close(event.target())
}

/// Status of the local mirror of the provider card state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    Locked,
    Unlocked,
}

impl InstrumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentStatus::Locked => "locked",
            InstrumentStatus::Unlocked => "unlocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "locked" => Some(InstrumentStatus::Locked),
            "unlocked" => Some(InstrumentStatus::Unlocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Settled,
    Declined,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Settled => "settled",
            TransactionStatus::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "settled" => Some(TransactionStatus::Settled),
            "declined" => Some(TransactionStatus::Declined),
            _ => None,
        }
    }

    /// Settled and declined records never move again
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [SessionEvent; 5] = [
        SessionEvent::Settle,
        SessionEvent::Decline,
        SessionEvent::UnlockFailed,
        SessionEvent::CancelRequest,
        SessionEvent::Expire,
    ];

    #[test]
    fn test_active_settle_completes() {
        assert_eq!(
            apply_event(SessionStatus::Active, SessionEvent::Settle),
            Transition::Close(SessionStatus::Completed)
        );
    }

    #[test]
    fn test_active_decline_declines() {
        assert_eq!(
            apply_event(SessionStatus::Active, SessionEvent::Decline),
            Transition::Close(SessionStatus::Declined)
        );
    }

    #[test]
    fn test_active_unlock_failure_declines() {
        assert_eq!(
            apply_event(SessionStatus::Active, SessionEvent::UnlockFailed),
            Transition::Close(SessionStatus::Declined)
        );
    }

    #[test]
    fn test_active_cancel_request_cancels() {
        assert_eq!(
            apply_event(SessionStatus::Active, SessionEvent::CancelRequest),
            Transition::Close(SessionStatus::Cancelled)
        );
    }

    #[test]
    fn test_active_expire_expires() {
        assert_eq!(
            apply_event(SessionStatus::Active, SessionEvent::Expire),
            Transition::Close(SessionStatus::Expired)
        );
    }

    #[test]
    fn test_terminal_statuses_absorb_every_event() {
        for status in [
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Declined,
            SessionStatus::Expired,
        ] {
            for event in ALL_EVENTS {
                assert_eq!(
                    apply_event(status, event),
                    Transition::NoOp,
                    "{status} should absorb {event}"
                );
            }
        }
    }

    #[test]
    fn test_every_target_is_terminal() {
        for event in ALL_EVENTS {
            assert!(event.target().is_terminal());
        }
    }

    #[test]
    fn test_session_status_round_trips_through_str() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Declined,
            SessionStatus::Expired,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("frozen"), None);
    }

    #[test]
    fn test_transaction_status_finality() {
        assert!(!TransactionStatus::Pending.is_final());
        assert!(TransactionStatus::Settled.is_final());
        assert!(TransactionStatus::Declined.is_final());
    }

    #[test]
    fn test_instrument_status_display() {
        assert_eq!(InstrumentStatus::Locked.to_string(), "locked");
        assert_eq!(InstrumentStatus::Unlocked.to_string(), "unlocked");
    }
}
