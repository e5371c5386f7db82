//! Provider event decoding and planning.
//!
//! `plan` is a pure function over a decoded event and the entity state it
//! touches. It returns the commands to run; the engine executes them.

use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::state::SessionEvent;
use crate::types::{AuthorizationSession, Instrument, LockReason, NewTransaction, TransactionRecord};

/// Category recorded when neither the session nor the merchant supplies one
pub const UNKNOWN_CATEGORY: &str = "unknown";

#[derive(Debug, Deserialize)]
struct Envelope {
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireMerchant {
    #[serde(default)]
    descriptor: Option<String>,
    #[serde(default)]
    mcc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireActivity {
    token: String,
    card_token: String,
    /// Minor units (cents)
    amount: i64,
    #[serde(default)]
    merchant: Option<WireMerchant>,
}

/// Card activity carried by a transaction or authorization event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardActivity {
    /// Provider transaction/authorization token
    pub token: String,
    /// Provider card token
    pub card_ref: String,
    pub amount: Decimal,
    pub merchant_name: Option<String>,
    pub mcc: Option<String>,
}

impl From<WireActivity> for CardActivity {
    fn from(w: WireActivity) -> Self {
        let (merchant_name, mcc) = match w.merchant {
            Some(m) => (m.descriptor, m.mcc),
            None => (None, None),
        };
        Self {
            token: w.token,
            card_ref: w.card_token,
            amount: Decimal::new(w.amount, 2),
            merchant_name,
            mcc,
        }
    }
}

/// A decoded provider event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    TransactionCreated(CardActivity),
    TransactionSettled(CardActivity),
    /// A recorded transaction moved to declined. Only the record changes.
    TransactionDeclined(CardActivity),
    /// The provider declined an authorization on the card
    Declined(CardActivity),
    /// Well-formed but not an event this service acts on
    Unrecognized { event_type: String },
}

/// The body could not be decoded into an event
#[derive(Debug, thiserror::Error)]
#[error("malformed provider event: {0}")]
pub struct MalformedEvent(pub String);

impl ProviderEvent {
    pub fn decode(body: &[u8]) -> Result<Self, MalformedEvent> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| MalformedEvent(e.to_string()))?;

        let status = envelope
            .payload
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| s.to_ascii_uppercase());

        let kind = match (envelope.event_type.as_str(), status.as_deref()) {
            ("transaction.created", _) => Kind::Created,
            ("transaction.settled", _) | ("transaction.updated", Some("SETTLED")) => Kind::Settled,
            ("transaction.updated", Some("DECLINED")) => Kind::TransactionDeclined,
            ("authorization.updated", Some("DECLINED"))
            | ("authorization.declined", _) => Kind::Declined,
            _ => {
                return Ok(ProviderEvent::Unrecognized {
                    event_type: envelope.event_type,
                })
            }
        };

        let activity: WireActivity = serde_json::from_value(envelope.payload)
            .map_err(|e| MalformedEvent(format!("{}: {}", envelope.event_type, e)))?;
        let activity = CardActivity::from(activity);

        Ok(match kind {
            Kind::Created => ProviderEvent::TransactionCreated(activity),
            Kind::Settled => ProviderEvent::TransactionSettled(activity),
            Kind::TransactionDeclined => ProviderEvent::TransactionDeclined(activity),
            Kind::Declined => ProviderEvent::Declined(activity),
        })
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::TransactionCreated(_) => "transaction_created",
            ProviderEvent::TransactionSettled(_) => "transaction_settled",
            ProviderEvent::TransactionDeclined(_) => "transaction_declined",
            ProviderEvent::Declined(_) => "declined",
            ProviderEvent::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn activity(&self) -> Option<&CardActivity> {
        match self {
            ProviderEvent::TransactionCreated(a)
            | ProviderEvent::TransactionSettled(a)
            | ProviderEvent::TransactionDeclined(a)
            | ProviderEvent::Declined(a) => Some(a),
            ProviderEvent::Unrecognized { .. } => None,
        }
    }
}

enum Kind {
    Created,
    Settled,
    TransactionDeclined,
    Declined,
}

/// Entity state an event is planned against
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanContext<'a> {
    /// Instrument resolved from the event's card ref
    pub instrument: Option<&'a Instrument>,
    /// Transaction already recorded under the event's token
    pub existing: Option<&'a TransactionRecord>,
    /// Active session for the instrument's owner, if any
    pub active_session: Option<&'a AuthorizationSession>,
}

/// Side effect the engine runs for an event
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RecordTransaction(NewTransaction),
    SettleTransaction(NewTransaction),
    DeclineTransaction(NewTransaction),
    CloseSession {
        session_id: Uuid,
        event: SessionEvent,
    },
    /// Follows the session close when the plan has one and runs only if that
    /// close transitioned. Without a close it runs only if the event changed
    /// state and no session is active on the instrument.
    LockInstrument {
        instrument_id: Uuid,
        reason: LockReason,
    },
    DisarmTimer {
        session_id: Uuid,
    },
}

/// Transaction category: the session's constraint, else the merchant MCC
pub fn resolve_category(session: Option<&AuthorizationSession>, mcc: Option<&str>) -> String {
    session
        .and_then(|s| s.category.clone())
        .or_else(|| mcc.filter(|m| !m.is_empty()).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
}

fn new_transaction(
    activity: &CardActivity,
    instrument: &Instrument,
    ctx: &PlanContext<'_>,
) -> NewTransaction {
    match ctx.existing {
        Some(existing) => NewTransaction {
            session_id: existing.session_id,
            instrument_id: existing.instrument_id,
            user_id: existing.user_id,
            provider_txn_id: existing.provider_txn_id.clone(),
            amount: existing.amount,
            category: existing.category.clone(),
            merchant_name: existing.merchant_name.clone(),
        },
        None => NewTransaction {
            session_id: ctx.active_session.map(|s| s.id),
            instrument_id: instrument.id,
            user_id: instrument.user_id,
            provider_txn_id: activity.token.clone(),
            amount: activity.amount,
            category: resolve_category(ctx.active_session, activity.mcc.as_deref()),
            merchant_name: activity.merchant_name.clone(),
        },
    }
}

/// Plan the commands for an event.
///
/// Events for unknown instruments and unrecognized events plan nothing.
pub fn plan(event: &ProviderEvent, ctx: &PlanContext<'_>) -> Vec<Command> {
    let (Some(activity), Some(instrument)) = (event.activity(), ctx.instrument) else {
        return Vec::new();
    };
    let txn = new_transaction(activity, instrument, ctx);

    match event {
        ProviderEvent::TransactionCreated(_) => vec![Command::RecordTransaction(txn)],
        ProviderEvent::TransactionDeclined(_) => vec![Command::DeclineTransaction(txn)],
        ProviderEvent::TransactionSettled(_) => {
            let owning = txn.session_id.or(ctx.active_session.map(|s| s.id));
            let mut commands = vec![Command::SettleTransaction(txn)];
            if let Some(session_id) = owning {
                commands.push(Command::CloseSession {
                    session_id,
                    event: SessionEvent::Settle,
                });
            }
            commands.push(Command::LockInstrument {
                instrument_id: instrument.id,
                reason: LockReason::Settled,
            });
            if let Some(session_id) = owning {
                commands.push(Command::DisarmTimer { session_id });
            }
            commands
        }
        ProviderEvent::Declined(_) => {
            let mut commands = vec![Command::DeclineTransaction(txn)];
            if let Some(session) = ctx.active_session {
                commands.push(Command::CloseSession {
                    session_id: session.id,
                    event: SessionEvent::Decline,
                });
            }
            commands.push(Command::LockInstrument {
                instrument_id: instrument.id,
                reason: LockReason::Declined,
            });
            if let Some(session) = ctx.active_session {
                commands.push(Command::DisarmTimer {
                    session_id: session.id,
                });
            }
            commands
        }
        ProviderEvent::Unrecognized { .. } => Vec::new(),
    }
}
