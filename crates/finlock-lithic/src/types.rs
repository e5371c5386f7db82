use serde::{Deserialize, Serialize};

use finlock::types::{ProviderCard, ProviderCardState};

/// Body for `PATCH /v1/cards/{token}`
#[derive(Debug, Default, Serialize)]
pub struct LithicCardUpdate {
    pub state: &'static str,
    /// Per-transaction limit in cents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_limit_duration: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mcc: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Card object returned by the cards endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct LithicCard {
    pub token: String,
    pub state: String,
    #[serde(default)]
    pub last_four: Option<String>,
    #[serde(default)]
    pub exp_month: Option<String>,
    #[serde(default)]
    pub exp_year: Option<String>,
    #[serde(default)]
    pub spend_limit: Option<i64>,
}

/// Error body returned on non-2xx responses
#[derive(Debug, Deserialize)]
pub struct LithicErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub debugging_request_id: Option<String>,
}

impl LithicCard {
    pub fn card_state(&self) -> ProviderCardState {
        match self.state.as_str() {
            "OPEN" => ProviderCardState::Open,
            "PAUSED" => ProviderCardState::Paused,
            // CLOSED, PENDING_FULFILLMENT, PENDING_ACTIVATION: not spendable
            _ => ProviderCardState::Closed,
        }
    }
}

impl From<LithicCard> for ProviderCard {
    fn from(card: LithicCard) -> Self {
        ProviderCard {
            state: card.card_state(),
            token: card.token,
            last_four: card.last_four,
            exp_month: card.exp_month,
            exp_year: card.exp_year,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_omits_unset_controls() {
        let body = LithicCardUpdate {
            state: "PAUSED",
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "PAUSED" }));
    }

    #[test]
    fn test_card_state_mapping() {
        let card: LithicCard = serde_json::from_value(serde_json::json!({
            "token": "card-1",
            "state": "PENDING_FULFILLMENT"
        }))
        .unwrap();
        assert_eq!(card.card_state(), ProviderCardState::Closed);

        let card: LithicCard = serde_json::from_value(serde_json::json!({
            "token": "card-1",
            "state": "OPEN",
            "last_four": "4242",
            "exp_month": "06",
            "exp_year": "2029"
        }))
        .unwrap();
        let provider: ProviderCard = card.into();
        assert_eq!(provider.state, ProviderCardState::Open);
        assert_eq!(provider.masked_number().as_deref(), Some("****-****-****-4242"));
    }
}
