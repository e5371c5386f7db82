use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::time::Duration;
use tracing::{debug, info, warn};

use finlock::error::ProviderError;
use finlock::provider::CardProvider;
use finlock::types::{ProviderCard, SpendControls};

use crate::types::*;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SANDBOX_BASE_URL: &str = "https://sandbox.lithic.com";
const MIN_REQUEST_GAP: Duration = Duration::from_millis(50);

/// Lithic REST client
pub struct LithicClient {
    http: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    last_request: tokio::sync::Mutex<tokio::time::Instant>,
}

impl LithicClient {
    /// Create a new Lithic client
    ///
    /// `base_url` should be either:
    /// - `https://sandbox.lithic.com` for sandbox
    /// - `https://api.lithic.com` for production
    pub fn new(api_key: String, base_url: String) -> Result<Self, ProviderError> {
        Self::with_timeout(api_key, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            last_request: tokio::sync::Mutex::new(tokio::time::Instant::now()),
        })
    }

    /// Enforce minimum gap between requests
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < MIN_REQUEST_GAP {
            tokio::time::sleep(MIN_REQUEST_GAP - elapsed).await;
        }
        *last = tokio::time::Instant::now();
    }

    fn send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            ProviderError::Connection(e.to_string())
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ProviderError> {
        self.throttle().await;
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET request");

        let resp = self
            .http
            .get(&url)
            .header("Authorization", &self.api_key)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        check_status(resp, path).await
    }

    async fn patch<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        self.throttle().await;
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "PATCH request");

        let resp = self
            .http
            .patch(&url)
            .header("Authorization", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        check_status(resp, path).await
    }
}

/// Map non-2xx responses onto provider errors
async fn check_status(resp: reqwest::Response, path: &str) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry_after * 1000,
        });
    }

    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<LithicErrorBody>(&text).ok();
    let request_id = body.as_ref().and_then(|b| b.debugging_request_id.clone());
    if let Some(request_id) = &request_id {
        warn!(%status, path, request_id = %request_id, "provider request failed");
    }
    let mut message = body.and_then(|b| b.message).unwrap_or(text);
    if let Some(request_id) = request_id {
        message = format!("{} (request {})", message, request_id);
    }

    Err(match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("HTTP {}: {}", status, message))
        }
        s if s.is_client_error() => ProviderError::Rejected {
            reason: format!("HTTP {}: {}", status, message),
        },
        _ => ProviderError::Unexpected(format!("HTTP {}: {}", status, message)),
    })
}

/// Dollars to whole cents, rounding half away from zero
fn to_cents(amount: Decimal) -> Result<i64, ProviderError> {
    (amount * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ProviderError::Rejected {
            reason: format!("spend limit {} out of range", amount),
        })
}

/// A category is forwarded as an MCC restriction only when it is one
fn as_mcc(category: &str) -> Option<String> {
    (category.len() == 4 && category.bytes().all(|b| b.is_ascii_digit()))
        .then(|| category.to_string())
}

fn unlock_body(controls: &SpendControls) -> Result<LithicCardUpdate, ProviderError> {
    Ok(LithicCardUpdate {
        state: "OPEN",
        spend_limit: Some(to_cents(controls.spend_limit)?),
        spend_limit_duration: Some("TRANSACTION"),
        allowed_mcc: controls
            .category
            .as_deref()
            .and_then(as_mcc)
            .map(|mcc| vec![mcc]),
        memo: controls
            .merchant
            .as_ref()
            .map(|m| format!("authorized for {}", m)),
    })
}

#[async_trait]
impl CardProvider for LithicClient {
    async fn unlock(&self, card_ref: &str, controls: &SpendControls) -> Result<(), ProviderError> {
        let body = unlock_body(controls)?;
        let resp = self.patch(&format!("/v1/cards/{}", card_ref), &body).await?;
        let card: LithicCard = resp
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(e.to_string()))?;
        if card.state != "OPEN" {
            warn!(card_ref, state = %card.state, "unlock returned unexpected card state");
            return Err(ProviderError::Unexpected(format!(
                "card {} is {} after unlock",
                card_ref, card.state
            )));
        }
        info!(card_ref, spend_limit = ?body.spend_limit, "card opened");
        Ok(())
    }

    async fn lock(&self, card_ref: &str) -> Result<(), ProviderError> {
        let body = LithicCardUpdate {
            state: "PAUSED",
            ..Default::default()
        };
        self.patch(&format!("/v1/cards/{}", card_ref), &body).await?;
        info!(card_ref, "card paused");
        Ok(())
    }

    async fn retrieve(&self, card_ref: &str) -> Result<ProviderCard, ProviderError> {
        let resp = self.get(&format!("/v1/cards/{}", card_ref)).await?;
        let card: LithicCard = resp
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(e.to_string()))?;
        Ok(card.into())
    }
}

impl std::fmt::Debug for LithicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LithicClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
