use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{ProviderCard, SpendControls};

/// Trait for card-issuing provider adapters.
///
/// Every call is idempotent by contract: unlocking an open card or locking a
/// paused card succeeds without changing anything. Implementations own
/// authentication, rate limiting, and mapping to the provider's wire format.
#[async_trait]
pub trait CardProvider: Send + Sync {
    /// Set the card to an open, spendable state under the given controls.
    async fn unlock(&self, card_ref: &str, controls: &SpendControls) -> Result<(), ProviderError>;

    /// Set the card to a paused state. Safe to call on an already paused card.
    async fn lock(&self, card_ref: &str) -> Result<(), ProviderError>;

    /// Fetch the provider's current view of the card.
    async fn retrieve(&self, card_ref: &str) -> Result<ProviderCard, ProviderError>;
}
