use std::sync::Arc;

use tracing::debug;

use crate::errors::ApiError;
use crate::store::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    /// The key has no usage limit; nothing was written.
    Unlimited,
    Consumed { remaining: u64 },
    Exhausted,
}

/// Decrements a key's remaining uses with a conditional write keyed on the
/// last observed value, re-reading and retrying when another consumer won.
pub struct QuotaTracker {
    store: Arc<dyn CredentialStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// `current` is the caller's (possibly cached, possibly stale) view.
    /// Every failed write means some other consumer succeeded, so this
    /// terminates once the counter reaches zero at the latest.
    pub async fn consume(&self, key_id: &str, current: Option<u64>) -> Result<QuotaOutcome, ApiError> {
        let mut observed = current;

        loop {
            let remaining = match observed {
                None => return Ok(QuotaOutcome::Unlimited),
                Some(0) => return Ok(QuotaOutcome::Exhausted),
                Some(remaining) => remaining,
            };

            if self
                .store
                .update_remaining(key_id, remaining, remaining - 1)
                .await?
            {
                return Ok(QuotaOutcome::Consumed {
                    remaining: remaining - 1,
                });
            }

            debug!(key_id, remaining, "stale remaining count, re-reading");
            observed = match self.store.find_by_id(key_id).await? {
                Some(key) => key.remaining,
                None => {
                    return Err(ApiError::Internal(format!(
                        "key {} disappeared during quota update",
                        key_id
                    )))
                }
            };
        }
    }
}
