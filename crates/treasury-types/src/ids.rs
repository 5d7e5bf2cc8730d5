//! Identifiers used throughout the treasury engine.
//!
//! Entity IDs use UUIDv7 for time-ordered sorting and render with a short
//! type prefix (`po_`, `batch_`, ...) so they are easy to spot in logs.
//! Claim tokens are the exception: they are opaque secrets drawn from the
//! OS random number generator.

use std::fmt;

use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::CLAIM_TOKEN_LEN;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            #[must_use]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Display prefix for this identifier kind.
            pub const PREFIX: &'static str = $prefix;
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0.simple())
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a merchant account (one treasury balance per merchant).
    MerchantId,
    "mch_"
);

prefixed_id!(
    /// Identifier of a single recipient payout.
    PayoutId,
    "po_"
);

prefixed_id!(
    /// Identifier of a payout batch.
    BatchId,
    "batch_"
);

prefixed_id!(
    /// Identifier of a treasury journal row.
    TransactionId,
    "ttx_"
);

prefixed_id!(
    /// Identifier of an outbound webhook event.
    EventId,
    "evt_"
);

prefixed_id!(
    /// Identifier of one delivery of an event to one endpoint.
    DeliveryId,
    "del_"
);

prefixed_id!(
    /// Identifier of a registered webhook endpoint.
    EndpointId,
    "whk_"
);

// ---------------------------------------------------------------------------
// ClaimToken
// ---------------------------------------------------------------------------

/// Unguessable secret that authorizes exactly one payout's claim.
///
/// `Debug` only shows the first four characters so tokens never end up in
/// logs verbatim.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(String);

impl ClaimToken {
    /// Draw a fresh token from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let token: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(CLAIM_TOKEN_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Wrap a token received from a caller. No shape validation happens
    /// here: an unknown token simply fails lookup.
    #[must_use]
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(4).collect();
        write!(f, "ClaimToken({shown}…)")
    }
}

// ---------------------------------------------------------------------------
// IdempotencyKey
// ---------------------------------------------------------------------------

/// Caller-supplied replay token for balance mutations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key used by a batch for the reservation of item `index`.
    #[must_use]
    pub fn for_batch_item(batch_id: BatchId, index: usize) -> Self {
        Self(format!("{batch_id}:{index}"))
    }

    /// Key that makes releasing a payout's reservation happen at most once.
    #[must_use]
    pub fn release_of(payout_id: PayoutId) -> Self {
        Self(format!("release:{payout_id}"))
    }

    /// Key that makes settling a payout happen at most once.
    #[must_use]
    pub fn settlement_of(payout_id: PayoutId) -> Self {
        Self(format!("settle:{payout_id}"))
    }

    /// Replay marker of a reservation made under this key. Reservation keys
    /// come from callers, so they are recorded under their own prefix and
    /// can never collide with the release, settlement or deposit markers.
    #[must_use]
    pub fn reservation(&self) -> Self {
        Self(format!("reserve:{}", self.0))
    }

    /// Key that prevents the same on-chain deposit from being credited twice.
    #[must_use]
    pub fn deposit_of(tx_reference: &str) -> Self {
        Self(format!("deposit:{tx_reference}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
