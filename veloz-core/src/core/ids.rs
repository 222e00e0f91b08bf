//! Order identifiers.
//!
//! `ClientOrderId` is the dedup and addressability key for an order: a
//! validated newtype over `String` rather than the teacher's random `u128`
//! `OrderId`, because callers may supply their own id and it must remain a
//! stable map key across WAL replay and process restarts. `OrderId::new_random`
//! is kept as the synthesis strategy when a caller submits an order without
//! one.

use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_CLIENT_ORDER_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Validate a caller-supplied id: non-empty, ASCII, at most 64 bytes.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            bail!("client_order_id must not be empty");
        }
        if id.len() > MAX_CLIENT_ORDER_ID_LEN {
            bail!(
                "client_order_id exceeds {} bytes: {}",
                MAX_CLIENT_ORDER_ID_LEN,
                id.len()
            );
        }
        if !id.is_ascii() {
            bail!("client_order_id must be ASCII");
        }
        Ok(Self(id))
    }

    /// Synthesize an id for a caller that didn't supply one.
    pub fn new_random() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let rand_part: u64 = rand::thread_rng().gen();
        Self(format!("auto-{nanos:x}-{rand_part:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClientOrderId {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Id assigned by the venue on acceptance. Unknown until the venue adapter
/// acknowledges the order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VenueOrderId(String);

impl VenueOrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
