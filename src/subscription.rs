//! Subscription identifiers.

use rand::{distributions::Alphanumeric, Rng};

use crate::error::{Error, Result};

/// Longest subscription id a relay is required to accept.
pub const MAX_LEN: usize = 64;

/// Random 64-letter subscription id.
pub fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(char::is_ascii_alphabetic)
        .take(MAX_LEN)
        .collect()
}

/// Reject empty ids and ids longer than [`MAX_LEN`] bytes.
pub fn validate(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::SubscriptionId("empty".into()));
    }
    if id.len() > MAX_LEN {
        return Err(Error::SubscriptionId(format!(
            "{} bytes exceeds the {MAX_LEN} byte limit",
            id.len()
        )));
    }
    Ok(())
}
