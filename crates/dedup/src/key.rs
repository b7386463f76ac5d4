//! Stable keys for idempotency markers.
//!
//! Keys are SHA-256 digests of a domain-separated source string so that an
//! external id can never collide with a sender/action pair, and so that raw
//! identifiers (phone numbers) are not stored verbatim.

use std::fmt;

use {
    sha2::{Digest, Sha256},
    switchboard_common::normalize_sender,
};

/// Hex-encoded digest identifying one logical inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for a channel-assigned message id (repeats on redelivery).
    pub fn from_external_id(external_id: &str) -> Self {
        Self::digest(&format!("ext:{external_id}"))
    }

    /// Key for a semantic action performed on behalf of a sender, used when
    /// the channel does not supply a stable id (e.g. "confirm-booking").
    pub fn from_action(sender_id: &str, action: &str) -> Self {
        Self::digest(&format!("act:{}:{action}", normalize_sender(sender_id)))
    }

    fn digest(source: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(source.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_external_id_same_key() {
        assert_eq!(
            IdempotencyKey::from_external_id("msg-1"),
            IdempotencyKey::from_external_id("msg-1")
        );
        assert_ne!(
            IdempotencyKey::from_external_id("msg-1"),
            IdempotencyKey::from_external_id("msg-2")
        );
    }

    #[test]
    fn action_key_uses_normalized_sender() {
        assert_eq!(
            IdempotencyKey::from_action("5511987654321@s.whatsapp.net", "confirm"),
            IdempotencyKey::from_action("+55 11 98765-4321", "confirm")
        );
    }

    #[test]
    fn domains_do_not_collide() {
        // "act:1:x" as an external id must not equal the action key for (1, x).
        assert_ne!(
            IdempotencyKey::from_external_id("1:x"),
            IdempotencyKey::from_action("1", "x")
        );
    }

    #[test]
    fn key_is_hex_sha256() {
        let key = IdempotencyKey::from_external_id("abc");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
