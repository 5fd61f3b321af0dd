//! Utility functions for ids, hashing and time.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a time-ordered UUID (v7) for new records.
#[must_use]
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}

/// Returns the hex-encoded SHA-256 digest of document content.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Converts a `std::time::Duration` into a `chrono::Duration`, saturating.
#[must_use]
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_v7() {
        let id = generate_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_content_hash_known_value() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_to_chrono() {
        let d = to_chrono(std::time::Duration::from_secs(90));
        assert_eq!(d.num_seconds(), 90);
    }
}
