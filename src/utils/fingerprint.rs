//! Deterministic fingerprints for signal ids and order client ids.
//!
//! Fingerprints must be stable across runs and platforms because they are
//! the idempotency keys for signal inserts and order placement.

use sha2::{Digest, Sha256};

/// Hash a sequence of fields into a 16-hex-char digest.
///
/// Fields are separated by a unit separator so that `("ab", "c")` and
/// `("a", "bc")` produce different digests.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint(&["AAPL", "2024-06-03T15:35:00-04:00", "150000"]);
        let b = fingerprint(&["AAPL", "2024-06-03T15:35:00-04:00", "150000"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_field_boundaries_matter() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }

    #[test]
    fn test_distinct_inputs_distinct_digests() {
        assert_ne!(
            fingerprint(&["AAPL", "BUY", "2024-06-03T15:37:00-04:00"]),
            fingerprint(&["AAPL", "SELL", "2024-06-03T15:37:00-04:00"])
        );
    }
}
