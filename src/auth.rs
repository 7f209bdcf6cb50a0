//! Authentication
//!
//! - SS58 hotkey validation
//! - Sr25519 signature verification
//! - Commitment string formats and timestamp freshness window

use sp_core::crypto::Ss58Codec;
use sp_core::sr25519::{Public, Signature};
use tracing::debug;

/// Seconds a request timestamp may lag behind the server clock
pub const TIMESTAMP_MAX_AGE_SECS: i64 = 300;
/// Allowed forward clock skew
pub const TIMESTAMP_MAX_SKEW_SECS: i64 = 60;

/// Check if a string is a valid SS58-encoded sr25519 public key
pub fn is_valid_ss58_hotkey(hotkey: &str) -> bool {
    if hotkey.len() < 40 || hotkey.len() > 60 {
        return false;
    }
    Public::from_ss58check(hotkey).is_ok()
}

/// Verify an sr25519 signature over a commitment string
pub fn verify_signature(hotkey: &str, commitment: &str, signature_hex: &str) -> bool {
    let public_key = match Public::from_ss58check(hotkey) {
        Ok(pk) => pk,
        Err(e) => {
            debug!("Failed to parse SS58 hotkey: {}", e);
            return false;
        }
    };

    let sig_hex = signature_hex
        .strip_prefix("0x")
        .unwrap_or(signature_hex)
        .to_lowercase();

    let sig_bytes = match hex::decode(&sig_hex) {
        Ok(b) => b,
        Err(e) => {
            debug!("Failed to decode signature hex: {}", e);
            return false;
        }
    };

    if sig_bytes.len() != 64 {
        debug!(
            "Invalid signature length: {} (expected 64)",
            sig_bytes.len()
        );
        return false;
    }

    let mut sig_array = [0u8; 64];
    sig_array.copy_from_slice(&sig_bytes);
    let signature = Signature::from_raw(sig_array);

    use sp_core::Pair;
    sp_core::sr25519::Pair::verify(&signature, commitment.as_bytes(), &public_key)
}

/// Commitment for the current-assignment query
pub fn assignment_commitment(hotkey: &str, timestamp: i64) -> String {
    format!("zipcode:assignments:{}:{}", hotkey, timestamp)
}

/// Commitment for the historical-epoch query
pub fn historical_commitment(epoch_id: &str, timestamp: i64) -> String {
    format!("zipcode:epoch:{}:{}", epoch_id, timestamp)
}

/// Commitment for miner status reports
pub fn report_commitment(epoch_id: &str, hotkey: &str, timestamp: i64) -> String {
    format!("zipcode:report:{}:{}:{}", epoch_id, hotkey, timestamp)
}

/// Commitment for miner folder upload access
pub fn miner_access_commitment(coldkey: &str, hotkey: &str, timestamp: i64) -> String {
    format!("s3:data:access:{}:{}:{}", coldkey, hotkey, timestamp)
}

/// Commitment for validator bucket-wide read access
pub fn validator_access_commitment(timestamp: i64) -> String {
    format!("s3:validator:access:{}", timestamp)
}

/// Commitment for validator access to a specific miner's folder
pub fn miner_specific_commitment(miner_hotkey: &str, timestamp: i64) -> String {
    format!("s3:validator:miner:{}:{}", miner_hotkey, timestamp)
}

/// Check a request timestamp against the freshness window
///
/// Past timestamps are accepted up to [`TIMESTAMP_MAX_AGE_SECS`]; future
/// timestamps only up to [`TIMESTAMP_MAX_SKEW_SECS`] of clock skew. A stale
/// timestamp is an authentication failure independent of signature validity.
pub fn is_timestamp_fresh(timestamp: i64, now: i64) -> bool {
    now - timestamp <= TIMESTAMP_MAX_AGE_SECS && timestamp - now <= TIMESTAMP_MAX_SKEW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_core::Pair;

    #[test]
    fn test_ss58_validation() {
        assert!(is_valid_ss58_hotkey(
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"
        ));
        assert!(!is_valid_ss58_hotkey("not_a_valid_address"));
        assert!(!is_valid_ss58_hotkey(""));
    }

    #[test]
    fn test_timestamp_freshness() {
        let now = 1_700_000_000;
        assert!(is_timestamp_fresh(now, now));
        assert!(is_timestamp_fresh(now - 60, now));
        assert!(is_timestamp_fresh(now - 300, now));
        // 10 minutes in the past: stale
        assert!(!is_timestamp_fresh(now - 600, now));
        // Future timestamps beyond clock skew rejected
        assert!(is_timestamp_fresh(now + 30, now));
        assert!(!is_timestamp_fresh(now + 120, now));
    }

    #[test]
    fn test_signature_roundtrip() {
        let (pair, _) = sp_core::sr25519::Pair::generate();
        let hotkey = pair.public().to_ss58check();
        let commitment = assignment_commitment(&hotkey, 1_700_000_000);
        let signature = hex::encode(pair.sign(commitment.as_bytes()));

        assert!(verify_signature(&hotkey, &commitment, &signature));
        // Prefixed hex accepted too
        assert!(verify_signature(
            &hotkey,
            &commitment,
            &format!("0x{}", signature)
        ));
        // Tampered commitment fails
        assert!(!verify_signature(&hotkey, "zipcode:assignments:x:0", &signature));
    }

    #[test]
    fn test_commitment_formats() {
        assert_eq!(
            miner_access_commitment("cold", "hot", 1682345678),
            "s3:data:access:cold:hot:1682345678"
        );
        assert_eq!(
            validator_access_commitment(1682345678),
            "s3:validator:access:1682345678"
        );
        assert_eq!(
            miner_specific_commitment("5F3xyz", 1682345678),
            "s3:validator:miner:5F3xyz:1682345678"
        );
    }
}
