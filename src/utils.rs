use rand::Rng;
use sha2::{Digest, Sha256};

/// Milliseconds since the UNIX epoch. All stored timestamps and deadlines
/// use this scale.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Computes SHA-256 of data and returns it as a hex string. Used to derive
/// content-based deduplication keys.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Generates a random token of N bytes, encoded in base58. Receipt tokens
/// must be unpredictable; 32 bytes of OS entropy is plenty.
pub(crate) fn generate_token<const N: usize>() -> String {
    let mut token = [0u8; N];
    rand::thread_rng().fill(&mut token[..]);
    bs58::encode(token).into_string()
}
