use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::ApiError;

// Generate a 160-bit API key: prefix_<base32 random>
pub fn generate_key(prefix: &str) -> Result<String, ApiError> {
    if prefix.is_empty() || prefix.contains('_') {
        return Err(ApiError::InvalidRequest(format!(
            "invalid key prefix: {:?}",
            prefix
        )));
    }

    let mut random_bytes = [0u8; 20];
    rand::thread_rng().fill(&mut random_bytes);

    Ok(format!(
        "{}_{}",
        prefix,
        base32::encode(base32::Alphabet::RFC4648 { padding: false }, &random_bytes)
    ))
}

// One-way hash used as the storage and cache key
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}
