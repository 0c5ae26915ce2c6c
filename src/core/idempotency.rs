//! Idempotency keys for stage events.
//!
//! Consumers receive events at least once; the key lets them drop
//! duplicates and lets a resumed workflow skip stages that already finished
//! with the same input.

use sha2::{Digest, Sha256};

/// Generate an idempotency key for a stage: `{workflow_id}:{stage}:{hash16}`
pub fn generate_idempotency_key(workflow_id: &str, stage: &str, input: &str) -> String {
    format!("{}:{}:{}", workflow_id, stage, hash_input(input))
}

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        let key = generate_idempotency_key("wf-42", "plan", "test input");

        assert!(key.starts_with("wf-42:plan:"));
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn test_input_hash_consistency() {
        let hash1 = hash_input("test input");
        let hash2 = hash_input("test input");
        let hash3 = hash_input("different input");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }
}
