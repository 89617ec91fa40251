use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type Id = String;

/// Length of the abbreviated commit hash.
pub const SHORT_HASH_LEN: usize = 7;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Lowercase hex SHA-256 of the concatenated parts.
pub fn sha256_hex<I, T>(parts: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

pub fn short_hash(hash: &str) -> String {
    hash.chars().take(SHORT_HASH_LEN).collect()
}

/// True for a non-empty lowercase hex string of at most 64 characters.
pub fn is_hash_prefix(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= 64
        && candidate
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_is_stable() {
        // sha256("abc")
        assert_eq!(
            sha256_hex(["abc"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex(["a", "bc"]), sha256_hex(["abc"]));
    }

    #[test]
    fn test_short_hash_and_prefix() {
        let hash = sha256_hex(["commit"]);
        assert_eq!(short_hash(&hash).len(), SHORT_HASH_LEN);
        assert!(hash.starts_with(&short_hash(&hash)));
        assert!(is_hash_prefix(&short_hash(&hash)));
        assert!(!is_hash_prefix("XYZ"));
        assert!(!is_hash_prefix(""));
    }
}
