//! Deterministic identifiers for records synthesized by the collector

/// Generates ids for derived records from a prefix and identifying parts
///
/// The same inputs always produce the same id, so repeated materialization of
/// a derived record collides with the existing one instead of duplicating it.
pub trait IdProvider: Send + Sync {
    fn id(&self, prefix: &str, parts: &[&str]) -> String;
}

/// Hash based [`IdProvider`] with ids of the form `prefix-<16 hex chars>`
#[derive(Debug, Clone, Copy, Default)]
pub struct StableIdentityProvider;

impl StableIdentityProvider {
    pub fn new() -> Self {
        Self
    }
}

impl IdProvider for StableIdentityProvider {
    fn id(&self, prefix: &str, parts: &[&str]) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            // Length prefix keeps ("ab", "c") and ("a", "bc") apart
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let hash = hasher.finalize();
        format!("{}-{}", prefix, &hash.to_hex()[..16])
    }
}
