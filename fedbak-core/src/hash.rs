use sha2::{Digest, Sha256};

/// Hash algorithms usable for the challenge-response block
/// verification protocol. Negotiation is by name, case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Sha256,
}

/// Supported methods, ordered by preference.
pub const SUPPORTED_HASH_METHODS: &[HashMethod] = &[HashMethod::Sha256];

impl HashMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HashMethod::Sha256 => "SHA256",
        }
    }

    pub fn from_name(name: &str) -> Option<HashMethod> {
        SUPPORTED_HASH_METHODS
            .iter()
            .copied()
            .find(|method| method.name().eq_ignore_ascii_case(name))
    }

    pub fn preferred() -> HashMethod {
        SUPPORTED_HASH_METHODS[0]
    }

    pub fn supported_names() -> Vec<String> {
        SUPPORTED_HASH_METHODS
            .iter()
            .map(|method| method.name().to_string())
            .collect()
    }

    /// Lowercase hex digest of `content ‖ salt`.
    pub fn salted_hex(&self, content: &[u8], salt: &[u8]) -> String {
        match self {
            HashMethod::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(content);
                hasher.update(salt);
                hex::encode(hasher.finalize())
            }
        }
    }
}
