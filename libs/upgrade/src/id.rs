use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Identifies one upgrade. It shows up in the intermediate cluster's data directory names
/// and in the names of the archived log directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeId(String);

impl UpgradeId {
    /// 64 random bits, URL-safe base64 encoded.
    pub fn generate() -> UpgradeId {
        loop {
            let bytes: [u8; 8] = rand::random();
            let encoded = URL_SAFE_NO_PAD.encode(bytes);
            // "--" would be confusing inside data directory names and command lines.
            if !encoded.contains("--") {
                return UpgradeId(encoded);
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UpgradeId {
    fn from(s: &str) -> Self {
        UpgradeId(s.to_string())
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_url_safe() {
        for _ in 0..1000 {
            let id = UpgradeId::generate();
            assert_eq!(id.as_str().len(), 11, "{id}");
            assert!(!id.as_str().contains("--"), "{id}");
            assert!(id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }
}
