//! Utility functions for the shoe link
//!
//! Small helpers shared by the transport and client layers

/// Common utility functions
pub mod common {
    use sha2::{Digest, Sha256};

    /// Keep only the last six characters of a device id for logs
    pub fn redact_device_id(device_id: &str) -> String {
        let chars: Vec<char> = device_id.chars().collect();
        if chars.is_empty() {
            return "<redacted>".to_string();
        }
        let start = chars.len().saturating_sub(6);
        format!("...{}", chars[start..].iter().collect::<String>())
    }

    /// Hex SHA-256 of the unsigned transaction bytes, used as a log-safe id
    pub fn transaction_digest(tx_bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(tx_bytes))
    }
}

pub use common::{redact_device_id, transaction_digest};
