//! Wallet records reported by the device
//!
//! Nothing here is persisted: records live as long as the list the caller
//! asked for.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One wallet held on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletRecord {
    pub index: u32,
    /// `0x`-prefixed, empty if the device did not report one
    pub address: String,
    pub public_key: Option<String>,
}

/// A `wallets` entry as the firmware sends it; every field may be missing or null
#[derive(Debug, Default, Deserialize)]
struct WalletEntry {
    #[serde(default, alias = "wallet_index")]
    index: Option<u32>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
}

impl WalletEntry {
    /// Missing index falls back to the entry's position in the list
    fn into_record(self, position: usize) -> WalletRecord {
        let index = self
            .index
            .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
        WalletRecord {
            index,
            address: normalize_address(self.address.as_deref().unwrap_or_default()),
            public_key: self
                .public_key
                .as_deref()
                .filter(|key| !key.is_empty())
                .map(normalize_address),
        }
    }
}

/// Result of a `create_wallet` command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CreatedWallet {
    pub address: Option<String>,
    pub public_key: Option<String>,
    pub wallet_index: Option<u32>,
}

impl CreatedWallet {
    pub fn from_payload(payload: &Value) -> Self {
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(normalize_address)
        };
        Self {
            address: text("address"),
            public_key: text("public_key"),
            wallet_index: payload
                .get("wallet_index")
                .and_then(Value::as_u64)
                .and_then(|i| u32::try_from(i).ok()),
        }
    }
}

/// Parse `payload.wallets`, normalizing the fields each entry carries
///
/// Every reported entry is kept. Only an entry that is not an object at all
/// (or whose fields have the wrong type) is skipped.
pub fn wallets_from_payload(payload: &Value) -> Vec<WalletRecord> {
    let Some(entries) = payload.get("wallets").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(position, entry)| match WalletEntry::deserialize(entry) {
            Ok(entry) => Some(entry.into_record(position)),
            Err(e) => {
                tracing::warn!("Skipping malformed wallet entry {}: {}", position, e);
                None
            }
        })
        .collect()
}

/// Ensure an address carries the `0x` prefix. Empty input stays empty.
pub fn normalize_address(address: &str) -> String {
    if address.is_empty() || address.starts_with("0x") {
        address.to_string()
    } else {
        format!("0x{}", address)
    }
}

/// `0x` followed by 64 hex digits
pub fn is_valid_sui_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Shorten an address for display, e.g. `0x1234ab...cdef`
pub fn truncate_address(address: &str, start_chars: usize, end_chars: usize) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() < start_chars + end_chars + 2 {
        return address.to_string();
    }
    let head: String = chars[..start_chars + 2].iter().collect();
    let tail: String = chars[chars.len() - end_chars..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_is_idempotent() {
        assert_eq!(normalize_address("0xABC"), "0xABC");
        let once = normalize_address("ABC");
        assert_eq!(once, "0xABC");
        assert_eq!(normalize_address(&once), once);
        assert_eq!(normalize_address(""), "");
    }

    #[test]
    fn test_wallets_from_payload() {
        let payload = json!({
            "wallets": [
                { "index": 0, "address": "1111aaaa", "public_key": "beef" },
                { "index": 1, "address": "0x2222bbbb" },
                "not a wallet"
            ]
        });

        let wallets = wallets_from_payload(&payload);
        assert_eq!(wallets.len(), 2);
        assert_eq!(wallets[0].address, "0x1111aaaa");
        assert_eq!(wallets[0].public_key.as_deref(), Some("0xbeef"));
        assert_eq!(wallets[1].address, "0x2222bbbb");
        assert_eq!(wallets[1].public_key, None);
    }

    #[test]
    fn test_entries_without_index_take_their_position() {
        let payload = json!({
            "wallets": [{ "address": "1111aaaa" }, { "address": "2222bbbb" }]
        });

        let wallets = wallets_from_payload(&payload);
        let indices: Vec<u32> = wallets.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(wallets[1].address, "0x2222bbbb");
    }

    #[test]
    fn test_null_address_keeps_the_entry() {
        let payload = json!({
            "wallets": [{ "index": 0, "address": null, "public_key": "ab" }]
        });

        let wallets = wallets_from_payload(&payload);
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].address, "");
        assert_eq!(wallets[0].public_key.as_deref(), Some("0xab"));
    }

    #[test]
    fn test_missing_wallet_list_is_empty() {
        assert!(wallets_from_payload(&Value::Null).is_empty());
        assert!(wallets_from_payload(&json!({ "wallets": "nope" })).is_empty());
    }

    #[test]
    fn test_created_wallet_from_payload() {
        let created = CreatedWallet::from_payload(&json!({
            "address": "abcd",
            "public_key": "0x99",
            "wallet_index": 3
        }));
        assert_eq!(created.address.as_deref(), Some("0xabcd"));
        assert_eq!(created.public_key.as_deref(), Some("0x99"));
        assert_eq!(created.wallet_index, Some(3));
    }

    #[test]
    fn test_sui_address_helpers() {
        let address = format!("0x{}", "a".repeat(64));
        assert!(is_valid_sui_address(&address));
        assert!(!is_valid_sui_address(&"a".repeat(64)));
        assert!(!is_valid_sui_address("0x1234"));

        assert_eq!(truncate_address(&address, 6, 4), "0xaaaaaa...aaaa");
        assert_eq!(truncate_address("0x12", 6, 4), "0x12");
    }
}
