//! Outbound commands and the per-kind response policy

use serde::Serialize;
use serde_json::{json, Value};

use super::response::Reply;

/// Logical command kinds correlated by the protocol layer
///
/// `authenticate` and `start_auth` share [`CommandKind::Authenticate`]: the
/// firmware answers both with the same generic success/error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Authenticate,
    ListWallets,
    SelectWallet,
    CreateWallet,
    SaveGesture,
    VerifyGesture,
    ChangePassword,
    SignTransaction,
    GetSavedGesture,
    EmergencyWipe,
}

/// What a pending operation settles to when its deadline passes
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutPolicy {
    /// Fail the caller with a timeout error
    Reject,
    /// Silence is an answer: settle with this value
    Resolve(Reply),
}

impl CommandKind {
    pub const ALL: [CommandKind; 10] = [
        CommandKind::Authenticate,
        CommandKind::ListWallets,
        CommandKind::SelectWallet,
        CommandKind::CreateWallet,
        CommandKind::SaveGesture,
        CommandKind::VerifyGesture,
        CommandKind::ChangePassword,
        CommandKind::SignTransaction,
        CommandKind::GetSavedGesture,
        CommandKind::EmergencyWipe,
    ];

    pub fn timeout_policy(self) -> TimeoutPolicy {
        match self {
            CommandKind::GetSavedGesture => TimeoutPolicy::Resolve(Reply::Gesture(String::new())),
            _ => TimeoutPolicy::Reject,
        }
    }

    /// Whether inbound chunk traffic pushes this kind's deadline out
    pub fn refreshes_on_chunk(self) -> bool {
        matches!(self, CommandKind::SignTransaction)
    }

    /// Human label used in errors and logs
    pub fn label(self) -> &'static str {
        match self {
            CommandKind::Authenticate => "Authentication",
            CommandKind::ListWallets => "List wallets",
            CommandKind::SelectWallet => "Select wallet",
            CommandKind::CreateWallet => "Create wallet",
            CommandKind::SaveGesture => "Save gesture",
            CommandKind::VerifyGesture => "Verify gesture",
            CommandKind::ChangePassword => "Change password",
            CommandKind::SignTransaction => "Sign transaction",
            CommandKind::GetSavedGesture => "Get saved gesture",
            CommandKind::EmergencyWipe => "Emergency wipe",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One outbound frame: `{ "command": <name>, "payload": {...} }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    #[serde(rename = "command")]
    pub name: &'static str,
    pub payload: Value,
    #[serde(skip)]
    pub kind: CommandKind,
}

impl Command {
    pub fn authenticate(password: &str) -> Self {
        Self::new(CommandKind::Authenticate, "authenticate", json!({ "password": password }))
    }

    pub fn start_auth(challenge: &str) -> Self {
        Self::new(CommandKind::Authenticate, "start_auth", json!({ "challenge": challenge }))
    }

    pub fn list_wallets() -> Self {
        Self::new(CommandKind::ListWallets, "list_wallets", json!({}))
    }

    pub fn select_wallet(index: u32) -> Self {
        Self::new(CommandKind::SelectWallet, "select_wallet", json!({ "wallet_index": index }))
    }

    pub fn create_wallet() -> Self {
        Self::new(CommandKind::CreateWallet, "create_wallet", json!({}))
    }

    pub fn save_gesture(gesture: &str) -> Self {
        Self::new(CommandKind::SaveGesture, "save_gesture", json!({ "gesture": gesture }))
    }

    pub fn verify_gesture(gesture: &str) -> Self {
        Self::new(CommandKind::VerifyGesture, "verify_gesture", json!({ "gesture": gesture }))
    }

    pub fn get_saved_gesture() -> Self {
        Self::new(CommandKind::GetSavedGesture, "get_saved_gesture", json!({}))
    }

    pub fn change_password(old: &str, new: &str) -> Self {
        Self::new(
            CommandKind::ChangePassword,
            "change_password",
            json!({ "old": old, "new": new }),
        )
    }

    /// `transaction_data` is the base64 form of the unsigned transaction bytes
    pub fn sign_transaction(wallet_index: u32, transaction_data: &str) -> Self {
        Self::new(
            CommandKind::SignTransaction,
            "sign_transaction",
            json!({ "wallet_index": wallet_index, "transaction_data": transaction_data }),
        )
    }

    pub fn emergency_wipe() -> Self {
        Self::new(CommandKind::EmergencyWipe, "emergency_wipe", json!({}))
    }

    fn new(kind: CommandKind, name: &'static str, payload: Value) -> Self {
        Self { name, payload, kind }
    }
}
