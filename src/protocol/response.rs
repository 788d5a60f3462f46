//! Typed view of inbound frames
//!
//! The firmware never echoes which command a frame answers, so each frame is
//! classified once by its status (and a few payload hints) into a
//! [`DeviceResponse`] variant. The correlator dispatches on the variant.

use serde_json::Value;

use super::codec::ResponseFrame;
use crate::wallet::{wallets_from_payload, CreatedWallet, WalletRecord};

/// Message codes the firmware uses to acknowledge a write-style command
pub const ACK_CODES: [&str; 2] = ["K", "OK"];

/// Value a pending operation settles with
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Generic acknowledgement
    Ack {
        message: Option<String>,
        payload: Value,
    },
    Wallets(Vec<WalletRecord>),
    Created(CreatedWallet),
    /// Saved Morse code, empty when the device has none or stayed silent
    Gesture(String),
    /// Base64 signature produced by the device
    Signature(String),
}

impl Reply {
    pub fn ack(message: Option<&str>, payload: Value) -> Self {
        Reply::Ack {
            message: message.map(str::to_string),
            payload,
        }
    }
}

/// One classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    /// `ok`/`success` carrying a transaction signature
    Signature {
        signature: String,
        message: Option<String>,
        payload: Value,
    },
    Success {
        message: Option<String>,
        payload: Value,
    },
    Error {
        message: Option<String>,
        action: Option<String>,
        payload: Value,
    },
    AuthRequired {
        message: Option<String>,
        payload: Value,
    },
    SessionExpired {
        message: Option<String>,
        payload: Value,
    },
    Locked {
        message: Option<String>,
        payload: Value,
    },
    WalletList(Vec<WalletRecord>),
    WalletSelected {
        payload: Value,
    },
    GestureSaved {
        message: Option<String>,
        payload: Value,
    },
    GestureVerified {
        message: Option<String>,
        payload: Value,
    },
    GestureMismatch {
        message: Option<String>,
        payload: Value,
    },
    SavedGesture(String),
    WalletCreated(CreatedWallet),
    EmergencyWipeComplete,
    Unrecognized {
        status: String,
    },
}

impl DeviceResponse {
    pub fn classify(frame: &ResponseFrame) -> Self {
        let message = frame.message.clone();
        let payload = frame.payload.clone();

        match frame.status() {
            "ok" | "success" => match signature_of(frame) {
                Some(signature) => DeviceResponse::Signature {
                    signature,
                    message,
                    payload,
                },
                None => DeviceResponse::Success { message, payload },
            },
            "error" | "err" => DeviceResponse::Error {
                message,
                action: frame.action.clone(),
                payload,
            },
            "auth_required" | "auth" => DeviceResponse::AuthRequired { message, payload },
            "info" if frame.payload_flag("session_expired") => {
                DeviceResponse::SessionExpired { message, payload }
            }
            "locked" | "lock" => DeviceResponse::Locked { message, payload },
            "wallet_list" => DeviceResponse::WalletList(wallets_from_payload(&frame.payload)),
            "wallet_selected" => DeviceResponse::WalletSelected { payload },
            "gesture_saved" => DeviceResponse::GestureSaved { message, payload },
            "gesture_verified" => DeviceResponse::GestureVerified { message, payload },
            "gesture_mismatch" => DeviceResponse::GestureMismatch { message, payload },
            "saved_morse" | "gesture" | "saved_gesture" => DeviceResponse::SavedGesture(
                frame
                    .payload_str("morse")
                    .or_else(|| frame.payload_str("gesture"))
                    .unwrap_or_default()
                    .to_string(),
            ),
            "wallet_created" => DeviceResponse::WalletCreated(CreatedWallet::from_payload(&frame.payload)),
            "emergency_wipe_complete" => DeviceResponse::EmergencyWipeComplete,
            other => DeviceResponse::Unrecognized {
                status: other.to_string(),
            },
        }
    }
}

/// Signature carried by a success frame, in either firmware revision's shape
fn signature_of(frame: &ResponseFrame) -> Option<String> {
    if let Some(signature) = frame.payload_str("signature_base64") {
        return Some(signature.to_string());
    }
    if frame.status() == "success" && frame.action.as_deref() == Some("sign_transaction") {
        return frame.payload_str("signature").map(str::to_string);
    }
    None
}

/// Whether a generic success message acknowledges a write-style command
pub fn is_ack(message: Option<&str>) -> bool {
    message.is_some_and(|m| ACK_CODES.contains(&m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::parse_frame;

    fn classify(text: &str) -> DeviceResponse {
        DeviceResponse::classify(&parse_frame(text).unwrap())
    }

    #[test]
    fn test_signature_beats_generic_success() {
        let response = classify(r#"{"status":"ok","payload":{"signature_base64":"c2ln"}}"#);
        assert!(matches!(response, DeviceResponse::Signature { ref signature, .. } if signature == "c2ln"));

        let response = classify(r#"{"s":"success","a":"sign_transaction","p":{"signature":"c2ln"}}"#);
        assert!(matches!(response, DeviceResponse::Signature { .. }));

        let response = classify(r#"{"status":"success","message":"OK"}"#);
        assert!(matches!(response, DeviceResponse::Success { .. }));
    }

    #[test]
    fn test_info_without_flag_is_unrecognized() {
        assert!(matches!(
            classify(r#"{"status":"info","payload":{"session_expired":true}}"#),
            DeviceResponse::SessionExpired { .. }
        ));
        assert!(matches!(
            classify(r#"{"status":"info","payload":{}}"#),
            DeviceResponse::Unrecognized { .. }
        ));
    }

    #[test]
    fn test_saved_gesture_synonyms() {
        for status in ["saved_morse", "gesture", "saved_gesture"] {
            let text = format!(r#"{{"status":"{status}","payload":{{"morse":"...---"}}}}"#);
            assert_eq!(classify(&text), DeviceResponse::SavedGesture("...---".to_string()));
        }
        assert_eq!(
            classify(r#"{"status":"saved_gesture","payload":{"gesture":".-"}}"#),
            DeviceResponse::SavedGesture(".-".to_string())
        );
        assert_eq!(
            classify(r#"{"status":"saved_gesture"}"#),
            DeviceResponse::SavedGesture(String::new())
        );
    }

    #[test]
    fn test_status_synonyms() {
        assert!(matches!(classify(r#"{"s":"err","m":"bad pin"}"#), DeviceResponse::Error { .. }));
        assert!(matches!(classify(r#"{"s":"auth"}"#), DeviceResponse::AuthRequired { .. }));
        assert!(matches!(classify(r#"{"s":"lock"}"#), DeviceResponse::Locked { .. }));
    }

    #[test]
    fn test_ack_codes() {
        assert!(is_ack(Some("K")));
        assert!(is_ack(Some("OK")));
        assert!(!is_ack(Some("ok")));
        assert!(!is_ack(None));
    }
}
