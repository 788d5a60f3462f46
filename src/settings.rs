//! Runtime configuration for the shoe link
//!
//! Defaults match the deployed firmware. A TOML file and `SHOELINK_*`
//! environment variables can override any field when the `config-file`
//! feature is enabled.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::CommandKind;

/// GATT service exposed by the shoe firmware
pub const SERVICE_UUID: &str = "4a1d5203-b0e6-4d2a-89a1-0f4900a0680a";

/// Characteristic the app writes commands to
pub const COMMAND_CHARACTERISTIC_UUID: &str = "60641dfd-e137-41a4-9e79-84728562725e";

/// Characteristic the firmware notifies responses on
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "523675f6-c67d-411a-821e-c674ed4a123f";

/// Transfer unit requested after connecting
pub const REQUESTED_MTU: u16 = 185;

/// Per-command deadlines in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandTimeouts {
    pub authenticate_ms: u64,
    pub list_wallets_ms: u64,
    pub select_wallet_ms: u64,
    pub create_wallet_ms: u64,
    pub save_gesture_ms: u64,
    pub verify_gesture_ms: u64,
    pub change_password_ms: u64,
    pub get_saved_gesture_ms: u64,
    pub sign_transaction_ms: u64,
    pub emergency_wipe_ms: u64,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            authenticate_ms: 10_000,
            list_wallets_ms: 20_000,
            select_wallet_ms: 10_000,
            create_wallet_ms: 30_000,
            save_gesture_ms: 10_000,
            verify_gesture_ms: 10_000,
            change_password_ms: 10_000,
            get_saved_gesture_ms: 30_000,
            sign_transaction_ms: 30_000,
            emergency_wipe_ms: 5_000,
        }
    }
}

impl CommandTimeouts {
    /// Deadline for one command kind
    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        let ms = match kind {
            CommandKind::Authenticate => self.authenticate_ms,
            CommandKind::ListWallets => self.list_wallets_ms,
            CommandKind::SelectWallet => self.select_wallet_ms,
            CommandKind::CreateWallet => self.create_wallet_ms,
            CommandKind::SaveGesture => self.save_gesture_ms,
            CommandKind::VerifyGesture => self.verify_gesture_ms,
            CommandKind::ChangePassword => self.change_password_ms,
            CommandKind::GetSavedGesture => self.get_saved_gesture_ms,
            CommandKind::SignTransaction => self.sign_transaction_ms,
            CommandKind::EmergencyWipe => self.emergency_wipe_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Complete link configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShoeLinkConfig {
    /// How long a scan runs before it stops on its own
    pub scan_window_ms: u64,
    /// Only report devices advertising the shoe service UUID. Off by default:
    /// the firmware advertises just its name when the UUID does not fit.
    pub scan_service_filter: bool,
    /// MTU requested after connecting (best effort)
    pub requested_mtu: u16,
    /// Pause before writing `get_saved_gesture` so the firmware settles
    pub saved_gesture_settle_ms: u64,
    pub service_uuid: Uuid,
    pub command_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
    pub timeouts: CommandTimeouts,
}

impl Default for ShoeLinkConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 10_000,
            scan_service_filter: false,
            requested_mtu: REQUESTED_MTU,
            saved_gesture_settle_ms: 500,
            service_uuid: Uuid::from_u128(0x4a1d5203_b0e6_4d2a_89a1_0f4900a0680a),
            command_characteristic_uuid: Uuid::from_u128(0x60641dfd_e137_41a4_9e79_84728562725e),
            notify_characteristic_uuid: Uuid::from_u128(0x523675f6_c67d_411a_821e_c674ed4a123f),
            timeouts: CommandTimeouts::default(),
        }
    }
}

impl ShoeLinkConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Service UUIDs a scan is restricted to; empty means every advertiser
    pub fn scan_filter_services(&self) -> Vec<Uuid> {
        if self.scan_service_filter {
            vec![self.service_uuid]
        } else {
            Vec::new()
        }
    }

    pub fn saved_gesture_settle(&self) -> Duration {
        Duration::from_millis(self.saved_gesture_settle_ms)
    }

    /// Reject values the firmware cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_window_ms == 0 {
            return Err(ConfigError::Invalid("scan_window_ms must be positive".to_string()));
        }
        // 23 bytes is the ATT default every link starts from
        if self.requested_mtu < 23 {
            return Err(ConfigError::Invalid(format!(
                "requested_mtu {} is below the ATT minimum of 23",
                self.requested_mtu
            )));
        }
        Ok(())
    }

    /// Load defaults, then an optional TOML file, then `SHOELINK_*` env vars
    ///
    /// Nested fields use a double underscore, e.g.
    /// `SHOELINK_TIMEOUTS__LIST_WALLETS_MS=25000`.
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("SHOELINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        tracing::debug!(
            scan_window_ms = loaded.scan_window_ms,
            requested_mtu = loaded.requested_mtu,
            "Loaded shoelink configuration"
        );
        Ok(loaded)
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[cfg(feature = "config-file")]
    #[error("Configuration error: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uuids_match_firmware_constants() {
        let config = ShoeLinkConfig::default();
        assert_eq!(config.service_uuid.to_string(), SERVICE_UUID);
        assert_eq!(
            config.command_characteristic_uuid.to_string(),
            COMMAND_CHARACTERISTIC_UUID
        );
        assert_eq!(
            config.notify_characteristic_uuid.to_string(),
            NOTIFY_CHARACTERISTIC_UUID
        );
    }

    #[test]
    fn test_scan_matches_by_name_unless_filter_requested() {
        let config = ShoeLinkConfig::default();
        assert!(!config.scan_service_filter);
        assert!(config.scan_filter_services().is_empty());

        let filtered = ShoeLinkConfig {
            scan_service_filter: true,
            ..ShoeLinkConfig::default()
        };
        assert_eq!(filtered.scan_filter_services(), vec![filtered.service_uuid]);
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = CommandTimeouts::default();
        assert_eq!(timeouts.for_kind(CommandKind::Authenticate), Duration::from_secs(10));
        assert_eq!(timeouts.for_kind(CommandKind::ListWallets), Duration::from_secs(20));
        assert_eq!(timeouts.for_kind(CommandKind::CreateWallet), Duration::from_secs(30));
        assert_eq!(timeouts.for_kind(CommandKind::GetSavedGesture), Duration::from_secs(30));
        assert_eq!(timeouts.for_kind(CommandKind::SignTransaction), Duration::from_secs(30));
        assert_eq!(timeouts.for_kind(CommandKind::EmergencyWipe), Duration::from_secs(5));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_load_from_file_overrides_defaults() {
        use std::io::Write;

        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Should create temp file");
        writeln!(file, "scan_window_ms = 4000").expect("Should write");
        writeln!(file, "scan_service_filter = true").expect("Should write");
        writeln!(file, "[timeouts]").expect("Should write");
        writeln!(file, "list_wallets_ms = 25000").expect("Should write");

        let config = ShoeLinkConfig::load(Some(file.path())).expect("Should load");
        assert_eq!(config.scan_window(), Duration::from_secs(4));
        assert!(config.scan_service_filter);
        assert_eq!(config.timeouts.list_wallets_ms, 25_000);
        // Untouched fields keep their defaults
        assert_eq!(config.timeouts.authenticate_ms, 10_000);
        assert_eq!(config.requested_mtu, REQUESTED_MTU);
    }

    #[test]
    fn test_validate_rejects_tiny_mtu() {
        let config = ShoeLinkConfig {
            requested_mtu: 20,
            ..ShoeLinkConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(ShoeLinkConfig::default().validate().is_ok());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_load_missing_file_fails() {
        let result = ShoeLinkConfig::load(Some(std::path::Path::new("/nonexistent/shoelink.toml")));
        assert!(result.is_err());
    }
}
