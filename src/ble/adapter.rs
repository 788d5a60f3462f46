//! Platform-agnostic transport adapter for the shoe device
//!
//! This module defines the interface every radio backend implements so the
//! protocol layer never touches platform Bluetooth APIs directly.
//!
//! Characteristic values cross this boundary base64-encoded, the convention
//! the mobile BLE stacks use. Backends that talk raw bytes convert at the edge.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Platform-agnostic transport trait
///
/// A backend owns at most one live link. Inbound notifications and link-loss
/// are delivered on the channel handed out by [`ShoeTransport::connect`].
#[async_trait]
pub trait ShoeTransport: Send + Sync {
    /// Start a discovery pass
    ///
    /// Every named device observed is sent on `found`. The scan keeps running
    /// until [`ShoeTransport::stop_scan`] is called.
    async fn start_scan(&self, found: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<(), BleError>;

    /// Stop the discovery pass. Safe to call when not scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Establish the link to `device`
    ///
    /// The backend negotiates `mtu` on a best-effort basis, resolves the command
    /// and notify characteristics and subscribes to the notify stream.
    ///
    /// # Returns
    /// * `Ok(receiver)` carrying notification payloads and the link-loss event
    /// * `Err(BleError)` if the link or capability discovery failed
    async fn connect(
        &self,
        device: &DiscoveredDevice,
        mtu: u16,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, BleError>;

    /// Request link teardown
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Write one base64-encoded value to the command characteristic
    async fn write(&self, value: &str) -> Result<(), BleError>;

    /// Whether the underlying link is still up
    async fn is_connected(&self) -> bool;

    /// Get adapter information (platform-specific details)
    fn adapter_info(&self) -> AdapterInfo;
}

/// Something the live link reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Base64 value of one notification on the notify characteristic
    Notification(String),
    /// The link dropped without being asked to, with the platform reason if any
    Lost(Option<String>),
}

/// Information about the transport adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Platform name (e.g., "Linux", "macOS", "loopback")
    pub platform: String,
    /// Adapter name or identifier
    pub name: String,
}

impl std::fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.platform)
    }
}

/// A device seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Platform identifier of the peripheral
    pub id: String,
    /// Advertised local name
    pub name: String,
    /// Signal strength at discovery time
    pub rssi: Option<i16>,
}

/// Transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("BLE scanning failed: {0}")]
    ScanningFailed(String),

    #[error("BLE connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No device connected")]
    NotConnected,

    #[error("BLE transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("BLE peripheral not found")]
    PeripheralNotFound,

    #[error("BLE service not found")]
    ServiceNotFound,

    #[error("BLE characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("A link is already open in this process")]
    AlreadyInUse,

    #[error("Platform error: {0}")]
    PlatformError(String),
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for BleError {
    fn from(err: btleplug::Error) -> Self {
        BleError::PlatformError(err.to_string())
    }
}
