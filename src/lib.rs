//! ShoeLink SDK - talk to a Morse-gesture hardware wallet shoe over BLE
//!
//! The shoe keeps the keys. This crate finds it, holds the one live link,
//! sends commands and correlates the shoe's answers back to their callers
//! even though the firmware never tags a response with the request it
//! answers.
//!
//! ```no_run
//! # async fn demo() -> Result<(), shoelink::ShoeLinkError> {
//! use shoelink::{ShoeClient, ShoeLinkConfig};
//!
//! let client = ShoeClient::with_central(ShoeLinkConfig::default()).await?;
//! let devices = client.discover().await?;
//! if let Some(shoe) = devices.into_iter().next() {
//!     client.connect(shoe).await?;
//!     client.authenticate("1234").await?;
//!     let wallets = client.list_wallets().await?;
//!     println!("{} wallet(s)", wallets.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod client;
pub mod events;
pub mod gesture;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod util;
pub mod wallet;

use thiserror::Error;

pub use ble::{BleError, DiscoveredDevice, LoopbackTransport, ShoeTransport};
pub use client::{AuthOutcome, ShoeClient, SignedTransaction};
pub use events::{DeviceEvent, EventBus};
pub use gesture::AuthChallenge;
pub use protocol::{CommandKind, ProtocolError};
pub use session::{AuthState, ConnectionStatus, SessionSnapshot};
pub use settings::{ConfigError, ShoeLinkConfig, SERVICE_UUID};
pub use wallet::{CreatedWallet, WalletRecord};

/// Top-level error type
#[derive(Error, Debug)]
pub enum ShoeLinkError {
    #[error("BLE transport error: {0}")]
    BleTransport(#[from] BleError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}
