//! High-level shoe client
//!
//! [`ShoeClient`] is what an application talks to. It owns the link handle,
//! the correlator and the session, and turns every device operation into one
//! typed async call.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::ble::{BleError, DiscoveredDevice, Link, ShoeTransport};
use crate::events::{DeviceEvent, EventBus};
use crate::gesture::AuthChallenge;
use crate::protocol::{Command, CommandKind, Correlator, ProtocolError, Reply};
use crate::session::{ConnectionStatus, Session, SessionSnapshot};
use crate::settings::ShoeLinkConfig;
use crate::util::{redact_device_id, transaction_digest};
use crate::wallet::{is_valid_sui_address, CreatedWallet, WalletRecord};
use crate::ShoeLinkError;

/// Result of an authentication attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthOutcome {
    pub success: bool,
    pub message: Option<String>,
}

/// Signature returned by the device for one transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedTransaction {
    /// Base64 signature as produced by the device
    pub signature: String,
    /// Hex SHA-256 of the unsigned bytes
    pub digest: String,
    pub wallet_index: u32,
}

pub struct ShoeClient {
    link: Link,
    correlator: Arc<Correlator>,
    session: Arc<Session>,
    events: EventBus,
    config: ShoeLinkConfig,
}

impl ShoeClient {
    /// Build a client over `transport`, claiming the process-wide link slot
    pub fn new(transport: Arc<dyn ShoeTransport>, config: ShoeLinkConfig) -> Result<Self, ShoeLinkError> {
        config.validate()?;

        let events = EventBus::default();
        let session = Arc::new(Session::new());
        let correlator = Arc::new(Correlator::new(
            transport.clone(),
            session.clone(),
            events.clone(),
            config.timeouts.clone(),
        ));
        let link = Link::open(transport, config.clone(), events.clone())?;

        Ok(Self {
            link,
            correlator,
            session,
            events,
            config,
        })
    }

    /// Client over the machine's first Bluetooth adapter
    #[cfg(feature = "ble")]
    pub async fn with_central(config: ShoeLinkConfig) -> Result<Self, ShoeLinkError> {
        let transport = crate::ble::CentralTransport::new(&config).await?;
        Self::new(Arc::new(transport), config)
    }

    pub fn config(&self) -> &ShoeLinkConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Kinds still waiting for the device
    pub fn pending(&self) -> Vec<CommandKind> {
        self.correlator.pending_kinds()
    }

    // ----- link lifecycle -----

    pub async fn scan<F, E>(&self, on_found: F, on_end: E) -> Result<(), BleError>
    where
        F: Fn(DiscoveredDevice) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        self.link.scan(on_found, on_end).await
    }

    pub async fn stop_scan(&self) {
        self.link.stop_scan().await
    }

    /// Scan for one full window and return the named devices seen
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>, BleError> {
        self.link.discover().await
    }

    pub async fn connect(&self, device: DiscoveredDevice) -> Result<(), BleError> {
        self.link.connect(device, self.correlator.clone()).await
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.link.disconnect().await
    }

    /// Tear everything down and give the link slot back
    pub async fn destroy(&self) {
        self.link.destroy().await
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        let alive = self.link.is_connected().await;
        ConnectionStatus::from_snapshot(&self.session.snapshot(), alive)
    }

    // ----- device commands -----

    /// Authenticate with the device PIN
    pub async fn authenticate(&self, password: &str) -> Result<AuthOutcome, ProtocolError> {
        tracing::info!("Authenticating ({} digit PIN)", password.chars().count());
        self.auth_command(Command::authenticate(password)).await
    }

    /// Start a gesture authentication round
    pub async fn start_auth(&self, challenge: &AuthChallenge) -> Result<AuthOutcome, ProtocolError> {
        match challenge {
            AuthChallenge::Word(word) => tracing::info!("Starting gesture challenge ({} letters)", word.len()),
            other => tracing::info!("Starting {} challenge", other.as_wire()),
        }
        self.auth_command(Command::start_auth(challenge.as_wire())).await
    }

    pub async fn list_wallets(&self) -> Result<Vec<WalletRecord>, ProtocolError> {
        match self.correlator.send(Command::list_wallets()).await? {
            Reply::Wallets(wallets) => Ok(wallets),
            _ => Err(ProtocolError::UnexpectedReply(CommandKind::ListWallets)),
        }
    }

    pub async fn select_wallet(&self, index: u32) -> Result<(), ProtocolError> {
        self.ack_command(Command::select_wallet(index)).await?;
        tracing::info!("Wallet {} selected", index);
        Ok(())
    }

    pub async fn create_wallet(&self) -> Result<CreatedWallet, ProtocolError> {
        match self.correlator.send(Command::create_wallet()).await? {
            Reply::Created(created) => {
                match created.address.as_deref() {
                    Some(address) if !is_valid_sui_address(address) => {
                        tracing::warn!("Device reported a malformed wallet address: {}", address)
                    }
                    None => tracing::warn!("Device created a wallet without reporting its address"),
                    _ => {}
                }
                Ok(created)
            }
            _ => Err(ProtocolError::UnexpectedReply(CommandKind::CreateWallet)),
        }
    }

    pub async fn save_gesture(&self, gesture: &str) -> Result<(), ProtocolError> {
        tracing::debug!("Saving gesture ({} symbols)", gesture.len());
        self.ack_command(Command::save_gesture(gesture)).await.map(|_| ())
    }

    /// Check a gesture against the one saved on the device
    ///
    /// A mismatch is reported as [`ProtocolError::GestureMismatch`].
    pub async fn verify_gesture(&self, gesture: &str) -> Result<(), ProtocolError> {
        tracing::debug!("Verifying gesture ({} symbols)", gesture.len());
        self.ack_command(Command::verify_gesture(gesture)).await.map(|_| ())
    }

    /// Morse code saved on the device, empty if it has none or never answered
    pub async fn get_saved_gesture(&self) -> Result<String, ProtocolError> {
        if let Some(code) = self.correlator.take_cached_gesture() {
            return Ok(code);
        }

        tokio::time::sleep(self.config.saved_gesture_settle()).await;
        if let Some(code) = self.correlator.take_cached_gesture() {
            return Ok(code);
        }

        match self.correlator.send(Command::get_saved_gesture()).await? {
            Reply::Gesture(code) => Ok(code),
            _ => Err(ProtocolError::UnexpectedReply(CommandKind::GetSavedGesture)),
        }
    }

    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), ProtocolError> {
        self.ack_command(Command::change_password(old, new)).await.map(|_| ())
    }

    /// Have the device sign `tx_bytes` with the active wallet
    ///
    /// Makes sure a wallet the device actually holds is selected first.
    pub async fn sign_transaction(&self, tx_bytes: &[u8]) -> Result<SignedTransaction, ProtocolError> {
        if !self.session.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        let digest = transaction_digest(tx_bytes);
        tracing::info!("Signing transaction {} ({} bytes)", &digest[..16], tx_bytes.len());

        if self.session.active_wallet().is_none() {
            tracing::info!("No wallet selected, selecting wallet 0");
            self.select_wallet(0).await?;
        }

        match self.list_wallets().await {
            Ok(wallets) => {
                let Some(first) = wallets.first() else {
                    return Err(ProtocolError::NoWallets);
                };
                let active = self.session.active_wallet();
                if !wallets.iter().any(|w| Some(w.index) == active) {
                    tracing::info!("Selected wallet not on device, selecting wallet {}", first.index);
                    self.select_wallet(first.index).await?;
                }
            }
            Err(e) => tracing::warn!("Could not check wallets before signing: {}", e),
        }

        let wallet_index = self.session.active_wallet().unwrap_or(0);
        let command = Command::sign_transaction(wallet_index, &STANDARD.encode(tx_bytes));
        match self.correlator.send(command).await? {
            Reply::Signature(signature) => {
                tracing::info!("Transaction {} signed by wallet {}", &digest[..16], wallet_index);
                Ok(SignedTransaction {
                    signature,
                    digest,
                    wallet_index,
                })
            }
            _ => Err(ProtocolError::UnexpectedReply(CommandKind::SignTransaction)),
        }
    }

    /// Erase every key on the device
    pub async fn emergency_wipe(&self) -> Result<(), ProtocolError> {
        if let Some(device) = self.session.snapshot().device {
            tracing::warn!("Emergency wipe requested for {}", redact_device_id(&device.id));
        }
        self.ack_command(Command::emergency_wipe()).await.map(|_| ())
    }

    async fn auth_command(&self, command: Command) -> Result<AuthOutcome, ProtocolError> {
        let (message, _) = self.ack_command(command).await?;
        Ok(AuthOutcome {
            success: true,
            message,
        })
    }

    async fn ack_command(&self, command: Command) -> Result<(Option<String>, Value), ProtocolError> {
        let kind = command.kind;
        match self.correlator.send(command).await? {
            Reply::Ack { message, payload } => Ok((message, payload)),
            _ => Err(ProtocolError::UnexpectedReply(kind)),
        }
    }
}
