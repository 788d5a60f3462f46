//! Command/response correlation
//!
//! Sends one command and settles exactly one caller with its result. The
//! firmware never says which command a frame answers, so routing goes by the
//! frame's classified shape and a fixed priority order between the kinds that
//! could plausibly be waiting for it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::codec::{self, ResponseFrame};
use super::command::{Command, CommandKind};
use super::pending::{Outcome, PendingRegistry};
use super::reassembly::{is_chunk, Assembled, ReassemblyBuffer};
use super::response::{is_ack, DeviceResponse, Reply};
use super::ProtocolError;
use crate::ble::{DiscoveredDevice, LinkObserver, ShoeTransport};
use crate::events::{DeviceEvent, EventBus};
use crate::session::Session;
use crate::settings::CommandTimeouts;

/// Kinds an `error` frame may be aimed at, most likely first
const ERROR_PRIORITY: [CommandKind; 8] = [
    CommandKind::Authenticate,
    CommandKind::SaveGesture,
    CommandKind::VerifyGesture,
    CommandKind::ChangePassword,
    CommandKind::CreateWallet,
    CommandKind::GetSavedGesture,
    CommandKind::SelectWallet,
    CommandKind::SignTransaction,
];

/// Kinds a bare `K`/`OK` success acknowledges
const ACK_TARGETS: [CommandKind; 3] = [
    CommandKind::SaveGesture,
    CommandKind::VerifyGesture,
    CommandKind::ChangePassword,
];

const SESSION_EXPIRED_TARGETS: [CommandKind; 4] = [
    CommandKind::SaveGesture,
    CommandKind::VerifyGesture,
    CommandKind::ChangePassword,
    CommandKind::Authenticate,
];

#[derive(Default)]
struct CorrelatorState {
    registry: PendingRegistry,
    reassembly: ReassemblyBuffer,
    /// Saved gesture that arrived with nobody waiting for it
    cached_gesture: Option<String>,
}

/// Removes a still-registered operation when its caller goes away
struct PendingGuard<'a> {
    state: &'a Mutex<CorrelatorState>,
    kind: CommandKind,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.state.lock().registry.remove_ticket(self.kind, self.ticket) {
            tracing::debug!("{} abandoned by caller", self.kind);
        }
    }
}

pub struct Correlator {
    transport: Arc<dyn ShoeTransport>,
    session: Arc<Session>,
    events: EventBus,
    timeouts: CommandTimeouts,
    state: Mutex<CorrelatorState>,
    /// One send lane per kind: a second caller of a kind waits for the first to settle
    lanes: [tokio::sync::Mutex<()>; CommandKind::ALL.len()],
}

impl Correlator {
    pub fn new(
        transport: Arc<dyn ShoeTransport>,
        session: Arc<Session>,
        events: EventBus,
        timeouts: CommandTimeouts,
    ) -> Self {
        Self {
            transport,
            session,
            events,
            timeouts,
            state: Mutex::new(CorrelatorState::default()),
            lanes: std::array::from_fn(|_| tokio::sync::Mutex::new(())),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Kinds currently awaiting a response
    pub fn pending_kinds(&self) -> Vec<CommandKind> {
        self.state.lock().registry.pending_kinds()
    }

    /// Take a saved gesture that arrived after its request had already settled
    pub fn take_cached_gesture(&self) -> Option<String> {
        self.state.lock().cached_gesture.take()
    }

    /// Write `command` and wait for the response routed to its kind
    pub async fn send(&self, command: Command) -> Result<Reply, ProtocolError> {
        let kind = command.kind;
        let _lane = self.lanes[kind as usize].lock().await;

        if !self.session.is_connected() || !self.transport.is_connected().await {
            return Err(ProtocolError::NotConnected);
        }

        let value = codec::encode(&command)?;
        let timeout = self.timeouts.for_kind(kind);
        let wallet_index = command
            .payload
            .get("wallet_index")
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok());

        // Registered before the write so an immediate answer has somewhere to land
        let (ticket, mut rx) =
            self.state
                .lock()
                .registry
                .insert(kind, timeout, wallet_index, Instant::now())?;
        let _guard = PendingGuard {
            state: &self.state,
            kind,
            ticket,
        };

        tracing::debug!("Sending {} ({} bytes encoded)", command.name, value.len());
        self.transport.write(&value).await?;

        loop {
            let deadline = self.state.lock().registry.deadline(kind, ticket);
            let Some(deadline) = deadline else {
                return settled(rx.await);
            };

            tokio::select! {
                outcome = &mut rx => return settled(outcome),
                _ = tokio::time::sleep_until(deadline) => {
                    // Either settles it or finds the deadline was pushed out
                    self.state.lock().registry.expire_if_due(kind, ticket, Instant::now());
                }
            }
        }
    }

    /// Feed one base64 notification value from the link
    pub fn handle_notification(&self, value: &str) {
        let text = match codec::unwrap_transport(value) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Dropping undecodable notification: {}", e);
                return;
            }
        };

        let assembled = {
            let mut state = self.state.lock();
            if is_chunk(&text) {
                // Chunk traffic means the device is alive and working on it
                state.registry.refresh_on_chunk(Instant::now());
            }
            state.reassembly.push(&text)
        };

        match assembled {
            Ok(Assembled::Whole(json)) => match codec::parse_frame(&json) {
                Ok(frame) => self.dispatch(&frame),
                Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
            },
            Ok(Assembled::Partial { .. }) => {}
            Ok(Assembled::Discarded { index, total }) => {
                tracing::warn!("Chunk {}/{} out of sequence, waiting for a fresh sequence", index, total);
            }
            Err(e) => tracing::warn!("Dropping chunk: {}", e),
        }
    }

    fn dispatch(&self, frame: &ResponseFrame) {
        tracing::debug!("Response status '{}'", frame.status());
        self.route(DeviceResponse::classify(frame));
    }

    /// Apply one classified response: settle pending ops, update the session, publish events
    pub fn route(&self, response: DeviceResponse) {
        // Published only after the state lock is released, so listeners may call back in
        let mut outbox = Vec::new();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let registry = &mut state.registry;

        match response {
            DeviceResponse::Signature {
                signature,
                message,
                payload,
            } => {
                if registry.resolve(CommandKind::SignTransaction, Reply::Signature(signature)) {
                    tracing::info!("Transaction signature received");
                } else {
                    self.on_success(registry, &mut outbox, message, payload);
                }
            }
            DeviceResponse::Success { message, payload } => {
                self.on_success(registry, &mut outbox, message, payload);
            }
            DeviceResponse::Error {
                message,
                action,
                payload,
            } => {
                let text = message
                    .or_else(|| payload.get("message").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| "Unknown device error".to_string());
                tracing::warn!("Device error: {}", text);
                outbox.push(DeviceEvent::AuthenticationError {
                    message: text.clone(),
                });

                let signing_error = action.as_deref() == Some("sign_transaction")
                    && registry.contains(CommandKind::SignTransaction);
                let target = if signing_error {
                    Some(CommandKind::SignTransaction)
                } else {
                    registry.first_pending(&ERROR_PRIORITY)
                };
                match target {
                    Some(kind) => {
                        registry.reject(kind, ProtocolError::Device(text));
                    }
                    None => tracing::debug!("Device error with nothing pending"),
                }
            }
            DeviceResponse::AuthRequired { message, .. } => {
                self.session.mark_unauthenticated();
                outbox.push(DeviceEvent::AuthenticationRequired { message });
                for kind in ACK_TARGETS {
                    registry.reject(kind, ProtocolError::AuthenticationRequired);
                }
            }
            DeviceResponse::SessionExpired { .. } => {
                self.session.mark_unauthenticated();
                outbox.push(DeviceEvent::SessionExpired);
                for kind in SESSION_EXPIRED_TARGETS {
                    registry.reject(kind, ProtocolError::SessionExpired);
                }
            }
            DeviceResponse::Locked { .. } => {
                self.session.mark_locked();
                outbox.push(DeviceEvent::DeviceLocked);
                registry.reject(CommandKind::Authenticate, ProtocolError::DeviceLocked);
            }
            DeviceResponse::WalletList(wallets) => {
                tracing::info!("Device reported {} wallet(s)", wallets.len());
                outbox.push(DeviceEvent::WalletListReceived(wallets.clone()));
                registry.resolve(CommandKind::ListWallets, Reply::Wallets(wallets));
            }
            DeviceResponse::WalletSelected { payload } => {
                let wallet_index = registry.wallet_index(CommandKind::SelectWallet).or_else(|| {
                    payload
                        .get("wallet_index")
                        .and_then(Value::as_u64)
                        .and_then(|i| u32::try_from(i).ok())
                });
                if let Some(index) = wallet_index {
                    self.session.set_active_wallet(index);
                }
                outbox.push(DeviceEvent::WalletSelected { wallet_index });
                registry.resolve(CommandKind::SelectWallet, Reply::ack(None, payload));
            }
            DeviceResponse::GestureSaved { message, payload } => {
                outbox.push(DeviceEvent::GestureSaved);
                registry.resolve(CommandKind::SaveGesture, Reply::Ack { message, payload });
            }
            DeviceResponse::GestureVerified { message, payload } => {
                outbox.push(DeviceEvent::GestureVerified);
                registry.resolve(CommandKind::VerifyGesture, Reply::Ack { message, payload });
            }
            DeviceResponse::GestureMismatch { message, .. } => {
                outbox.push(DeviceEvent::GestureMismatch {
                    message: message.clone(),
                });
                registry.reject(
                    CommandKind::VerifyGesture,
                    ProtocolError::GestureMismatch(
                        message.unwrap_or_else(|| "Gesture does not match".to_string()),
                    ),
                );
            }
            DeviceResponse::SavedGesture(code) => {
                if !registry.resolve(CommandKind::GetSavedGesture, Reply::Gesture(code.clone())) {
                    tracing::debug!("Saved gesture arrived late, caching for next request");
                    state.cached_gesture = Some(code);
                }
            }
            DeviceResponse::WalletCreated(created) => {
                tracing::info!("Wallet created at index {:?}", created.wallet_index);
                outbox.push(DeviceEvent::WalletCreated(created.clone()));
                registry.resolve(CommandKind::CreateWallet, Reply::Created(created));
            }
            DeviceResponse::EmergencyWipeComplete => {
                tracing::warn!("Device reports emergency wipe complete");
                outbox.push(DeviceEvent::EmergencyWipeComplete);
                registry.resolve(CommandKind::EmergencyWipe, Reply::ack(None, Value::Null));
            }
            DeviceResponse::Unrecognized { status } => {
                tracing::debug!("Ignoring response with status '{}'", status);
            }
        }
        drop(guard);

        for event in outbox {
            self.events.publish(event);
        }
    }

    fn on_success(
        &self,
        registry: &mut PendingRegistry,
        outbox: &mut Vec<DeviceEvent>,
        message: Option<String>,
        payload: Value,
    ) {
        outbox.push(DeviceEvent::AuthenticationSuccess {
            message: message.clone(),
        });

        if registry.resolve(
            CommandKind::Authenticate,
            Reply::ack(message.as_deref(), payload.clone()),
        ) {
            self.session.mark_authenticated();
        }

        // One bare ack may answer several write-style commands
        if is_ack(message.as_deref()) {
            for kind in ACK_TARGETS {
                registry.resolve(kind, Reply::ack(message.as_deref(), payload.clone()));
            }
        }
    }
}

fn settled(received: Result<Outcome, tokio::sync::oneshot::error::RecvError>) -> Outcome {
    received.unwrap_or(Err(ProtocolError::Disconnected))
}

impl LinkObserver for Correlator {
    fn on_link_open(&self, device: &DiscoveredDevice) {
        {
            let mut state = self.state.lock();
            state.reassembly.clear();
            state.cached_gesture = None;
        }
        self.session.on_connected(device.clone());
    }

    fn on_notification(&self, value: &str) {
        self.handle_notification(value);
    }

    fn on_link_closed(&self, error: Option<&str>) {
        let rejected = {
            let mut state = self.state.lock();
            state.reassembly.clear();
            state.cached_gesture = None;
            state.registry.reject_all(&ProtocolError::Disconnected)
        };
        if rejected > 0 {
            tracing::info!(
                "Rejected {} pending operation(s) on disconnect ({})",
                rejected,
                error.unwrap_or("requested")
            );
        }
        self.session.on_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::LoopbackTransport;
    use base64::Engine as _;

    fn shoe() -> DiscoveredDevice {
        DiscoveredDevice {
            id: "test-shoe".to_string(),
            name: "SuiStep".to_string(),
            rssi: None,
        }
    }

    async fn setup() -> (Arc<Correlator>, Arc<LoopbackTransport>, EventBus) {
        let transport = LoopbackTransport::with_devices(vec![shoe()]);
        let _link = transport.connect(&shoe(), 185).await.unwrap();
        let events = EventBus::default();
        let correlator = Arc::new(Correlator::new(
            transport.clone(),
            Arc::new(Session::new()),
            events.clone(),
            CommandTimeouts::default(),
        ));
        correlator.on_link_open(&shoe());
        (correlator, transport, events)
    }

    async fn until_pending(correlator: &Correlator, kinds: &[CommandKind]) {
        while !kinds.iter().all(|k| correlator.pending_kinds().contains(k)) {
            tokio::task::yield_now().await;
        }
    }

    fn deliver(correlator: &Correlator, json: &str) {
        correlator.handle_notification(&base64::engine::general_purpose::STANDARD.encode(json));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_success_with_ack_settles_every_waiting_write() {
        let (correlator, _transport, _events) = setup().await;

        let (auth, save, change, _) = tokio::join!(
            correlator.send(Command::authenticate("1234")),
            correlator.send(Command::save_gesture("...")),
            correlator.send(Command::change_password("1", "2")),
            async {
                until_pending(
                    &correlator,
                    &[CommandKind::Authenticate, CommandKind::SaveGesture, CommandKind::ChangePassword],
                )
                .await;
                deliver(&correlator, r#"{"status":"success","message":"OK"}"#);
            }
        );

        assert!(matches!(auth, Ok(Reply::Ack { .. })));
        assert!(save.is_ok());
        assert!(change.is_ok());
        assert!(correlator.session().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_without_ack_code_leaves_gesture_ops_waiting() {
        let (correlator, _transport, _events) = setup().await;

        let (save, _) = tokio::join!(correlator.send(Command::save_gesture("-.-")), async {
            until_pending(&correlator, &[CommandKind::SaveGesture]).await;
            deliver(&correlator, r#"{"status":"success","message":"welcome"}"#);
            assert_eq!(correlator.pending_kinds(), vec![CommandKind::SaveGesture]);
            // Nobody was authenticating, so the session stays as it was
            assert!(!correlator.session().is_authenticated());
            deliver(&correlator, r#"{"status":"gesture_saved"}"#);
        });

        assert!(save.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rejects_first_pending_by_priority() {
        let (correlator, _transport, _events) = setup().await;

        let (create, select, _) = tokio::join!(
            correlator.send(Command::create_wallet()),
            correlator.send(Command::select_wallet(1)),
            async {
                until_pending(&correlator, &[CommandKind::CreateWallet, CommandKind::SelectWallet]).await;
                deliver(&correlator, r#"{"s":"err","m":"no entropy"}"#);
                assert_eq!(correlator.pending_kinds(), vec![CommandKind::SelectWallet]);
                deliver(&correlator, r#"{"status":"wallet_selected"}"#);
            }
        );

        assert_eq!(create, Err(ProtocolError::Device("no entropy".to_string())));
        assert!(select.is_ok());
        assert_eq!(correlator.session().active_wallet(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signing_error_goes_to_signing_op() {
        let (correlator, _transport, _events) = setup().await;

        let (save, sign, _) = tokio::join!(
            correlator.send(Command::save_gesture(".-")),
            correlator.send(Command::sign_transaction(0, "AAEC")),
            async {
                until_pending(&correlator, &[CommandKind::SaveGesture, CommandKind::SignTransaction]).await;
                deliver(
                    &correlator,
                    r#"{"status":"error","action":"sign_transaction","payload":{"message":"bad tx"}}"#,
                );
                deliver(&correlator, r#"{"status":"gesture_saved"}"#);
            }
        );

        assert_eq!(sign, Err(ProtocolError::Device("bad tx".to_string())));
        assert!(save.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signature_outranks_generic_success() {
        let (correlator, _transport, _events) = setup().await;

        let (auth, sign, _) = tokio::join!(
            correlator.send(Command::authenticate("1234")),
            correlator.send(Command::sign_transaction(0, "AAEC")),
            async {
                until_pending(&correlator, &[CommandKind::Authenticate, CommandKind::SignTransaction]).await;
                deliver(&correlator, r#"{"status":"ok","payload":{"signature_base64":"c2ln"}}"#);
                // The signature frame must not have been taken as a login
                assert_eq!(correlator.pending_kinds(), vec![CommandKind::Authenticate]);
                deliver(&correlator, r#"{"status":"ok","payload":{"signature_base64":"c2ln"}}"#);
            }
        );

        assert_eq!(sign, Ok(Reply::Signature("c2ln".to_string())));
        // With no signing pending, the second frame was a plain success
        assert!(auth.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_invalidation_rejects_waiting_ops() {
        let (correlator, _transport, events) = setup().await;
        let mut rx = events.subscribe();
        correlator.session().mark_authenticated();

        let (verify, _) = tokio::join!(correlator.send(Command::verify_gesture("...")), async {
            until_pending(&correlator, &[CommandKind::VerifyGesture]).await;
            deliver(&correlator, r#"{"status":"info","payload":{"session_expired":true}}"#);
        });
        assert_eq!(verify, Err(ProtocolError::SessionExpired));
        assert!(!correlator.session().is_authenticated());
        assert_eq!(rx.recv().await.unwrap(), DeviceEvent::SessionExpired);

        let (change, _) = tokio::join!(correlator.send(Command::change_password("1", "2")), async {
            until_pending(&correlator, &[CommandKind::ChangePassword]).await;
            deliver(&correlator, r#"{"s":"auth"}"#);
        });
        assert_eq!(change, Err(ProtocolError::AuthenticationRequired));

        let (auth, _) = tokio::join!(correlator.send(Command::authenticate("0000")), async {
            until_pending(&correlator, &[CommandKind::Authenticate]).await;
            deliver(&correlator, r#"{"status":"locked"}"#);
        });
        assert_eq!(auth, Err(ProtocolError::DeviceLocked));
        assert_eq!(correlator.session().snapshot().auth, crate::session::AuthState::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gesture_mismatch_rejects_verify() {
        let (correlator, _transport, _events) = setup().await;

        let (verify, _) = tokio::join!(correlator.send(Command::verify_gesture("...")), async {
            until_pending(&correlator, &[CommandKind::VerifyGesture]).await;
            deliver(&correlator, r#"{"status":"gesture_mismatch","message":"try again"}"#);
        });
        assert_eq!(verify, Err(ProtocolError::GestureMismatch("try again".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_listeners_may_query_the_correlator() {
        let (correlator, _transport, events) = setup().await;
        let inspector = correlator.clone();
        let seen = events.once(move |event| {
            matches!(event, DeviceEvent::WalletListReceived(_)) && inspector.pending_kinds().is_empty()
        });

        let (list, _) = tokio::join!(correlator.send(Command::list_wallets()), async {
            until_pending(&correlator, &[CommandKind::ListWallets]).await;
            deliver(&correlator, r#"{"status":"wallet_list","payload":{"wallets":[{"address":"ab"}]}}"#);
        });

        assert_eq!(list.unwrap(), Reply::Wallets(crate::wallet::wallets_from_payload(
            &serde_json::json!({ "wallets": [{ "address": "ab" }] })
        )));
        assert!(matches!(seen.await.unwrap(), DeviceEvent::WalletListReceived(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_saved_gesture_is_cached_once() {
        let (correlator, _transport, _events) = setup().await;

        deliver(&correlator, r#"{"status":"saved_morse","payload":{"morse":"...."}}"#);
        assert_eq!(correlator.take_cached_gesture().as_deref(), Some("...."));
        assert_eq!(correlator.take_cached_gesture(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_closed_rejects_everything() {
        let (correlator, _transport, _events) = setup().await;
        correlator.session().mark_authenticated();

        let (list, wipe, _) = tokio::join!(
            correlator.send(Command::list_wallets()),
            correlator.send(Command::emergency_wipe()),
            async {
                until_pending(&correlator, &[CommandKind::ListWallets, CommandKind::EmergencyWipe]).await;
                correlator.on_link_closed(Some("out of range"));
            }
        );

        assert_eq!(list, Err(ProtocolError::Disconnected));
        assert_eq!(wipe, Err(ProtocolError::Disconnected));
        assert!(!correlator.session().is_connected());
        assert_eq!(
            correlator.send(Command::list_wallets()).await,
            Err(ProtocolError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_unregisters_op() {
        let (correlator, transport, _events) = setup().await;
        transport.fail_writes(Some(crate::ble::BleError::TransmissionFailed("gatt 133".into())));

        let result = correlator.send(Command::list_wallets()).await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
        assert!(correlator.pending_kinds().is_empty());
    }
}
