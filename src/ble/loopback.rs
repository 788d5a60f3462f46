//! In-memory transport
//!
//! Plays the shoe's side of the link without a radio: it records every
//! command the app writes, can answer through a responder closure and lets a
//! test inject notifications, chunked frames, link loss and failures.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::adapter::{AdapterInfo, BleError, DiscoveredDevice, LinkEvent, ShoeTransport};

/// Turns one written command (decoded JSON) into the raw JSON responses the shoe sends back
pub type Responder = Box<dyn Fn(&Value) -> Vec<String> + Send>;

#[derive(Default)]
struct LoopbackState {
    advertised: Vec<DiscoveredDevice>,
    scan_tx: Option<mpsc::UnboundedSender<DiscoveredDevice>>,
    link_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
    connected: bool,
    negotiated_mtu: Option<u16>,
    writes: Vec<String>,
    responder: Option<Responder>,
    fail_scan: Option<BleError>,
    fail_connect: Option<BleError>,
    fail_write: Option<BleError>,
    fail_disconnect: Option<BleError>,
}

pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    write_count: watch::Sender<usize>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (write_count, _) = watch::channel(0);
        Self {
            state: Mutex::new(LoopbackState::default()),
            write_count,
        }
    }

    /// A loopback that advertises `devices` to every scan
    pub fn with_devices(devices: Vec<DiscoveredDevice>) -> Arc<Self> {
        let transport = Self::new();
        transport.state.lock().advertised = devices;
        Arc::new(transport)
    }

    /// Make a device visible; reported at once if a scan is running
    pub fn advertise(&self, device: DiscoveredDevice) {
        let mut state = self.state.lock();
        if let Some(tx) = &state.scan_tx {
            let _ = tx.send(device.clone());
        }
        state.advertised.push(device);
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan_tx.is_some()
    }

    pub fn negotiated_mtu(&self) -> Option<u16> {
        self.state.lock().negotiated_mtu
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Vec<String> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    pub fn fail_next_scan(&self, error: BleError) {
        self.state.lock().fail_scan = Some(error);
    }

    pub fn fail_next_connect(&self, error: BleError) {
        self.state.lock().fail_connect = Some(error);
    }

    pub fn fail_writes(&self, error: Option<BleError>) {
        self.state.lock().fail_write = error;
    }

    pub fn fail_next_disconnect(&self, error: BleError) {
        self.state.lock().fail_disconnect = Some(error);
    }

    /// Raw base64 values written so far
    pub fn written_values(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Written commands, decoded back to JSON
    pub fn sent_commands(&self) -> Vec<Value> {
        self.state
            .lock()
            .writes
            .iter()
            .filter_map(|value| decode_command(value))
            .collect()
    }

    /// Name of the most recent command written
    pub fn last_command_name(&self) -> Option<String> {
        self.sent_commands()
            .last()
            .and_then(|c| c.get("command").and_then(Value::as_str).map(str::to_string))
    }

    /// Wait until at least `count` writes have happened in total
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.write_count.subscribe();
        let _ = rx.wait_for(|written| *written >= count).await;
    }

    /// Deliver one raw JSON response, base64-encoded as the radio would
    pub fn notify_json(&self, json: &str) -> bool {
        self.notify_value(STANDARD.encode(json))
    }

    /// Deliver one notification value exactly as given
    pub fn notify_value(&self, value: String) -> bool {
        self.send_link_event(LinkEvent::Notification(value))
    }

    /// Deliver `json` split into `#i/n|fragment` chunks of at most `size` bytes
    pub fn notify_chunked(&self, json: &str, size: usize) -> usize {
        let chunks = chunk_frame(json, size);
        for chunk in &chunks {
            self.notify_json(chunk);
        }
        chunks.len()
    }

    /// Drop the link as if the shoe walked out of range
    pub fn lose_link(&self, reason: Option<&str>) {
        let mut state = self.state.lock();
        state.connected = false;
        if let Some(tx) = state.link_tx.take() {
            let _ = tx.send(LinkEvent::Lost(reason.map(str::to_string)));
        }
    }

    fn send_link_event(&self, event: LinkEvent) -> bool {
        match &self.state.lock().link_tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// Split a frame the way the firmware does for oversized responses
pub fn chunk_frame(json: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = json.chars().collect();
    let pieces: Vec<String> = chars
        .chunks(size.max(1))
        .map(|piece| piece.iter().collect())
        .collect();
    let total = pieces.len();
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| format!("#{}/{}|{}", i + 1, total, piece))
        .collect()
}

fn decode_command(value: &str) -> Option<Value> {
    let bytes = STANDARD.decode(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[async_trait]
impl ShoeTransport for LoopbackTransport {
    async fn start_scan(&self, found: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<(), BleError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_scan.take() {
            return Err(error);
        }
        for device in &state.advertised {
            let _ = found.send(device.clone());
        }
        state.scan_tx = Some(found);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.state.lock().scan_tx = None;
        Ok(())
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        mtu: u16,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, BleError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_connect.take() {
            return Err(error);
        }
        if !state.advertised.iter().any(|d| d.id == device.id) {
            return Err(BleError::PeripheralNotFound);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.link_tx = Some(tx);
        state.connected = true;
        state.negotiated_mtu = Some(mtu);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let mut state = self.state.lock();
        state.connected = false;
        state.link_tx = None;
        match state.fail_disconnect.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn write(&self, value: &str) -> Result<(), BleError> {
        let responses = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BleError::NotConnected);
            }
            if let Some(error) = state.fail_write.clone() {
                return Err(error);
            }
            state.writes.push(value.to_string());
            match (&state.responder, decode_command(value)) {
                (Some(responder), Some(command)) => responder(&command),
                _ => Vec::new(),
            }
        };

        self.write_count.send_modify(|count| *count += 1);
        for response in responses {
            self.notify_json(&response);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            platform: "loopback".to_string(),
            name: "in-memory shoe".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shoe() -> DiscoveredDevice {
        DiscoveredDevice {
            id: "loop-1".to_string(),
            name: "SuiStep".to_string(),
            rssi: Some(-40),
        }
    }

    #[tokio::test]
    async fn test_write_requires_link() {
        let transport = LoopbackTransport::with_devices(vec![shoe()]);
        assert_eq!(transport.write("e30=").await, Err(BleError::NotConnected));

        let _rx = transport.connect(&shoe(), 185).await.unwrap();
        assert!(transport.write("e30=").await.is_ok());
        assert_eq!(transport.negotiated_mtu(), Some(185));
        assert_eq!(transport.written_values(), vec!["e30=".to_string()]);
    }

    #[tokio::test]
    async fn test_responder_answers_through_notifications() {
        let transport = LoopbackTransport::with_devices(vec![shoe()]);
        transport.set_responder(|command| {
            assert_eq!(command["command"], "list_wallets");
            vec![r#"{"s":"wallet_list","p":{"wallets":[]}}"#.to_string()]
        });

        let mut rx = transport.connect(&shoe(), 185).await.unwrap();
        let value = STANDARD.encode(r#"{"command":"list_wallets","payload":{}}"#);
        transport.write(&value).await.unwrap();

        match rx.recv().await {
            Some(LinkEvent::Notification(v)) => {
                let text = String::from_utf8(STANDARD.decode(v).unwrap()).unwrap();
                assert!(text.contains("wallet_list"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.last_command_name().as_deref(), Some("list_wallets"));
    }

    #[tokio::test]
    async fn test_lose_link_reports_reason() {
        let transport = LoopbackTransport::with_devices(vec![shoe()]);
        let mut rx = transport.connect(&shoe(), 185).await.unwrap();

        transport.lose_link(Some("out of range"));
        assert_eq!(rx.recv().await, Some(LinkEvent::Lost(Some("out of range".to_string()))));
        assert!(!transport.is_connected().await);
    }

    #[test]
    fn test_chunk_frame() {
        assert_eq!(chunk_frame("abcde", 2), vec!["#1/3|ab", "#2/3|cd", "#3/3|e"]);
    }
}
