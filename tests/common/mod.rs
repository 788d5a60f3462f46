//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use shoelink::{DiscoveredDevice, LoopbackTransport, ShoeClient, ShoeLinkConfig};

// Only one link may be open per process, so tests touching it take turns
static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

pub fn shoe() -> DiscoveredDevice {
    DiscoveredDevice {
        id: "AA:BB:CC:DD:EE:01".to_string(),
        name: "SuiStep Shoe".to_string(),
        rssi: Some(-55),
    }
}

pub fn other_shoe() -> DiscoveredDevice {
    DiscoveredDevice {
        id: "AA:BB:CC:DD:EE:02".to_string(),
        name: "SuiStep Left".to_string(),
        rssi: Some(-70),
    }
}

pub fn client_over(transport: &Arc<LoopbackTransport>) -> ShoeClient {
    ShoeClient::new(transport.clone(), ShoeLinkConfig::default()).expect("client should open")
}

/// A client already connected to a loopback shoe
pub async fn connected_client() -> (ShoeClient, Arc<LoopbackTransport>) {
    let transport = LoopbackTransport::with_devices(vec![shoe()]);
    let client = client_over(&transport);
    client.connect(shoe()).await.expect("connect should succeed");
    (client, transport)
}

pub fn wallet_list(indices: &[u32]) -> String {
    let wallets: Vec<String> = indices
        .iter()
        .map(|i| format!(r#"{{"index":{i},"address":"{:064x}"}}"#, i + 1))
        .collect();
    format!(r#"{{"status":"wallet_list","payload":{{"wallets":[{}]}}}}"#, wallets.join(","))
}

/// Answers wallet selection and listing like a shoe holding `indices`
pub fn wallet_responder(indices: Vec<u32>) -> impl Fn(&serde_json::Value) -> Vec<String> + Send + 'static {
    move |command| match command["command"].as_str() {
        Some("select_wallet") => vec![r#"{"status":"wallet_selected"}"#.to_string()],
        Some("list_wallets") => vec![wallet_list(&indices)],
        _ => Vec::new(),
    }
}
