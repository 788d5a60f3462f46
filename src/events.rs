//! Device events for passive observers
//!
//! A broadcast channel carries every event to every subscriber. Callers that
//! want just the next matching event register a one-shot listener instead of
//! swapping handlers in and out.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use crate::ble::DiscoveredDevice;
use crate::wallet::{CreatedWallet, WalletRecord};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    DeviceFound(DiscoveredDevice),
    ScanEnded,
    Connected(DiscoveredDevice),
    Disconnected { error: Option<String> },
    AuthenticationSuccess { message: Option<String> },
    AuthenticationError { message: String },
    AuthenticationRequired { message: Option<String> },
    SessionExpired,
    DeviceLocked,
    WalletListReceived(Vec<WalletRecord>),
    WalletSelected { wallet_index: Option<u32> },
    WalletCreated(CreatedWallet),
    GestureSaved,
    GestureVerified,
    GestureMismatch { message: Option<String> },
    EmergencyWipeComplete,
    /// Transport-level failure nobody was awaiting
    Error(String),
}

type Filter = Box<dyn Fn(&DeviceEvent) -> bool + Send>;

struct OnceListener {
    filter: Filter,
    tx: oneshot::Sender<DeviceEvent>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
    once: Arc<Mutex<Vec<OnceListener>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            once: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Receive the next event matching `filter`, once
    pub fn once<F>(&self, filter: F) -> oneshot::Receiver<DeviceEvent>
    where
        F: Fn(&DeviceEvent) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.once.lock().push(OnceListener {
            filter: Box::new(filter),
            tx,
        });
        rx
    }

    pub fn publish(&self, event: DeviceEvent) {
        let matched: Vec<OnceListener> = {
            let mut listeners = self.once.lock();
            listeners.retain(|l| !l.tx.is_closed());
            let (matched, rest): (Vec<_>, Vec<_>) =
                listeners.drain(..).partition(|l| (l.filter)(&event));
            *listeners = rest;
            matched
        };
        for listener in matched {
            let _ = listener.tx.send(event.clone());
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(DeviceEvent::DeviceLocked);

        assert_eq!(a.recv().await.unwrap(), DeviceEvent::DeviceLocked);
        assert_eq!(b.recv().await.unwrap(), DeviceEvent::DeviceLocked);
    }

    #[tokio::test]
    async fn test_once_fires_for_first_match_only() {
        let bus = EventBus::default();
        let rx = bus.once(|e| matches!(e, DeviceEvent::GestureVerified | DeviceEvent::GestureMismatch { .. }));

        bus.publish(DeviceEvent::GestureSaved);
        bus.publish(DeviceEvent::GestureMismatch { message: None });
        bus.publish(DeviceEvent::GestureVerified);

        assert_eq!(rx.await.unwrap(), DeviceEvent::GestureMismatch { message: None });
        assert!(bus.once.lock().is_empty());
    }

    #[test]
    fn test_dropped_once_listener_is_pruned() {
        let bus = EventBus::default();
        drop(bus.once(|_| false));
        bus.publish(DeviceEvent::ScanEnded);
        assert!(bus.once.lock().is_empty());
    }
}
