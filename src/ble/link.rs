//! Link lifecycle: the one live connection to a shoe
//!
//! A [`Link`] is an explicit handle over a [`ShoeTransport`]. Only one may be
//! open per process; opening a second fails with [`BleError::AlreadyInUse`]
//! until the first is destroyed or dropped.
//!
//! The link owns the scan window, the connection reference and the pump task
//! that forwards notifications to a [`LinkObserver`]. Whatever way the link
//! goes down (explicit disconnect, teardown failure, radio loss) the observer
//! hears `on_link_closed` exactly once and a `Disconnected` event is published.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::adapter::{AdapterInfo, BleError, DiscoveredDevice, LinkEvent, ShoeTransport};
use crate::events::{DeviceEvent, EventBus};
use crate::settings::ShoeLinkConfig;
use crate::util::redact_device_id;

/// Receives traffic and lifecycle changes of the live link
pub trait LinkObserver: Send + Sync {
    fn on_link_open(&self, device: &DiscoveredDevice);

    /// One base64 notification value, in arrival order
    fn on_notification(&self, value: &str);

    fn on_link_closed(&self, error: Option<&str>);
}

/// Who holds the process-wide link slot
#[derive(Debug, Clone)]
pub struct ClaimInfo {
    pub id: u64,
    pub adapter: AdapterInfo,
    pub opened_at: DateTime<Utc>,
}

static CLAIM: Lazy<Mutex<Option<ClaimInfo>>> = Lazy::new(|| Mutex::new(None));
static NEXT_CLAIM_ID: AtomicU64 = AtomicU64::new(1);

/// Current holder of the link slot, if any
pub fn current_claim() -> Option<ClaimInfo> {
    CLAIM.lock().clone()
}

fn claim(adapter: AdapterInfo) -> Result<u64, BleError> {
    let mut slot = CLAIM.lock();
    if let Some(holder) = slot.as_ref() {
        tracing::warn!(
            "Link already open on {} since {}",
            holder.adapter,
            holder.opened_at.to_rfc3339()
        );
        return Err(BleError::AlreadyInUse);
    }
    let id = NEXT_CLAIM_ID.fetch_add(1, Ordering::Relaxed);
    *slot = Some(ClaimInfo {
        id,
        adapter,
        opened_at: Utc::now(),
    });
    Ok(id)
}

fn release(id: u64) {
    let mut slot = CLAIM.lock();
    if slot.as_ref().is_some_and(|holder| holder.id == id) {
        *slot = None;
        tracing::debug!("Link slot released");
    }
}

struct ScanHandle {
    id: u64,
    stop: Arc<Notify>,
}

#[derive(Default)]
struct LinkState {
    released: bool,
    scan: Option<ScanHandle>,
    next_scan_id: u64,
    device: Option<DiscoveredDevice>,
    observer: Option<Arc<dyn LinkObserver>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

struct LinkInner {
    claim_id: u64,
    transport: Arc<dyn ShoeTransport>,
    config: ShoeLinkConfig,
    events: EventBus,
    state: Mutex<LinkState>,
}

/// Handle over the single shoe connection
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Claim the process-wide link slot over `transport`
    pub fn open(
        transport: Arc<dyn ShoeTransport>,
        config: ShoeLinkConfig,
        events: EventBus,
    ) -> Result<Self, BleError> {
        let adapter = transport.adapter_info();
        let claim_id = claim(adapter.clone())?;
        tracing::info!("Link opened on {}", adapter);

        Ok(Self {
            inner: Arc::new(LinkInner {
                claim_id,
                transport,
                config,
                events,
                state: Mutex::new(LinkState::default()),
            }),
        })
    }

    /// Device held by the current connection
    pub fn device(&self) -> Option<DiscoveredDevice> {
        self.inner.state.lock().device.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().scan.is_some()
    }

    /// Whether a connection is held and the transport still reports it up
    pub async fn is_connected(&self) -> bool {
        if self.inner.state.lock().device.is_none() {
            return false;
        }
        self.inner.transport.is_connected().await
    }

    /// Start a scan window
    ///
    /// `on_found` runs once per newly seen named device. `on_end` runs exactly
    /// once, when the window elapses or the scan is stopped. A scan already in
    /// progress is stopped first.
    pub async fn scan<F, E>(&self, on_found: F, on_end: E) -> Result<(), BleError>
    where
        F: Fn(DiscoveredDevice) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        self.ensure_open()?;
        self.stop_scan().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self.inner.transport.start_scan(tx).await {
            tracing::error!("Scan failed to start: {}", e);
            self.inner.events.publish(DeviceEvent::Error(e.to_string()));
            self.inner.events.publish(DeviceEvent::ScanEnded);
            on_end();
            return Err(e);
        }

        let stop = Arc::new(Notify::new());
        let scan_id = {
            let mut state = self.inner.state.lock();
            state.next_scan_id += 1;
            let id = state.next_scan_id;
            state.scan = Some(ScanHandle {
                id,
                stop: stop.clone(),
            });
            id
        };

        let window = self.inner.config.scan_window();
        tracing::info!("Scanning for shoes ({:?} window)", window);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            let stopped_by_caller = loop {
                tokio::select! {
                    _ = &mut deadline => {
                        tracing::debug!("Scan window elapsed");
                        break false;
                    }
                    _ = stop.notified() => break true,
                    found = rx.recv() => match found {
                        Some(device) => {
                            if device.name.trim().is_empty() || !seen.insert(device.id.clone()) {
                                continue;
                            }
                            tracing::info!(
                                "Found {} ({}), rssi {:?}",
                                device.name,
                                redact_device_id(&device.id),
                                device.rssi
                            );
                            inner.events.publish(DeviceEvent::DeviceFound(device.clone()));
                            on_found(device);
                        }
                        None => break false,
                    },
                }
            };

            if !stopped_by_caller {
                inner.finish_scan(scan_id).await;
            }
            tracing::info!("Scan ended, {} device(s) seen", seen.len());
            inner.events.publish(DeviceEvent::ScanEnded);
            on_end();
        });

        Ok(())
    }

    /// Stop the current scan, if any
    pub async fn stop_scan(&self) {
        let handle = self.inner.state.lock().scan.take();
        if let Some(handle) = handle {
            handle.stop.notify_one();
            if let Err(e) = self.inner.transport.stop_scan().await {
                tracing::warn!("Failed to stop scan: {}", e);
            }
        }
    }

    /// Run one full scan window and return every named device seen
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>, BleError> {
        let found = Arc::new(Mutex::new(Vec::new()));
        let (end_tx, end_rx) = tokio::sync::oneshot::channel();

        let sink = found.clone();
        self.scan(
            move |device| sink.lock().push(device),
            move || {
                let _ = end_tx.send(());
            },
        )
        .await?;

        let _ = end_rx.await;
        let devices = std::mem::take(&mut *found.lock());
        Ok(devices)
    }

    /// Connect to `device` and forward its traffic to `observer`
    ///
    /// Any scan is stopped and any previous connection is torn down first.
    pub async fn connect(
        &self,
        device: DiscoveredDevice,
        observer: Arc<dyn LinkObserver>,
    ) -> Result<(), BleError> {
        self.ensure_open()?;
        self.stop_scan().await;
        if self.device().is_some() {
            tracing::info!("Replacing existing connection");
            // Teardown errors are already reported through the Disconnected event
            let _ = self.disconnect().await;
        }

        tracing::info!("Connecting to {} ({})", device.name, redact_device_id(&device.id));
        let notifications = match self
            .inner
            .transport
            .connect(&device, self.inner.config.requested_mtu)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Connection to {} failed: {}", device.name, e);
                self.inner.events.publish(DeviceEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.device = Some(device.clone());
            state.observer = Some(observer.clone());
            state.generation
        };
        observer.on_link_open(&device);

        let pump = tokio::spawn(pump(self.inner.clone(), generation, notifications, observer));
        self.inner.state.lock().pump = Some(pump);

        tracing::info!("Connected to {}", device.name);
        self.inner.events.publish(DeviceEvent::Connected(device));
        Ok(())
    }

    /// Tear the link down
    ///
    /// From the caller's side this always succeeds in leaving the link closed.
    /// A teardown error is still passed through, both in the `Disconnected`
    /// event and the return value.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        let (device, observer, pump) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            (state.device.take(), state.observer.take(), state.pump.take())
        };
        let Some(device) = device else {
            return Ok(());
        };

        let result = self.inner.transport.disconnect().await;
        if let Some(pump) = pump {
            pump.abort();
        }

        let error = result.as_ref().err().map(|e| e.to_string());
        match &error {
            Some(e) => tracing::warn!("Disconnected from {} with teardown error: {}", device.name, e),
            None => tracing::info!("Disconnected from {}", device.name),
        }
        if let Some(observer) = observer {
            observer.on_link_closed(error.as_deref());
        }
        self.inner.events.publish(DeviceEvent::Disconnected { error });
        result
    }

    /// Stop scanning, drop the connection and release the link slot
    pub async fn destroy(&self) {
        self.stop_scan().await;
        if let Err(e) = self.disconnect().await {
            tracing::debug!("Teardown during destroy: {}", e);
        }
        self.inner.state.lock().released = true;
        release(self.inner.claim_id);
        tracing::info!("Link destroyed");
    }

    fn ensure_open(&self) -> Result<(), BleError> {
        if self.inner.state.lock().released {
            return Err(BleError::AdapterNotAvailable);
        }
        Ok(())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(scan) = state.scan.take() {
            scan.stop.notify_one();
        }
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        drop(state);
        release(self.inner.claim_id);
    }
}

impl LinkInner {
    async fn finish_scan(&self, scan_id: u64) {
        let ours = {
            let mut state = self.state.lock();
            if state.scan.as_ref().is_some_and(|s| s.id == scan_id) {
                state.scan = None;
                true
            } else {
                false
            }
        };
        if ours {
            if let Err(e) = self.transport.stop_scan().await {
                tracing::warn!("Failed to stop scan: {}", e);
            }
        }
    }

    /// Unrequested link loss; ignored if the link was already replaced or closed
    fn handle_loss(&self, generation: u64, error: Option<String>) {
        let (device, observer) = {
            let mut state = self.state.lock();
            if state.generation != generation || state.device.is_none() {
                return;
            }
            state.pump = None;
            (state.device.take(), state.observer.take())
        };

        if let Some(device) = device {
            tracing::warn!(
                "Lost link to {}: {}",
                device.name,
                error.as_deref().unwrap_or("no reason given")
            );
        }
        if let Some(observer) = observer {
            observer.on_link_closed(error.as_deref());
        }
        self.events.publish(DeviceEvent::Disconnected { error });
    }
}

async fn pump(
    inner: Arc<LinkInner>,
    generation: u64,
    mut notifications: mpsc::UnboundedReceiver<LinkEvent>,
    observer: Arc<dyn LinkObserver>,
) {
    while let Some(event) = notifications.recv().await {
        match event {
            LinkEvent::Notification(value) => observer.on_notification(&value),
            LinkEvent::Lost(error) => {
                inner.handle_loss(generation, error);
                return;
            }
        }
    }
    inner.handle_loss(generation, Some("notification stream closed".to_string()));
}
