//! btleplug backend (Central role)
//!
//! Scans for the shoe's service, connects, resolves the command and notify
//! characteristics and pumps notifications into a [`LinkEvent`] channel.
//! Values are base64 at the trait boundary and raw bytes on the air.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::{AdapterInfo, BleError, DiscoveredDevice, LinkEvent, ShoeTransport};
use crate::settings::ShoeLinkConfig;
use crate::util::redact_device_id;

#[derive(Default)]
struct CentralState {
    scan_task: Option<JoinHandle<()>>,
    peripheral: Option<Peripheral>,
    command: Option<Characteristic>,
    notify_task: Option<JoinHandle<()>>,
}

/// Shoe transport over the first Bluetooth adapter of this machine
pub struct CentralTransport {
    adapter: Adapter,
    info: AdapterInfo,
    service_uuid: Uuid,
    scan_services: Vec<Uuid>,
    command_uuid: Uuid,
    notify_uuid: Uuid,
    state: Mutex<CentralState>,
}

impl CentralTransport {
    pub async fn new(config: &ShoeLinkConfig) -> Result<Self, BleError> {
        tracing::info!("📡 Initializing BLE central");

        let manager = Manager::new()
            .await
            .map_err(|e| BleError::PlatformError(format!("Failed to create BLE manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::PlatformError(format!("Failed to get adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;

        let name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown adapter".to_string());
        tracing::info!("✅ Using adapter {}", name);

        Ok(Self {
            adapter,
            info: AdapterInfo {
                platform: std::env::consts::OS.to_string(),
                name,
            },
            service_uuid: config.service_uuid,
            scan_services: config.scan_filter_services(),
            command_uuid: config.command_characteristic_uuid,
            notify_uuid: config.notify_characteristic_uuid,
            state: Mutex::new(CentralState::default()),
        })
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral, BleError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| BleError::PlatformError(format!("Failed to get peripherals: {}", e)))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or(BleError::PeripheralNotFound)
    }

    fn find_characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, BleError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == self.service_uuid)
            .ok_or_else(|| BleError::CharacteristicNotFound(uuid.to_string()))
    }
}

#[async_trait]
impl ShoeTransport for CentralTransport {
    async fn start_scan(&self, found: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<(), BleError> {
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: self.scan_services.clone(),
            })
            .await
            .map_err(|e| BleError::ScanningFailed(e.to_string()))?;
        if self.scan_services.is_empty() {
            tracing::info!("🔍 Scanning for named devices");
        } else {
            tracing::info!("🔍 Scanning for service {}", self.service_uuid);
        }

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event else {
                    continue;
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(name) = props.local_name else {
                    continue;
                };

                let device = DiscoveredDevice {
                    id: id.to_string(),
                    name,
                    rssi: props.rssi,
                };
                if found.send(device).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.state.lock().scan_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        let task = self.state.lock().scan_task.take();
        let Some(task) = task else {
            return Ok(());
        };
        task.abort();
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanningFailed(e.to_string()))
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        mtu: u16,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, BleError> {
        let peripheral = self.find_peripheral(&device.id).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| BleError::ConnectionFailed(format!("Failed to connect: {}", e)))?;
        tracing::info!("🔗 Link up with {}", redact_device_id(&device.id));

        // btleplug leaves MTU exchange to the OS stack
        tracing::debug!("Requested MTU {} left to the platform", mtu);

        peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::PlatformError(format!("Failed to discover services: {}", e)))?;
        if !peripheral.services().iter().any(|s| s.uuid == self.service_uuid) {
            return Err(BleError::ServiceNotFound);
        }
        let command = self.find_characteristic(&peripheral, self.command_uuid)?;
        let notify = self.find_characteristic(&peripheral, self.notify_uuid)?;

        peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| BleError::PlatformError(format!("Failed to subscribe: {}", e)))?;
        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.adapter.events().await?;
        tracing::info!("📥 Subscribed to notifications");

        let (tx, rx) = mpsc::unbounded_channel();
        let notify_uuid = notify.uuid;
        let peripheral_id = peripheral.id();
        let task = tokio::spawn(async move {
            let mut central_open = true;
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == notify_uuid => {
                            tracing::debug!("Received {} bytes", n.value.len());
                            if tx.send(LinkEvent::Notification(STANDARD.encode(&n.value))).is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => {
                            let _ = tx.send(LinkEvent::Lost(Some("notification stream ended".to_string())));
                            return;
                        }
                    },
                    event = central_events.next(), if central_open => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            let _ = tx.send(LinkEvent::Lost(Some("peripheral disconnected".to_string())));
                            return;
                        }
                        Some(_) => {}
                        None => central_open = false,
                    },
                }
            }
        });

        let mut state = self.state.lock();
        if let Some(previous) = state.notify_task.replace(task) {
            previous.abort();
        }
        state.peripheral = Some(peripheral);
        state.command = Some(command);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let (peripheral, task) = {
            let mut state = self.state.lock();
            state.command = None;
            (state.peripheral.take(), state.notify_task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        match peripheral {
            Some(peripheral) => peripheral
                .disconnect()
                .await
                .map_err(|e| BleError::PlatformError(format!("Failed to disconnect: {}", e))),
            None => Ok(()),
        }
    }

    async fn write(&self, value: &str) -> Result<(), BleError> {
        let (peripheral, command) = {
            let state = self.state.lock();
            match (&state.peripheral, &state.command) {
                (Some(p), Some(c)) => (p.clone(), c.clone()),
                _ => return Err(BleError::NotConnected),
            }
        };

        let bytes = STANDARD
            .decode(value)
            .map_err(|e| BleError::TransmissionFailed(format!("Value is not base64: {}", e)))?;
        peripheral
            .write(&command, &bytes, WriteType::WithResponse)
            .await
            .map_err(|e| BleError::TransmissionFailed(format!("Write failed: {}", e)))?;

        tracing::debug!("📤 Wrote {} bytes", bytes.len());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let peripheral = self.state.lock().peripheral.clone();
        match peripheral {
            Some(p) => p.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.info.clone()
    }
}
