//! Session and connection state
//!
//! `Disconnected → Connected(unauthenticated) → Connected(authenticated)`,
//! with `Locked` reachable from either connected state and the active wallet
//! as an orthogonal field. Losing the link resets everything; there is no
//! session resumption.

use parking_lot::Mutex;
use serde::Serialize;

use crate::ble::DiscoveredDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    /// The device refused further attempts; a new authentication is required
    Locked,
}

/// Point-in-time copy of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub auth: AuthState,
    pub active_wallet: Option<u32>,
    pub device: Option<DiscoveredDevice>,
}

impl SessionSnapshot {
    fn disconnected() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            auth: AuthState::Unauthenticated,
            active_wallet: None,
            device: None,
        }
    }

    pub fn authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    pub fn connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

/// What the UI shows about the current device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// A device is held by the session
    pub device_present: bool,
    pub device_name: Option<String>,
    pub device_id: Option<String>,
    /// The transport reports the link as up
    pub link_alive: bool,
    pub authenticated: bool,
    pub active_wallet: Option<u32>,
}

impl ConnectionStatus {
    pub fn from_snapshot(snapshot: &SessionSnapshot, link_alive: bool) -> Self {
        Self {
            device_present: snapshot.device.is_some(),
            device_name: snapshot.device.as_ref().map(|d| d.name.clone()),
            device_id: snapshot.device.as_ref().map(|d| d.id.clone()),
            link_alive,
            authenticated: snapshot.authenticated(),
            active_wallet: snapshot.active_wallet,
        }
    }
}

/// Shared session state, mutated by the correlator and by link lifecycle
#[derive(Debug)]
pub struct Session {
    inner: Mutex<SessionSnapshot>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionSnapshot::disconnected()),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected()
    }

    pub fn active_wallet(&self) -> Option<u32> {
        self.inner.lock().active_wallet
    }

    /// A new link always starts unauthenticated
    pub fn on_connected(&self, device: DiscoveredDevice) {
        let mut state = self.inner.lock();
        *state = SessionSnapshot {
            connection: ConnectionState::Connected,
            device: Some(device),
            ..SessionSnapshot::disconnected()
        };
    }

    pub fn on_disconnected(&self) {
        let mut state = self.inner.lock();
        if state.connected() {
            tracing::info!("Session reset after disconnect");
        }
        *state = SessionSnapshot::disconnected();
    }

    pub fn mark_authenticated(&self) {
        let mut state = self.inner.lock();
        if !state.connected() {
            tracing::debug!("Ignoring authentication without a connection");
            return;
        }
        if state.auth != AuthState::Authenticated {
            tracing::info!("Device session authenticated");
        }
        state.auth = AuthState::Authenticated;
    }

    /// The device dropped our authentication (expired or demanded re-auth)
    pub fn mark_unauthenticated(&self) {
        let mut state = self.inner.lock();
        if state.auth == AuthState::Authenticated {
            tracing::info!("Device session no longer authenticated");
        }
        if state.auth != AuthState::Locked {
            state.auth = AuthState::Unauthenticated;
        }
    }

    pub fn mark_locked(&self) {
        let mut state = self.inner.lock();
        if state.connected() {
            tracing::warn!("Device reported locked");
            state.auth = AuthState::Locked;
        }
    }

    pub fn set_active_wallet(&self, index: u32) {
        let mut state = self.inner.lock();
        if state.connected() {
            state.active_wallet = Some(index);
        }
    }
}
