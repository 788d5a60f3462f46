//! Bluetooth Low Energy side of the shoe link
//!
//! `adapter` defines the transport trait, `link` manages the one live
//! connection, and the backends implement the trait: `central` over btleplug,
//! `loopback` in memory.

pub mod adapter;
#[cfg(feature = "ble")]
pub mod central;
pub mod link;
pub mod loopback;

pub use adapter::{AdapterInfo, BleError, DiscoveredDevice, LinkEvent, ShoeTransport};
#[cfg(feature = "ble")]
pub use central::CentralTransport;
pub use link::{current_claim, ClaimInfo, Link, LinkObserver};
pub use loopback::LoopbackTransport;
