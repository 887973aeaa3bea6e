//! Bluetooth Module
//!
//! BLE session core for the DSC server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (session task - public API via DscClient)              │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionManager                        │
//! │  state machine, registry, read queue, decode + publish   │
//! └──────┬──────────────────────────────────────▲───────────┘
//!        │ requests                             │ TransportEvent
//!        ▼                                      │
//! ┌─────────────────────────────────────────────┴───────────┐
//! │             Transport (WinRT / simulated)                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers, payload decoding and name lookup
//! - [`transport`] - Contract between the session core and a BLE stack
//! - [`registry`] - Characteristic resolution after discovery
//! - [`read_queue`] - One-at-a-time one-shot reads
//! - [`session`] - Connection state machine
//! - [`service`] - Session task and client handle
//! - [`simulated`] - In-process DSC server
//! - `winrt` - Windows backend (Windows only)

pub mod protocol;
pub mod read_queue;
pub mod registry;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::{BluetoothService, DscClient};
pub use session::SessionManager;
