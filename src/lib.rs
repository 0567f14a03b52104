//! ledlink
//!
//! Controls a microcontroller-driven LED strip over a serial-over-radio link:
//! connect to a paired device, send color/brightness/animation commands, and
//! react to link and adapter state changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 ConnectionCoordinator                    │
//! │   (state machine - one authoritative view, one event    │
//! │    stream, command flow control)                         │
//! └──────────┬──────────────────┬───────────────────────────┘
//!            │                  │
//!            ▼                  ▼
//! ┌──────────────────┐  ┌──────────────┐  ┌───────────────┐
//! │  AdapterMonitor  │  │ LinkChannel  │  │   protocol    │
//! │                  │  │              │  │               │
//! │ - radio state    │  │ - socket     │  │ - Command     │
//! │   stream         │  │   owner      │  │ - wire        │
//! │ - paired devices │  │ - reader/    │  │   encoding    │
//! │                  │  │   writer     │  │               │
//! └──────────────────┘  └──────────────┘  └───────────────┘
//! ```
//!
//! The adapter and link emit events independently and in no mutual order; the
//! coordinator merges both into a single published state and guarantees it
//! never reports a connection the radio can no longer carry.
//!
//! ## Modules
//!
//! - [`models`] - shared state and event types
//! - [`error`] - the error taxonomy
//! - [`protocol`] - wire commands and their encoding
//! - [`adapter`] - the radio adapter seam
//! - [`link`] - the socket owner and transport seam
//! - [`coordinator`] - the connection state machine
//! - [`settings`] - persisted configuration
//! - [`logging`] - tracing setup

pub mod adapter;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod settings;

pub use adapter::AdapterMonitor;
pub use coordinator::{ConnectionCoordinator, CoordinatorConfig};
pub use error::{AdapterError, CommandError, ConnectError, Fault, LinkError};
pub use link::{LinkChannel, TcpTransport, Transport};
pub use models::{
    AdapterState, BtUnavailableReason, CoordinatorEvent, CoordinatorState, Device, LinkState,
};
pub use protocol::Command;
