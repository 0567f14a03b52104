//! Adapter Monitor
//!
//! Seam between the coordinator and the platform radio adapter. The platform
//! side (BlueZ, WinRT, a test double) implements [`AdapterMonitor`]; the
//! coordinator only ever sees the trait.

use tokio::sync::broadcast;

use crate::error::AdapterError;
use crate::models::{AdapterState, Device};

/// Wraps the platform radio adapter.
///
/// `observe()` hands out a hot, multicast, replay-none stream: a late
/// subscriber receives only events emitted after it subscribed. Stream silence
/// therefore carries no meaning — callers seed their own view with
/// [`query_state`] on every (re)subscription.
pub trait AdapterMonitor: Send + Sync + 'static {
    /// Subscribe to adapter state changes.
    fn observe(&self) -> broadcast::Receiver<AdapterState>;

    /// Whether the radio is currently powered on.
    fn is_enabled(&self) -> Result<bool, AdapterError>;

    /// Whether this machine has a usable radio at all.
    fn is_supported(&self) -> bool;

    /// The paired-device registry, name → address. Read-only snapshot.
    fn paired_devices(&self) -> Vec<Device>;
}

/// Resolve the current adapter state by asking, not waiting.
///
/// Query failures map to `NotSupported`: if the platform cannot even answer
/// "is the radio on", the session treats the radio as absent.
pub fn query_state<A: AdapterMonitor + ?Sized>(adapter: &A) -> AdapterState {
    if !adapter.is_supported() {
        return AdapterState::NotSupported;
    }
    match adapter.is_enabled() {
        Ok(true) => AdapterState::Enabled,
        Ok(false) => AdapterState::Disabled,
        Err(err) => {
            tracing::warn!("adapter query failed, treating radio as unsupported: {err}");
            AdapterState::NotSupported
        }
    }
}
