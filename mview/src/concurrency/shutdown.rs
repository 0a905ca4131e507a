//! Shutdown signalling for pipelines.
//!
//! A pipeline task receives a [`ShutdownRx`] and selects on [`ShutdownRx::changed`] next to its
//! work. The signal fires either when [`ShutdownTx::shutdown`] is called or when every
//! [`ShutdownTx`] has been dropped.

use std::sync::Arc;

use tokio::sync::watch;

/// Receiving side of the shutdown signal.
pub type ShutdownRx = watch::Receiver<()>;

/// Sending side of the shutdown signal, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<()>>);

impl ShutdownTx {
    /// Notifies every current subscriber that shutdown was requested.
    pub fn shutdown(&self) {
        self.0.send_replace(());
    }
}

/// Creates a connected pair of shutdown handles.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(Arc::new(tx)), rx)
}
