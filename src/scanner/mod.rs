//! BLE transport backends.
//!
//! Each backend turns radio traffic into [`Advertisement`] values delivered
//! over a channel, wrapped in a [`ScanSession`] that also carries the hook
//! used to tear the transport down at shutdown.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::Advertisement;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("Invalid adapter name '{0}', expected hciN")]
    InvalidAdapter(String),
}

/// Channel buffer size for advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Transport settings shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Adapter name, `hciN`.
    pub adapter: String,
    /// Request scan responses from advertisers.
    pub active: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            active: false,
        }
    }
}

/// Device index of an `hciN` adapter name.
pub fn adapter_index(name: &str) -> Result<u16, ScanError> {
    name.strip_prefix("hci")
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ScanError::InvalidAdapter(name.to_string()))
}

/// `clap` value parser accepting only `hciN` adapter names.
pub fn parse_adapter(s: &str) -> Result<String, String> {
    adapter_index(s).map(|_| s.to_string()).map_err(|e| e.to_string())
}

type StopHook = Box<dyn FnOnce() + Send>;

/// A running scan: the advertisement stream plus its teardown hook.
pub struct ScanSession {
    pub advertisements: mpsc::Receiver<Advertisement>,
    stop: Option<StopHook>,
}

impl ScanSession {
    pub fn new(advertisements: mpsc::Receiver<Advertisement>) -> Self {
        Self {
            advertisements,
            stop: None,
        }
    }

    /// Attach the hook run by [`ScanSession::stop`].
    pub fn on_stop(mut self, stop: impl FnOnce() + Send + 'static) -> Self {
        self.stop = Some(Box::new(stop));
        self
    }

    /// Stop the transport and release the adapter.
    pub fn stop(mut self) {
        self.advertisements.close();
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("advertisements", &self.advertisements)
            .field("stop", &self.stop.is_some())
            .finish()
    }
}

/// Start scanning with the specified backend.
pub async fn start_scan(backend: Backend, config: &ScanConfig) -> Result<ScanSession, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(config).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(config).await,
    }
}
