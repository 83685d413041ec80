use thiserror::Error;

use crate::{
    bootstrap::{CredentialError, NetworkCredential},
    store::{CredentialStore, KeyValueStore, StoreError},
};

pub const MAX_SCANNED_NETWORKS: usize = 10;
/// Lets the acknowledgement flush before the device restarts.
pub const RESTART_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNetwork {
    pub ssid: String,
    /// RSSI in dBm.
    pub signal_strength: i8,
}

impl ScannedNetwork {
    pub fn new(ssid: impl Into<String>, signal_strength: i8) -> Self {
        Self {
            ssid: ssid.into(),
            signal_strength,
        }
    }
}

/// Drops hidden networks and keeps the first ten in scan order.
pub fn select_networks<I>(scan: I) -> Vec<ScannedNetwork>
where
    I: IntoIterator<Item = ScannedNetwork>,
{
    scan.into_iter()
        .filter(|network| !network.ssid.is_empty())
        .take(MAX_SCANNED_NETWORKS)
        .collect()
}

/// Networks offered on the setup page; fixed until the next restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningSession {
    networks: Vec<ScannedNetwork>,
}

impl ProvisioningSession {
    /// A failed scan still yields a session, just with nothing to choose from.
    pub fn from_scan<I, E>(scan: Result<I, E>) -> Self
    where
        I: IntoIterator<Item = ScannedNetwork>,
    {
        match scan {
            Ok(scan) => Self {
                networks: select_networks(scan),
            },
            Err(_) => Self::default(),
        }
    }

    pub fn networks(&self) -> &[ScannedNetwork] {
        &self.networks
    }
}

/// Query parameters of `GET /save`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveRequest {
    pub ssid: Option<String>,
    pub pass: Option<String>,
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("invalid credentials: {0}")]
    Invalid(#[from] CredentialError),
    #[error("failed to persist credentials: {0}")]
    Store(#[from] StoreError),
}

/// Validates and persists the submitted pair. Only `Ok` may be followed by a restart.
pub fn save_credentials<S: KeyValueStore>(
    store: &mut CredentialStore<S>,
    request: &SaveRequest,
) -> Result<NetworkCredential, SaveError> {
    let credential = NetworkCredential::new(
        request.ssid.as_deref().unwrap_or_default(),
        request.pass.as_deref().unwrap_or_default(),
    )?;
    store.save(&credential)?;
    Ok(credential)
}
