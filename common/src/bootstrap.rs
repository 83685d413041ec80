use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{StoreError, StoredCredential};

pub const SSID_MAX_BYTES: usize = 32;
pub const PASSPHRASE_MAX_BYTES: usize = 64;

/// UTF-8 string of at most `N` bytes.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct BoundedString<const N: usize>(String);

impl<const N: usize> BoundedString<N> {
    /// Rejects input longer than `N` bytes.
    pub fn parse(value: &str) -> Option<Self> {
        (value.len() <= N).then(|| Self(value.to_string()))
    }

    /// Cuts at the last char boundary that fits in `N` bytes.
    pub fn truncate(value: &str) -> Self {
        let mut end = value.len().min(N);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        Self(value[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub const fn capacity() -> usize {
        N
    }
}

impl<const N: usize> fmt::Debug for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Ssid = BoundedString<SSID_MAX_BYTES>;
pub type Passphrase = BoundedString<PASSPHRASE_MAX_BYTES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("ssid is required")]
    MissingSsid,
    #[error("password is required")]
    MissingPassphrase,
    #[error("ssid exceeds 32 bytes")]
    SsidTooLong,
    #[error("password exceeds 64 bytes")]
    PassphraseTooLong,
}

/// Station credentials for the network the device joins in connected mode.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredential {
    ssid: Ssid,
    passphrase: Passphrase,
}

impl NetworkCredential {
    pub fn new(ssid: &str, passphrase: &str) -> Result<Self, CredentialError> {
        if ssid.is_empty() {
            return Err(CredentialError::MissingSsid);
        }
        if passphrase.is_empty() {
            return Err(CredentialError::MissingPassphrase);
        }

        Ok(Self {
            ssid: Ssid::parse(ssid).ok_or(CredentialError::SsidTooLong)?,
            passphrase: Passphrase::parse(passphrase).ok_or(CredentialError::PassphraseTooLong)?,
        })
    }

    pub fn ssid(&self) -> &str {
        self.ssid.as_str()
    }

    pub fn passphrase(&self) -> &str {
        self.passphrase.as_str()
    }
}

impl fmt::Debug for NetworkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredential")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapMode {
    Provisioning,
    Connected,
}

impl BootstrapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningReason {
    NoCredentials,
    /// One key present but empty or missing.
    IncompleteCredentials,
    StoreUnavailable,
}

impl ProvisioningReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCredentials => "no stored credentials",
            Self::IncompleteCredentials => "stored credentials incomplete",
            Self::StoreUnavailable => "credential store unreadable",
        }
    }
}

/// Boot-time decision; fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPlan {
    Connected(NetworkCredential),
    Provisioning { reason: ProvisioningReason },
}

impl BootPlan {
    pub fn select(stored: Result<StoredCredential, StoreError>) -> Self {
        let stored = match stored {
            Ok(stored) => stored,
            Err(_) => {
                return Self::Provisioning {
                    reason: ProvisioningReason::StoreUnavailable,
                }
            }
        };

        match (stored.ssid, stored.passphrase) {
            (None, None) => Self::Provisioning {
                reason: ProvisioningReason::NoCredentials,
            },
            (Some(ssid), Some(passphrase)) if !ssid.is_empty() && !passphrase.is_empty() => {
                match NetworkCredential::new(ssid.as_str(), passphrase.as_str()) {
                    Ok(credential) => Self::Connected(credential),
                    Err(_) => Self::Provisioning {
                        reason: ProvisioningReason::IncompleteCredentials,
                    },
                }
            }
            _ => Self::Provisioning {
                reason: ProvisioningReason::IncompleteCredentials,
            },
        }
    }

    pub fn mode(&self) -> BootstrapMode {
        match self {
            Self::Connected(_) => BootstrapMode::Connected,
            Self::Provisioning { .. } => BootstrapMode::Provisioning,
        }
    }
}
