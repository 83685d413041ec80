use thiserror::Error;

use crate::bootstrap::{NetworkCredential, Passphrase, Ssid};

pub const STORE_NAMESPACE: &str = "storage";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key-value store failure: {0}")]
    Backend(String),
    #[error("stored value for `{key}` is not a string")]
    InvalidValue { key: &'static str },
}

impl StoreError {
    pub fn backend(err: impl core::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// String-valued persistent storage scoped to one namespace.
pub trait KeyValueStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError>;

    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError>;
}

/// Credential keys as read back, before the completeness check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredCredential {
    pub ssid: Option<Ssid>,
    pub passphrase: Option<Passphrase>,
}

/// Typed access to the `wifi_ssid`/`wifi_pass` pair.
pub struct CredentialStore<S> {
    backend: S,
}

impl<S: KeyValueStore> CredentialStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    /// Values over the field bounds are truncated, never rejected.
    pub fn load(&self) -> Result<StoredCredential, StoreError> {
        let ssid = self.backend.get_str(KEY_WIFI_SSID)?;
        let passphrase = self.backend.get_str(KEY_WIFI_PASS)?;

        Ok(StoredCredential {
            ssid: ssid.as_deref().map(Ssid::truncate),
            passphrase: passphrase.as_deref().map(Passphrase::truncate),
        })
    }

    pub fn save(&mut self, credential: &NetworkCredential) -> Result<(), StoreError> {
        self.backend.set_str(KEY_WIFI_SSID, credential.ssid())?;
        self.backend.set_str(KEY_WIFI_PASS, credential.passphrase())
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub values: HashMap<&'static str, String>,
    }

    impl KeyValueStore for MemoryStore {
        fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError> {
            Ok(self.values.get(key).cloned())
        }

        fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError> {
            self.values.insert(key, value.to_string());
            Ok(())
        }
    }

    /// Every operation fails, as an unmounted flash partition would.
    pub(crate) struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get_str(&self, _key: &'static str) -> Result<Option<String>, StoreError> {
            Err(StoreError::backend("partition not found"))
        }

        fn set_str(&mut self, _key: &'static str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::backend("partition not found"))
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut store = CredentialStore::new(MemoryStore::default());
        let credential = NetworkCredential::new("Home", "secret").unwrap();
        store.save(&credential).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ssid.unwrap().as_str(), "Home");
        assert_eq!(loaded.passphrase.unwrap().as_str(), "secret");
        assert_eq!(store.backend().values.get(KEY_WIFI_SSID).unwrap(), "Home");
        assert_eq!(store.backend().values.get(KEY_WIFI_PASS).unwrap(), "secret");
    }

    #[test]
    fn empty_store_loads_nothing() {
        let store = CredentialStore::new(MemoryStore::default());
        assert_eq!(store.load().unwrap(), StoredCredential::default());
    }

    #[test]
    fn oversized_values_are_truncated_on_load() {
        let mut backend = MemoryStore::default();
        backend.values.insert(KEY_WIFI_SSID, "s".repeat(40));
        backend.values.insert(KEY_WIFI_PASS, "p".repeat(80));
        let store = CredentialStore::new(backend);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ssid.unwrap().as_str().len(), 32);
        assert_eq!(loaded.passphrase.unwrap().as_str().len(), 64);
    }

    #[test]
    fn backend_failures_propagate() {
        let mut store = CredentialStore::new(BrokenStore);
        assert!(store.load().is_err());
        let credential = NetworkCredential::new("Home", "secret").unwrap();
        assert!(matches!(store.save(&credential), Err(StoreError::Backend(_))));
    }
}
