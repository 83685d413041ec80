pub mod bootstrap;
pub mod cell;
pub mod command;
pub mod config;
pub mod enforcement;
pub mod mux;
pub mod portal;
pub mod provisioning;
pub mod query;
pub mod store;
pub mod topics;
pub mod types;

pub use bootstrap::{BootPlan, BootstrapMode, NetworkCredential, ProvisioningReason};
pub use cell::{LastRequestedCommand, MuxStateCell};
pub use command::MAX_COMMAND_BYTES;
pub use config::{DeviceConfig, MqttConfig, MuxConfig, MuxPins, RuntimeConfig};
pub use enforcement::{ApplyPolicy, MuxController};
pub use mux::{Line, MuxDriver, MuxState, MuxVariant, OutputLineSet, OutputLines};
pub use provisioning::{ProvisioningSession, SaveError, SaveRequest, ScannedNetwork};
pub use store::{CredentialStore, KeyValueStore, StoreError};
pub use topics::*;
pub use types::{ErrorBody, MuxStatusPayload};
