use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{command::command_preview, mux::MuxState};

const BOOT_COMMAND: &str = "DISABLED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRequestedCommand {
    /// Bounded preview of the payload as received.
    pub raw: String,
    pub state: MuxState,
    /// Monotonic receive time; `None` until the first command arrives.
    pub received_ms: Option<u64>,
}

impl Default for LastRequestedCommand {
    fn default() -> Self {
        Self {
            raw: BOOT_COMMAND.to_string(),
            state: MuxState::Disabled,
            received_ms: None,
        }
    }
}

/// Last requested state, shared between transport handlers and the apply path.
///
/// Every read returns a value written whole by a single `record`/`set`.
#[derive(Debug, Default)]
pub struct MuxStateCell {
    inner: Mutex<LastRequestedCommand>,
}

impl MuxStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `state` as if its token had been received, with no receive time.
    pub fn set(&self, state: MuxState) {
        *self.lock() = LastRequestedCommand {
            raw: state.token().to_string(),
            state,
            received_ms: None,
        };
    }

    pub fn record(&self, raw: &[u8], state: MuxState, now_ms: u64) {
        let entry = LastRequestedCommand {
            raw: command_preview(raw),
            state,
            received_ms: Some(now_ms),
        };
        *self.lock() = entry;
    }

    pub fn get(&self) -> MuxState {
        self.lock().state
    }

    pub fn last(&self) -> LastRequestedCommand {
        self.lock().clone()
    }

    // A panicked writer cannot leave a half-written value behind: the slot is replaced whole.
    fn lock(&self) -> MutexGuard<'_, LastRequestedCommand> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
