use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{
    bootstrap::BootstrapMode,
    cell::MuxStateCell,
    mux::{MuxDriver, MuxState, MuxVariant, OutputLineSet, OutputLines},
    types::MuxStatusPayload,
};

pub const DEFAULT_ENFORCEMENT_PERIOD_MS: u64 = 5_000;

/// When a received command reaches the output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyPolicy {
    /// The receiving handler drives the lines before returning.
    #[default]
    Immediate,
    /// Handlers only record; the enforcement loop re-asserts the cell every period.
    Periodic,
}

/// Ties the state cell to the output driver under one apply policy.
pub struct MuxController<L> {
    variant: MuxVariant,
    policy: ApplyPolicy,
    cell: MuxStateCell,
    driver: Mutex<MuxDriver<L>>,
}

impl<L: OutputLines> MuxController<L> {
    pub fn new(variant: MuxVariant, policy: ApplyPolicy, driver: MuxDriver<L>) -> Self {
        Self {
            variant,
            policy,
            cell: MuxStateCell::new(),
            driver: Mutex::new(driver),
        }
    }

    pub fn variant(&self) -> MuxVariant {
        self.variant
    }

    pub fn policy(&self) -> ApplyPolicy {
        self.policy
    }

    pub fn cell(&self) -> &MuxStateCell {
        &self.cell
    }

    /// Records a raw command; under `Immediate` the lines are driven before this returns.
    pub fn submit(&self, raw: &[u8], now_ms: u64) -> Result<MuxState, L::Error> {
        let state = self.variant.normalize_bytes(raw);

        if self.policy == ApplyPolicy::Immediate {
            // Record and write under the driver lock so the last recorded command is the last applied.
            let mut driver = self.driver();
            self.cell.record(raw, state, now_ms);
            driver.apply(state)?;
        } else {
            self.cell.record(raw, state, now_ms);
        }
        Ok(state)
    }

    /// One enforcement cycle: read the cell and re-assert it on the lines.
    pub fn enforce(&self) -> Result<OutputLineSet, L::Error> {
        let mut driver = self.driver();
        driver.apply(self.cell.get())
    }

    pub fn applied(&self) -> Option<OutputLineSet> {
        self.driver().last_applied()
    }

    /// State currently on the lines; trails the cell by up to one period under `Periodic`.
    pub fn applied_state(&self) -> MuxState {
        self.applied()
            .and_then(MuxState::from_lines)
            .unwrap_or_default()
    }

    pub fn status(&self, now_ms: u64) -> MuxStatusPayload {
        let last = self.cell.last();
        let lines = self.applied().unwrap_or_default();

        MuxStatusPayload {
            state: last.state.token(),
            label: last.state.label(),
            enable: lines.enable,
            select1: lines.select1,
            select2: lines.select2,
            last_command: last.raw,
            command_age_ms: last.received_ms.map(|at| now_ms.saturating_sub(at)),
            mode: BootstrapMode::Connected.as_str(),
        }
    }

    fn driver(&self) -> MutexGuard<'_, MuxDriver<L>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
