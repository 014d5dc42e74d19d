use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-connection switch between bridged and direct dispatch.
///
/// Every mutation goes through a single acquire/release section, so two
/// overlapping toggles cannot restore a stale value: the loser reports
/// [`Error::PolicyRace`] instead of silently clobbering the winner.
pub struct PolicyToggle {
    enabled: AtomicBool,
    toggling: AtomicBool,
}

impl PolicyToggle {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            toggling: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Permanent setter.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.acquire()?;
        self.enabled.store(enabled, Ordering::Release);
        self.release();
        Ok(())
    }

    /// Force direct dispatch until the guard drops. The prior value is
    /// restored on every exit path, including panics and early returns; the
    /// toggle section stays held for the whole scope, so an overlapping
    /// mutation fails with [`Error::PolicyRace`] rather than racing the
    /// restore.
    pub fn bypass(&self) -> Result<BypassGuard<'_>> {
        self.acquire()?;
        let prior = self.enabled.swap(false, Ordering::AcqRel);
        Ok(BypassGuard {
            toggle: self,
            prior,
        })
    }

    fn acquire(&self) -> Result<()> {
        self.toggling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::PolicyRace)?;
        Ok(())
    }

    fn release(&self) {
        self.toggling.store(false, Ordering::Release);
    }
}

/// Scope during which dispatch is forced onto the direct path.
pub struct BypassGuard<'t> {
    toggle: &'t PolicyToggle,
    prior: bool,
}

impl Drop for BypassGuard<'_> {
    fn drop(&mut self) {
        self.toggle.enabled.store(self.prior, Ordering::Release);
        self.toggle.release();
    }
}
