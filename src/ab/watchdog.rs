//! Boot watchdog: roll back unless the active slot is confirmed in time.

use super::{AbController, BootPhase, Rebooter, Slot};
use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const VERIFYING: u8 = 0;
const STABLE: u8 = 1;
const ROLLING_BACK: u8 = 2;
/// `confirm` is persisting the stable flag; the deadline waits for it.
const CONFIRMING: u8 = 3;

/// How a watched boot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Confirmed through [`Watchdog::confirm`].
    Confirmed,
    /// Another process persisted the stable flag.
    ConfirmedExternally,
    RolledBack { from: Slot, to: Slot },
}

struct Shared {
    phase: AtomicU8,
    cancel: Notify,
}

/// A single timer task racing confirmation against rollback.
///
/// Exactly one of the two wins: both go through a compare-and-swap on the
/// shared phase, and a rollback is final once it has started. A
/// confirmation only counts once it is persisted; if persisting fails the
/// slot goes back to verifying and the deadline still applies.
pub struct Watchdog {
    slot: Slot,
    shared: Arc<Shared>,
    controller: Arc<AbController>,
    handle: JoinHandle<Result<WatchdogOutcome>>,
}

impl Watchdog {
    /// Start watching `slot`. Must be called inside a tokio runtime.
    pub fn spawn(slot: Slot, controller: Arc<AbController>, rebooter: Arc<dyn Rebooter>) -> Self {
        let shared = Arc::new(Shared {
            phase: AtomicU8::new(VERIFYING),
            cancel: Notify::new(),
        });
        let handle = tokio::spawn(run(
            slot,
            shared.clone(),
            controller.clone(),
            rebooter,
        ));
        Self {
            slot,
            shared,
            controller,
            handle,
        }
    }

    pub fn phase(&self) -> BootPhase {
        match self.shared.phase.load(Ordering::SeqCst) {
            VERIFYING | CONFIRMING => BootPhase::Verifying(self.slot),
            STABLE => BootPhase::Stable(self.slot),
            _ => BootPhase::RollingBack {
                from: self.slot,
                to: self.slot.other(),
            },
        }
    }

    /// Mark the slot stable and stop the timer.
    ///
    /// Fails once the rollback has started; the device is about to reboot
    /// into the other slot.
    pub fn confirm(&self) -> Result<()> {
        match self.shared.phase.compare_exchange(
            VERIFYING,
            CONFIRMING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STABLE) => return Ok(()),
            Err(CONFIRMING) => bail!("slot {} is already being confirmed", self.slot),
            Err(_) => bail!("slot {} is already rolling back", self.slot),
        }

        let persisted = self.controller.mark_stable();
        self.settle(persisted.is_ok());
        persisted.map(|_| ())
    }

    /// Leave CONFIRMING and wake the timer task to look at the result.
    fn settle(&self, persisted: bool) {
        let phase = if persisted { STABLE } else { VERIFYING };
        self.shared.phase.store(phase, Ordering::SeqCst);
        self.shared.cancel.notify_one();
    }

    pub async fn wait(self) -> Result<WatchdogOutcome> {
        self.handle
            .await
            .map_err(|e| anyhow!("watchdog task failed: {}", e))?
    }
}

async fn run(
    slot: Slot,
    shared: Arc<Shared>,
    controller: Arc<AbController>,
    rebooter: Arc<dyn Rebooter>,
) -> Result<WatchdogOutcome> {
    let config = controller.config().clone();
    info!(
        slot = %slot,
        timeout_secs = config.timeout.as_secs(),
        "watchdog armed"
    );

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(config.poll_interval);

    loop {
        tokio::select! {
            _ = shared.cancel.notified() => {
                if shared.phase.load(Ordering::SeqCst) == STABLE {
                    info!(slot = %slot, "slot confirmed, watchdog stopped");
                    return Ok(WatchdogOutcome::Confirmed);
                }
                debug!(slot = %slot, "confirmation not persisted, still verifying");
            }
            _ = poll.tick() => {
                if controller.is_stable()
                    && shared
                        .phase
                        .compare_exchange(VERIFYING, STABLE, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    info!(slot = %slot, "slot confirmed by another process");
                    return Ok(WatchdogOutcome::ConfirmedExternally);
                }
                debug!(slot = %slot, "still verifying");
            }
            _ = &mut deadline => break,
        }
    }

    loop {
        match shared.phase.compare_exchange(
            VERIFYING,
            ROLLING_BACK,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(STABLE) => return Ok(WatchdogOutcome::Confirmed),
            Err(_) => {
                debug!(slot = %slot, "deadline reached while confirming");
                shared.cancel.notified().await;
            }
        }
    }

    warn!(slot = %slot, "slot not confirmed before the deadline");
    match controller.roll_back()? {
        Some(state) => {
            rebooter.reboot()?;
            Ok(WatchdogOutcome::RolledBack {
                from: slot,
                to: state.active,
            })
        }
        None => {
            shared.phase.store(STABLE, Ordering::SeqCst);
            Ok(WatchdogOutcome::ConfirmedExternally)
        }
    }
}
