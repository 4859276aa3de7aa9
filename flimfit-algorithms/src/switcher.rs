//! Multi-channel front end with a single live worker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::scheduler::{BurnInScheduler, SchedulerHandle, SchedulerStatus};
use flimfit_core::curve::validate_component_count;
use flimfit_core::error::{Error, Result};
use flimfit_core::volume::PixelMask;

struct Channel {
    scheduler: Arc<Mutex<BurnInScheduler>>,
    handle: SchedulerHandle,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, BurnInScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a change directly unless `live` and the worker holds the
    /// scheduler, in which case it is queued through the handle. Channels
    /// that are not live are waited for, so the change is never left queued
    /// on a scheduler that will not run.
    fn apply<I, Q>(&self, live: bool, idle: I, queued: Q) -> Result<()>
    where
        I: FnOnce(&mut BurnInScheduler) -> Result<()>,
        Q: FnOnce(&SchedulerHandle) -> Result<()>,
    {
        if !live {
            return idle(&mut self.lock());
        }
        match self.scheduler.try_lock() {
            Ok(mut scheduler) => idle(&mut scheduler),
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut scheduler = poisoned.into_inner();
                idle(&mut scheduler)
            }
            Err(TryLockError::WouldBlock) => queued(&self.handle),
        }
    }
}

#[derive(Debug)]
struct Gate {
    active: usize,
    alive: bool,
}

/// Holds one scheduler per spectral channel and runs the active one.
///
/// `run()` blocks the calling thread, which becomes the single fitting
/// worker. Switching channels stops the previous scheduler and waits for it
/// to return before the next one is started.
pub struct ChannelSwitcher {
    channels: Vec<Channel>,
    gate: Mutex<Gate>,
}

impl ChannelSwitcher {
    /// Creates a switcher with channel 0 active.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] if `schedulers` is empty.
    pub fn new(schedulers: Vec<BurnInScheduler>) -> Result<Self> {
        if schedulers.is_empty() {
            return Err(Error::InvalidChannel {
                channel: 0,
                channels: 0,
            });
        }
        let channels = schedulers
            .into_iter()
            .map(|scheduler| Channel {
                handle: scheduler.handle(),
                scheduler: Arc::new(Mutex::new(scheduler)),
            })
            .collect();
        Ok(Self {
            channels,
            gate: Mutex::new(Gate {
                active: 0,
                alive: false,
            }),
        })
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on every channel while holding the gate, flagging the one a
    /// running worker may hold.
    fn broadcast<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Channel, bool) -> Result<()>,
    {
        let gate = self.gate();
        for (index, channel) in self.channels.iter().enumerate() {
            f(channel, gate.alive && index == gate.active)?;
        }
        Ok(())
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.channels.len() {
            return Err(Error::InvalidChannel {
                channel,
                channels: self.channels.len(),
            });
        }
        Ok(())
    }

    /// Number of channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Index of the active channel.
    #[must_use]
    pub fn current(&self) -> usize {
        self.gate().active
    }

    /// Handle of one channel's scheduler.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for an out-of-range index.
    pub fn handle(&self, channel: usize) -> Result<&SchedulerHandle> {
        self.check_channel(channel)?;
        Ok(&self.channels[channel].handle)
    }

    /// Status of the active channel.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        self.channels[self.current()].handle.status()
    }

    /// Runs the active channel until [`ChannelSwitcher::stop`] is called,
    /// following channel switches as they happen.
    pub fn run(&self) {
        self.gate().alive = true;
        loop {
            let scheduler = {
                let gate = self.gate();
                if !gate.alive {
                    break;
                }
                let channel = &self.channels[gate.active];
                channel.handle.arm();
                log::debug!("running channel {}", gate.active);
                Arc::clone(&channel.scheduler)
            };
            let mut scheduler = scheduler.lock().unwrap_or_else(PoisonError::into_inner);
            scheduler.run_armed();
        }
    }

    /// Stops the worker and waits until it has returned from fitting.
    pub fn stop(&self) {
        let active = {
            let mut gate = self.gate();
            gate.alive = false;
            self.channels[gate.active].handle.stop();
            gate.active
        };
        drop(self.channels[active].lock());
    }

    /// Makes `channel` active.
    ///
    /// The previously active scheduler has stopped iterating by the time
    /// this returns; a running worker then continues with the new channel.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for an out-of-range index.
    pub fn set_current(&self, channel: usize) -> Result<()> {
        self.check_channel(channel)?;
        let previous = {
            let mut gate = self.gate();
            let previous = gate.active;
            if previous == channel {
                return Ok(());
            }
            gate.active = channel;
            self.channels[previous].handle.stop();
            previous
        };
        drop(self.channels[previous].lock());
        log::info!("switched from channel {previous} to channel {channel}");
        Ok(())
    }

    /// Runs `f` with exclusive access to one channel's scheduler. Blocks
    /// while that channel is fitting.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for an out-of-range index.
    pub fn with_scheduler<R>(
        &self,
        channel: usize,
        f: impl FnOnce(&mut BurnInScheduler) -> R,
    ) -> Result<R> {
        self.check_channel(channel)?;
        Ok(f(&mut self.channels[channel].lock()))
    }

    /// Sets the per-cell iteration budget of every channel.
    pub fn set_max_iterations(&self, max_iterations: u32) {
        for channel in &self.channels {
            channel.handle.set_max_iterations(max_iterations);
        }
    }

    /// Sets the convergence threshold of every channel.
    pub fn set_max_rcse(&self, max_rcse: f64) {
        for channel in &self.channels {
            channel.handle.set_max_rcse(max_rcse);
        }
    }

    /// Changes the component count of every channel.
    ///
    /// # Errors
    /// Returns [`Error::InvalidComponentCount`] before touching any channel.
    pub fn set_component_count(&self, components: usize) -> Result<()> {
        validate_component_count(components)?;
        self.broadcast(|channel, live| {
            channel.apply(
                live,
                |s| s.set_component_count(components),
                |h| h.set_component_count(components),
            )
        })
    }

    /// Applies a fixed-parameter mask to every channel.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFixedMask`] before touching any channel.
    pub fn set_fixed(&self, fixed: &[bool]) -> Result<()> {
        for channel in &self.channels {
            channel.handle.validate_fixed(fixed)?;
        }
        self.broadcast(|channel, live| {
            channel.apply(live, |s| s.set_fixed(fixed), |h| h.set_fixed(fixed))
        })
    }

    /// Applies an ROI mask to every channel; `None` clears it.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] before touching any channel.
    pub fn set_mask(&self, mask: Option<&PixelMask>) -> Result<()> {
        for channel in &self.channels {
            channel.handle.validate_mask(mask)?;
        }
        self.broadcast(|channel, live| {
            channel.apply(
                live,
                |s| s.set_mask(mask.cloned()),
                |h| h.set_mask(mask.cloned()),
            )
        })
    }
}

impl std::fmt::Debug for ChannelSwitcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSwitcher")
            .field("channels", &self.channels.len())
            .field("gate", &*self.gate())
            .finish()
    }
}
