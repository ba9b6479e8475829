//! Backpressure from the intake pipeline.
//!
//! When newly learned events pile up in intake faster than they can be
//! processed, syncing harder only makes the pile bigger. The snarfer watches
//! the backlog and takes permits out of circulation in proportion to it:
//!
//! ```text
//!  snarfed
//!  max_snarf ┤                 ┌──────────
//!            │               ╱
//!            │             ╱
//!          0 ┼──────────┘
//!            └──────────┬──────┬──────────▶ backlog
//!                     lower  upper
//! ```
//!
//! Permits are acquired or released one at a time, so the pool converges on
//! the target over one or more ticks rather than jumping.

use {
    crate::{
        collaborators::IntakeBacklog,
        config::SnarfConfig,
        error::{GossipSyncError, Result},
        permit_pool::PermitPool,
        shutdown::ShutdownSignal,
    },
    log::{debug, info},
    std::{
        sync::Arc,
        thread::{self, Builder, JoinHandle},
    },
};

/// Number of permits to hold idle for a given intake backlog.
pub fn desired_snarf_count(backlog: usize, config: &SnarfConfig) -> usize {
    if backlog <= config.lower_threshold {
        return 0;
    }
    if backlog >= config.upper_threshold {
        return config.max_snarf;
    }
    let progress = backlog.saturating_sub(config.lower_threshold) as f64
        / config
            .upper_threshold
            .saturating_sub(config.lower_threshold) as f64;
    (progress * config.max_snarf as f64).floor() as usize
}

/// The snarfer's permit holdings, driven one tick at a time.
#[derive(Debug)]
struct Snarfer {
    pool: Arc<PermitPool>,
    config: SnarfConfig,
    held: usize,
}

impl Snarfer {
    /// Move `held` towards the target for `backlog`. Stops early, keeping
    /// whatever it already holds, if the pool has nothing to give.
    fn tick(&mut self, backlog: usize) {
        let desired = desired_snarf_count(backlog, &self.config).min(self.pool.capacity());
        while self.held < desired {
            if !self.pool.acquire_snarfed(self.config.poll_period()) {
                debug!(
                    "snarfer holds {} of {desired} permits, pool busy; retrying next tick",
                    self.held
                );
                return;
            }
            self.held = self.held.saturating_add(1);
        }
        while self.held > desired {
            self.pool.release_snarfed();
            self.held = self.held.saturating_sub(1);
        }
    }

    fn release_all(&mut self) {
        while self.held > 0 {
            self.pool.release_snarfed();
            self.held = self.held.saturating_sub(1);
        }
    }
}

/// Background thread that keeps the snarfed permit count in line with the
/// intake backlog.
pub struct PermitSnarfer {
    thread: JoinHandle<()>,
}

impl PermitSnarfer {
    pub fn new(
        pool: Arc<PermitPool>,
        intake_backlog: IntakeBacklog,
        config: SnarfConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let name = "trv1PermitSnarf".to_string();
        let thread = Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut snarfer = Snarfer {
                    pool,
                    config,
                    held: 0,
                };
                Self::run(&mut snarfer, &intake_backlog, &shutdown);
            })
            .map_err(|source| GossipSyncError::ThreadSpawn { name, source })?;
        Ok(Self { thread })
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }

    fn run(snarfer: &mut Snarfer, intake_backlog: &IntakeBacklog, shutdown: &ShutdownSignal) {
        let poll_period = snarfer.config.poll_period();
        while !shutdown.wait(poll_period) {
            snarfer.tick(intake_backlog());
        }
        info!("permit snarfer exiting, releasing {} permits", snarfer.held);
        snarfer.release_all();
    }
}
