//! Active Expiration
//!
//! Expired records are removed in two ways. Commands that read a key past its
//! expiration treat it as absent and delete it on the spot (lazy expiry, see
//! [`MdbStore::expire_lazily`]). Keys nobody reads again are found by the
//! scanner in this module.
//!
//! ## Scanner
//!
//! A batch walks up to `batch_size` records from where the previous batch
//! stopped, decoding only their headers. The resume point is the first key
//! not yet visited; when the walk falls off the end of the keyspace it is
//! reset to the start, so repeated batches keep sweeping the whole keyspace.
//! Expired keys found in a batch are deleted in one read-write transaction
//! and each deletion is propagated as `MMDEL`.
//!
//! ## Pacing
//!
//! [`ExpireController`] decides when a cycle runs and how long it may take:
//!
//! ```text
//! tick(now) ── now - last_cycle < interval ──> skip
//!     │
//!     ├── every retune_every × interval: exceedance > grow_above  → interval × 1.2
//!     │                                   exceedance < shrink_below → interval × 0.9
//!     │                                   clamp, exceedance = 1
//!     └── run batches while a batch expired > batch/4 and time < budget
//!         exceedance = max(exceedance, elapsed / budget)
//! ```
//!
//! The budget is `time_percent` of one host tick (`1s / hz`).
//!
//! ## Background task
//!
//! [`ExpirySweeper`] drives a cron closure at the host frequency on a Tokio
//! task and stops when its handle is dropped.

use crate::storage::codec;
use crate::storage::engine::{CursorOp, Engine, EngineError};
use crate::storage::store::{now_ms, Host, MdbStore};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Tunables of the active expiration cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpireConfig {
    /// Records visited per batch.
    pub batch_size: usize,

    /// Starting interval between cycles, in microseconds.
    pub default_interval_us: u64,

    /// Shortest interval the controller may settle on.
    pub min_interval_us: u64,

    /// Longest interval the controller may settle on.
    pub max_interval_us: u64,

    /// Share of one host tick a cycle may spend, in percent.
    pub time_percent: u64,

    /// Grow the interval when exceedance rises above this.
    pub grow_above: f64,

    /// Shrink the interval when exceedance stays below this.
    pub shrink_below: f64,

    pub grow_factor: f64,
    pub shrink_factor: f64,

    /// Retune every this many intervals.
    pub retune_every: u64,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            default_interval_us: 1_000_000,
            min_interval_us: 50_000,
            max_interval_us: 1_000_000,
            time_percent: 25,
            grow_above: 14.0,
            shrink_below: 4.0,
            grow_factor: 1.2,
            shrink_factor: 0.9,
            retune_every: 10,
        }
    }
}

/// Self-tuning pacing state of the scanner.
#[derive(Debug, Clone)]
pub struct ExpireController {
    config: ExpireConfig,
    interval_us: u64,
    /// Worst ratio of cycle time to budget since the last retune.
    exceedance: f64,
    last_cycle_us: Option<u64>,
    last_retune_us: Option<u64>,
}

impl ExpireController {
    pub fn new(config: ExpireConfig) -> Self {
        Self {
            interval_us: config.default_interval_us,
            config,
            exceedance: 1.0,
            last_cycle_us: None,
            last_retune_us: None,
        }
    }

    pub fn interval_us(&self) -> u64 {
        self.interval_us
    }

    pub fn exceedance(&self) -> f64 {
        self.exceedance
    }

    /// Decides whether a cycle runs at `now_us`, retuning the interval when
    /// one is due.
    pub fn tick(&mut self, now_us: u64) -> bool {
        if let Some(last) = self.last_cycle_us {
            if now_us.saturating_sub(last) < self.interval_us {
                return false;
            }
        }
        self.last_cycle_us = Some(now_us);

        match self.last_retune_us {
            None => self.last_retune_us = Some(now_us),
            Some(last) => {
                let period = self.interval_us.saturating_mul(self.config.retune_every);
                if now_us.saturating_sub(last) >= period {
                    self.retune();
                    self.last_retune_us = Some(now_us);
                }
            }
        }
        true
    }

    fn retune(&mut self) {
        let before = self.interval_us;
        let mut interval = self.interval_us as f64;
        if self.exceedance > self.config.grow_above {
            interval *= self.config.grow_factor;
        } else if self.exceedance < self.config.shrink_below {
            interval *= self.config.shrink_factor;
        }
        self.interval_us = (interval.round() as u64)
            .clamp(self.config.min_interval_us, self.config.max_interval_us);

        debug!(
            exceedance = self.exceedance,
            interval_us = self.interval_us,
            previous_us = before,
            "MDB expire cycle retuned"
        );
        self.exceedance = 1.0;
    }

    /// Time a cycle may take with the host ticking `hz` times per second.
    pub fn budget_us(&self, hz: u32) -> u64 {
        let tick_us = 1_000_000 / u64::from(hz.max(1));
        (tick_us * self.config.time_percent / 100).max(1)
    }

    /// Records how long a cycle took.
    pub fn record(&mut self, elapsed_us: u64, budget_us: u64) {
        let ratio = elapsed_us as f64 / budget_us.max(1) as f64;
        self.exceedance = self.exceedance.max(ratio);
    }
}

/// Where the next scanner batch starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor {
    resume: Option<Vec<u8>>,
}

impl ScanCursor {
    /// A cursor resuming at `key`.
    pub fn at(key: Vec<u8>) -> Self {
        Self { resume: Some(key) }
    }

    pub fn is_at_start(&self) -> bool {
        self.resume.is_none()
    }

    pub fn position(&self) -> Option<&[u8]> {
        self.resume.as_deref()
    }

    /// Visits up to `batch_size` records and returns the keys that are past
    /// their expiration at `now_ms`.
    pub fn scan(
        &mut self,
        engine: &dyn Engine,
        batch_size: usize,
        now_ms: i64,
    ) -> Result<Vec<Vec<u8>>, EngineError> {
        let txn = engine.read_txn()?;
        let mut cursor = txn.cursor()?;

        let mut entry = match self.resume.as_deref() {
            Some(key) => cursor.get(CursorOp::SetRange(key))?,
            None => None,
        };
        if entry.is_none() {
            // Resume key is past the last record: wrap around.
            entry = cursor.get(CursorOp::First)?;
        }

        let mut expired = Vec::new();
        let mut visited = 0;
        while let Some((key, raw)) = entry {
            if visited == batch_size {
                break;
            }
            visited += 1;
            if codec::decode(raw, true).is_expired(now_ms) {
                expired.push(key.to_vec());
            }
            entry = cursor.get(CursorOp::Next)?;
        }

        self.resume = entry.map(|(key, _)| key.to_vec());
        trace!(
            visited,
            expired = expired.len(),
            wrapped = self.resume.is_none(),
            "MDB expire batch scanned"
        );
        Ok(expired)
    }
}

impl MdbStore {
    /// Runs one scanner batch and deletes what it found. Returns the number
    /// of keys expired.
    pub fn expire_batch(&mut self, host: &mut dyn Host, now_ms: i64) -> Result<usize, EngineError> {
        let batch_size = self.config().expire.batch_size;
        let mut cursor = std::mem::take(&mut self.scan);
        let found = self
            .engine()
            .and_then(|engine| cursor.scan(engine, batch_size, now_ms));
        self.scan = cursor;
        self.expire_keys(&found?, host)
    }

    /// One cron invocation of the active expiration cycle.
    ///
    /// Does nothing when the layer is disabled, when this instance does not
    /// originate expiries, or when the controller says the interval has not
    /// elapsed. Returns the number of keys expired.
    pub fn active_expire_cycle(&mut self, host: &mut dyn Host, hz: u32, now_us: u64) -> usize {
        if !self.is_open() || !self.originates_expiries(host) {
            return 0;
        }
        if !self.controller.tick(now_us) {
            return 0;
        }

        let budget_us = self.controller.budget_us(hz);
        let quarter = self.config().expire.batch_size / 4;
        let started = Instant::now();
        let mut total = 0;

        loop {
            let expired = match self.expire_batch(host, now_ms()) {
                Ok(n) => n,
                Err(err) => {
                    warn!("MDB: {}", err);
                    break;
                }
            };
            total += expired;
            if expired <= quarter || started.elapsed().as_micros() as u64 >= budget_us {
                break;
            }
        }

        let elapsed_us = started.elapsed().as_micros() as u64;
        self.controller.record(elapsed_us, budget_us);

        if total > 0 {
            debug!(expired = total, elapsed_us, "MDB expire cycle");
        }
        total
    }
}

/// A handle to the running expiry cron.
///
/// When this handle is dropped, the task stops.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts calling `cron` every `period` on a background task.
    pub fn start<F>(period: Duration, cron: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(period, cron, shutdown_rx));

        info!(period_ms = period.as_millis() as u64, "MDB expiry cron started");

        Self { shutdown_tx }
    }

    /// Starts the cron at `hz` ticks per second.
    pub fn start_hz<F>(hz: u32, cron: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::start(Duration::from_micros(1_000_000 / u64::from(hz.max(1))), cron)
    }

    /// Stops the cron. Called automatically on drop.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("MDB expiry cron stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop<F>(period: Duration, mut cron: F, mut shutdown_rx: watch::Receiver<bool>)
where
    F: FnMut() + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => cron(),
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("MDB expiry cron received shutdown signal");
                    return;
                }
            }
        }
    }
}
