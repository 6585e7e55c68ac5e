//! Expiration sweeper: removes memberships whose expiry has passed and logs
//! a delete for each, plus the periodic scheduler that drives it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::params;
use segments_core::types::{Operation, UserId};
use segments_core::SegmentResult;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::changes::append_log;
use crate::store::{to_millis, StoreResultExt};
use crate::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// A pass ran and removed this many memberships.
    Completed(usize),
    /// Another pass was already running.
    Skipped,
}

pub struct ExpirationSweeper {
    store: Arc<Store>,
    in_flight: Mutex<()>,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one pass, waiting for any pass already in progress to finish.
    /// Returns the number of memberships removed.
    pub fn sweep(&self) -> SegmentResult<usize> {
        let _guard = self.in_flight.lock();
        self.sweep_locked()
    }

    /// Run one pass unless another is in progress.
    pub fn try_sweep(&self) -> SegmentResult<SweepOutcome> {
        match self.in_flight.try_lock() {
            Some(_guard) => self.sweep_locked().map(SweepOutcome::Completed),
            None => Ok(SweepOutcome::Skipped),
        }
    }

    fn sweep_locked(&self) -> SegmentResult<usize> {
        let removed = self.store.write(|tx| {
            let now = self.store.now();
            let cutoff = to_millis(now);

            let expired = {
                let mut stmt = tx
                    .prepare(
                        "SELECT user_id, segment_name FROM user_segments
                         WHERE expires_at IS NOT NULL AND expires_at < ?1
                         ORDER BY user_id, segment_name",
                    )
                    .store_err()?;
                let rows = stmt
                    .query_map(params![cutoff], |row| {
                        Ok((row.get::<_, UserId>(0)?, row.get::<_, String>(1)?))
                    })
                    .store_err()?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .store_err()?;
                rows
            };
            if expired.is_empty() {
                return Ok(0);
            }

            let deleted = tx
                .execute(
                    "DELETE FROM user_segments WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![cutoff],
                )
                .store_err()?;
            debug_assert_eq!(deleted, expired.len());

            for (user_id, segment) in &expired {
                append_log(tx, *user_id, segment, Operation::Delete, now)?;
            }
            Ok(expired.len())
        })?;

        if removed > 0 {
            metrics::counter!("sweeper.removed").increment(removed as u64);
            info!(removed, "Expired memberships swept");
        } else {
            debug!("No expired memberships");
        }
        Ok(removed)
    }
}

/// Run [`ExpirationSweeper::try_sweep`] every `every` until `shutdown`
/// receives a message or its sender is dropped. Ticks that arrive while a
/// pass is still running are skipped; failed passes are logged and the loop
/// carries on.
pub async fn run_sweep_scheduler(
    sweeper: Arc<ExpirationSweeper>,
    every: Duration,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = every.as_secs(), "Expiration sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sweeper = sweeper.clone();
                match tokio::task::spawn_blocking(move || sweeper.try_sweep()).await {
                    Ok(Ok(SweepOutcome::Completed(_))) => {}
                    Ok(Ok(SweepOutcome::Skipped)) => {
                        debug!("Previous sweep still running, skipping tick");
                    }
                    Ok(Err(e)) => error!(error = %e, "Expiration sweep failed"),
                    Err(e) => error!(error = %e, "Expiration sweep task panicked"),
                }
            }
            _ = shutdown.recv() => {
                info!("Expiration sweeper shutting down");
                break;
            }
        }
    }
}
