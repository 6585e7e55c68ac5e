//! Random cohort assigner: creates a segment and enrolls a uniformly random
//! share of the current user population in it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::index;
use rusqlite::Connection;
use segments_core::types::{validate_percentage, validate_segment_name, UserId};
use segments_core::SegmentResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::changes::{apply_changes, insert_segment, MembershipChange};
use crate::store::StoreResultExt;
use crate::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSegmentSummary {
    pub segment: String,
    pub percentage: f64,
    /// User count observed when sampling.
    pub population: usize,
    /// Enrolled users, ascending.
    pub assigned: Vec<UserId>,
}

pub struct CohortAssigner {
    store: Arc<Store>,
}

impl CohortAssigner {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create `name` and add `floor(population * percentage / 100)` distinct,
    /// uniformly chosen users to it. Segment creation, every membership row
    /// and every log row commit together or not at all.
    pub fn create_auto_segment(
        &self,
        name: &str,
        percentage: f64,
    ) -> SegmentResult<AutoSegmentSummary> {
        validate_segment_name(name)?;
        validate_percentage(percentage)?;

        let summary = self.store.write(|tx| {
            let now = self.store.now();
            populate_segment(tx, now, name, percentage, count_users)
        })?;

        metrics::counter!("membership.auto_segments").increment(1);
        info!(
            segment = %name,
            percentage,
            population = summary.population,
            assigned = summary.assigned.len(),
            "Auto segment created"
        );
        Ok(summary)
    }
}

/// Insert the segment and enroll the sampled users inside `tx`. A failing
/// `count` is treated as an empty population: the segment is still created
/// and nobody is enrolled.
fn populate_segment(
    tx: &Connection,
    now: DateTime<Utc>,
    name: &str,
    percentage: f64,
    count: impl FnOnce(&Connection) -> SegmentResult<usize>,
) -> SegmentResult<AutoSegmentSummary> {
    insert_segment(tx, name, Some(percentage))?;

    let population = match count(tx) {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, segment = %name, "User count failed, treating population as empty");
            0
        }
    };
    let sample_size = sample_size(population, percentage);

    let mut assigned: Vec<UserId> = if sample_size == 0 {
        Vec::new()
    } else {
        let ids = all_user_ids(tx)?;
        let take = sample_size.min(ids.len());
        let mut rng = rand::thread_rng();
        index::sample(&mut rng, ids.len(), take)
            .into_iter()
            .map(|i| ids[i])
            .collect()
    };
    assigned.sort_unstable();

    let changes: Vec<MembershipChange> = assigned
        .iter()
        .map(|user_id| MembershipChange::add(*user_id, name, None))
        .collect();
    apply_changes(tx, now, &changes)?;

    Ok(AutoSegmentSummary {
        segment: name.to_string(),
        percentage,
        population,
        assigned,
    })
}

fn sample_size(population: usize, percentage: f64) -> usize {
    (population as f64 * percentage / 100.0).floor() as usize
}

fn count_users(conn: &Connection) -> SegmentResult<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .store_err()?;
    Ok(count.max(0) as usize)
}

fn all_user_ids(conn: &Connection) -> SegmentResult<Vec<UserId>> {
    let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id").store_err()?;
    let ids = stmt
        .query_map([], |row| row.get(0))
        .store_err()?
        .collect::<rusqlite::Result<Vec<UserId>>>()
        .store_err()?;
    Ok(ids)
}
