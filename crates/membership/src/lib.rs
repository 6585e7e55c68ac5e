//! Segment membership consistency engine: users, segments, time-bounded
//! memberships and the operation log that shadows every membership mutation.
//!
//! Every writer (engine, cohort assigner, expiration sweeper) mutates rows
//! through [`changes::apply_changes`] or [`changes::append_log`] inside a
//! single `BEGIN IMMEDIATE` transaction, so a membership row never changes
//! without its log row and a failed call never partially commits.

pub mod assigner;
pub mod changes;
pub mod duration;
pub mod engine;
pub mod history;
pub mod schema;
pub mod store;
pub mod sweeper;

pub use assigner::{AutoSegmentSummary, CohortAssigner};
pub use changes::MembershipChange;
pub use engine::{MembershipEngine, MutationSummary};
pub use history::OperationHistory;
pub use store::Store;
pub use sweeper::{run_sweep_scheduler, ExpirationSweeper, SweepOutcome};
