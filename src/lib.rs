pub mod analysis_tasks;
pub mod assembler;
pub mod broker;
pub mod categories;
pub mod cluster_messages;
pub mod events;
pub mod file_storage;
pub mod job;
pub mod propagation;
pub mod reducer;
pub mod time_grid;
pub mod worker_catalog;
pub mod worker_launcher;

#[cfg(test)]
mod pipeline_tests;

pub const SECONDS_PER_MINUTE: i32 = 60;

/// Sentinel for "no path within the search horizon". Kept at i32::MAX so any
/// comparison against a real cutoff rejects it before arithmetic can overflow.
pub const UNREACHED: i32 = i32::MAX;

/// Milliseconds since the unix epoch. All cross-process bookkeeping
/// (worker liveness, launch cooldowns, task redelivery deadlines) uses this
/// one clock so the numbers in logs line up.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
