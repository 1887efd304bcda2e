//! The closing-period update decision.
//!
//! Source data for the tail of a reporting period is re-collected several
//! times as it stabilizes, and each collection carries its own collection
//! date distinct from the calendar date the data belongs to. A stale
//! collection must never silently overwrite a newer one, while same-day
//! re-collection refreshes in place so ingestion re-runs stay idempotent.
//!
//! This module is a pure decision over dates; the caller performs or
//! skips the write according to the verdict.

use chrono::NaiveDate;
use serde::Serialize;

/// Why an update was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    /// Nothing is stored for this date yet.
    NoExisting,
    /// The incoming collection is newer than what is stored.
    NewerData,
    /// The incoming collection ran the same day as the stored one.
    SameDayRefresh,
    /// The stored collection is newer; the write must be skipped.
    ExistingIsNewer,
}

/// Verdict of [`should_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateDecision {
    /// Whether the new data should replace what is stored.
    pub should_update: bool,
    /// Why.
    pub reason: UpdateReason,
}

/// Decides whether newly collected data supersedes the stored snapshot
/// for the same calendar date.
///
/// `existing_collection_date` is the collection date recorded in the
/// stored snapshot's metadata, or `None` when no snapshot exists for the
/// date (a missing or unreadable record must not block ingestion, so the
/// caller maps that case to `None` as well).
pub fn should_update(
    existing_collection_date: Option<NaiveDate>,
    new_collection_date: NaiveDate,
) -> UpdateDecision {
    let (should_update, reason) = match existing_collection_date {
        None => (true, UpdateReason::NoExisting),
        Some(existing) if new_collection_date > existing => (true, UpdateReason::NewerData),
        Some(existing) if new_collection_date == existing => (true, UpdateReason::SameDayRefresh),
        Some(_) => (false, UpdateReason::ExistingIsNewer),
    };
    UpdateDecision {
        should_update,
        reason,
    }
}
