//! Dispatch-order selection over the live job set
//!
//! The comparator here is the single definition of "who runs first": the
//! claim scan and `list` both use it, so administrative listings match real
//! dispatch order.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::job::{Job, JobId};

/// Priority descending, then `created_at` ascending (FIFO within a band),
/// then id as a final deterministic tie-break.
pub(crate) fn dispatch_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Linear scan for the ready job that dispatches first, or `None` when
/// nothing is eligible. Runs under the store's write lock so the subsequent
/// status flip is atomic with the selection.
pub(crate) fn next_ready(jobs: &HashMap<JobId, Job>, now: DateTime<Utc>) -> Option<JobId> {
    let mut best: Option<&Job> = None;
    for job in jobs.values() {
        if !job.is_ready(now) {
            continue;
        }
        match best {
            Some(current) if dispatch_order(current, job) != Ordering::Greater => {}
            _ => best = Some(job),
        }
    }
    best.map(|job| job.id)
}
