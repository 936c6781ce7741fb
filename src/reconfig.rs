//! Reconfiguration Operations
//!
//! Transitions over the view & replica model. Replica states move
//! `None -> WriteOnly -> Readable -> ReadOnly -> None`; the operations here
//! assign view ids, refresh the catch-up bookkeeping of write-only heads and
//! take replicas out of every chain.

use chrono::{DateTime, Utc};

use crate::model::{Configuration, ReplicaStatus, View, EMPTY_VIEW_ID};

/// Version and stamp a candidate view before it is written
///
/// `current` is the latest known view of the same name (empty if none).
/// Returns the view id the candidate will carry.
pub fn sanitize_view(candidate: &mut View, current: &View, now: DateTime<Utc>) -> i64 {
    let view_id = if candidate.view_id == 0 {
        if current.is_empty() {
            1
        } else {
            current.view_id.max(EMPTY_VIEW_ID) + 1
        }
    } else {
        candidate.view_id
    };

    candidate.view_id = view_id;
    candidate.timestamp = now;

    // Write-only replicas at the head joined in this view; everything from
    // the first readable replica on keeps its join view.
    for replica in candidate.current_replica_chain_mut() {
        if !replica.is_write_only() {
            break;
        }
        replica.view_in_which_added_to_chain = view_id;
    }

    view_id
}

/// Sanitize every view of a candidate configuration
///
/// `current_view` resolves the latest known view for a name.
pub fn sanitize_configuration<F>(configuration: &mut Configuration, now: DateTime<Utc>, mut current_view: F)
where
    F: FnMut(&str) -> View,
{
    for (name, view) in configuration.view_map.iter_mut() {
        let current = current_view(name.as_str());
        let view_id = sanitize_view(view, &current, now);
        tracing::debug!(
            "sanitized view '{}': view_id {} (current {})",
            name,
            view_id,
            current.view_id
        );
    }
}

/// Take a storage account out of every chain
///
/// Returns the number of replica records switched off.
pub fn turn_replica_off(configuration: &mut Configuration, storage_account_name: &str) -> usize {
    let mut changed = 0;

    for view in configuration.view_map.values_mut() {
        for replica in view
            .current_replica_chain_mut()
            .filter(|r| r.storage_account_name == storage_account_name)
        {
            replica.status = ReplicaStatus::None;
            changed += 1;
        }
    }

    changed
}
