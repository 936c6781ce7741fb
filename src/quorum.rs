//! Blob Quorum I/O
//!
//! Reads and conditional writes of the configuration object against a fixed
//! set of blob locations. Every location is contacted concurrently, each
//! under its own deadline, and the outcome is decided against a strict
//! majority (`N/2 + 1`) of the configured locations.
//!
//! Writes have no commit or rollback phase: locations that accepted a write
//! keep it even when the overall write fails. Minority stragglers converge
//! on the next successful write.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::time::timeout;

use crate::blob::{BlobLocation, BlobStore, WriteCondition, WriteOutcome};
use crate::codec;
use crate::error::{Error, Result};
use crate::id;
use crate::model::Configuration;

/// Number of locations that form a strict majority
pub fn majority(locations: usize) -> usize {
    (locations / 2) + 1
}

/// Outcome of a quorum read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumReadResult {
    /// A majority agreed on one configuration id
    Success,
    /// A majority of locations hold no blob
    BlobNotFound,
    /// Undecodable blobs kept every id below a majority
    DecodeFailure,
    /// Locations answered but no id reached a majority
    Disagreement,
    /// Fewer than a majority of locations answered
    Unreachable,
}

impl QuorumReadResult {
    pub fn is_success(&self) -> bool {
        *self == QuorumReadResult::Success
    }
}

impl std::fmt::Display for QuorumReadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumReadResult::Success => write!(f, "Success"),
            QuorumReadResult::BlobNotFound => write!(f, "BlobNotFound"),
            QuorumReadResult::DecodeFailure => write!(f, "DecodeFailure"),
            QuorumReadResult::Disagreement => write!(f, "Disagreement"),
            QuorumReadResult::Unreachable => write!(f, "Unreachable"),
        }
    }
}

/// Outcome of a quorum write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumWriteResult {
    /// A majority accepted the write
    Success,
    /// Too few accepts; every refusal was a concurrency conflict
    NoQuorum,
    /// Too few accepts; refusals were a mix of conflicts and errors
    PartialFailure,
    /// Too few accepts; every refusal was a transport error or timeout
    NetworkError,
}

impl QuorumWriteResult {
    pub fn is_success(&self) -> bool {
        *self == QuorumWriteResult::Success
    }
}

impl std::fmt::Display for QuorumWriteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumWriteResult::Success => write!(f, "Success"),
            QuorumWriteResult::NoQuorum => write!(f, "NoQuorum"),
            QuorumWriteResult::PartialFailure => write!(f, "PartialFailure"),
            QuorumWriteResult::NetworkError => write!(f, "NetworkError"),
        }
    }
}

/// How a write is checked against what each location stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// The stored id must equal the candidate's id
    #[default]
    Conditional,
    /// Overwrite whatever configuration is stored
    Unconditional,
}

/// What one location returned to a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    Success,
    NotFound,
    DecodeError(String),
    Unreachable(String),
}

/// Per-location read result
#[derive(Debug, Clone)]
pub struct ReadBlobResult {
    pub location: BlobLocation,
    pub status: ReadStatus,
    pub configuration: Option<Configuration>,
    pub etag: Option<String>,
}

/// Result of a quorum read
#[derive(Debug, Clone)]
pub struct QuorumRead {
    pub result: QuorumReadResult,
    /// Majority configuration, set only on success
    pub configuration: Option<Configuration>,
    /// Concurrency token per location, in location order
    pub etags: Vec<Option<String>>,
}

/// What one location did with a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    Accepted,
    Conflict(String),
    Failed(String),
}

/// Result of a quorum write
#[derive(Debug, Clone)]
pub struct QuorumWrite {
    pub result: QuorumWriteResult,
    /// The configuration as written, carrying its new id
    pub written: Configuration,
    /// Per-location outcome, in location order
    pub statuses: Vec<WriteStatus>,
}

impl QuorumWrite {
    pub fn accepted(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == WriteStatus::Accepted)
            .count()
    }
}

fn deadline_error(location: &BlobLocation, deadline: Duration) -> Error {
    Error::Timeout(format!("{} after {:?}", location, deadline))
}

async fn read_location(
    store: &dyn BlobStore,
    location: &BlobLocation,
    deadline: Duration,
) -> ReadBlobResult {
    let mut result = ReadBlobResult {
        location: location.clone(),
        status: ReadStatus::NotFound,
        configuration: None,
        etag: None,
    };

    let read = timeout(deadline, store.read(location))
        .await
        .unwrap_or_else(|_| Err(deadline_error(location, deadline)));

    match read {
        Err(e) => {
            result.status = ReadStatus::Unreachable(e.to_string());
        }
        Ok(None) => {}
        Ok(Some(blob)) => {
            result.etag = Some(blob.etag);
            match codec::decode(&blob.bytes) {
                Ok(configuration) => {
                    result.status = ReadStatus::Success;
                    result.configuration = Some(configuration);
                }
                Err(e) => {
                    result.status = ReadStatus::DecodeError(e.to_string());
                }
            }
        }
    }

    tracing::trace!("read {}: {:?}", location, result.status);
    result
}

/// Read every location independently
///
/// Diagnostic view of each location; no agreement is required.
pub async fn read_all(
    store: &dyn BlobStore,
    locations: &[BlobLocation],
    deadline: Duration,
) -> Vec<ReadBlobResult> {
    join_all(
        locations
            .iter()
            .map(|location| read_location(store, location, deadline)),
    )
    .await
}

/// Decide a quorum read from per-location results
///
/// The id held by a strict majority of the configured locations wins,
/// whatever the minority holds. Returns the index of a location holding the
/// winning configuration.
fn decide_read(results: &[ReadBlobResult]) -> (QuorumReadResult, Option<usize>) {
    let quorum = majority(results.len());

    let responded = results
        .iter()
        .filter(|r| !matches!(r.status, ReadStatus::Unreachable(_)))
        .count();
    if results.is_empty() || responded < quorum {
        return (QuorumReadResult::Unreachable, None);
    }

    let not_found = results
        .iter()
        .filter(|r| r.status == ReadStatus::NotFound)
        .count();
    if not_found >= quorum {
        return (QuorumReadResult::BlobNotFound, None);
    }

    // id -> (votes, first location holding it)
    let mut votes: HashMap<&str, (usize, usize)> = HashMap::new();
    for (index, result) in results.iter().enumerate() {
        if let Some(configuration) = &result.configuration {
            let entry = votes.entry(configuration.id.as_str()).or_insert((0, index));
            entry.0 += 1;
        }
    }

    let best = votes.values().max_by_key(|(count, _)| *count).copied();
    if let Some((count, index)) = best {
        if count >= quorum {
            return (QuorumReadResult::Success, Some(index));
        }
    }

    let decode_errors = results
        .iter()
        .filter(|r| matches!(r.status, ReadStatus::DecodeError(_)))
        .count();
    let best_count = best.map(|(count, _)| count).unwrap_or(0);
    if decode_errors > 0 && best_count + decode_errors >= quorum {
        (QuorumReadResult::DecodeFailure, None)
    } else {
        (QuorumReadResult::Disagreement, None)
    }
}

/// Read the configuration agreed by a majority of locations
pub async fn read_quorum(
    store: &dyn BlobStore,
    locations: &[BlobLocation],
    deadline: Duration,
) -> QuorumRead {
    let mut results = read_all(store, locations, deadline).await;
    let (result, winner) = decide_read(&results);

    let etags = results.iter().map(|r| r.etag.clone()).collect();
    let configuration = winner.and_then(|index| results[index].configuration.take());

    match result {
        QuorumReadResult::Success => {
            tracing::debug!(
                "quorum read succeeded: id={}",
                configuration.as_ref().map(|c| c.id.as_str()).unwrap_or_default()
            );
        }
        _ => {
            for r in &results {
                tracing::debug!("quorum read {}: {} -> {:?}", result, r.location, r.status);
            }
        }
    }

    QuorumRead {
        result,
        configuration,
        etags,
    }
}

async fn write_location(
    store: &dyn BlobStore,
    location: &BlobLocation,
    expected_id: &str,
    payload: Bytes,
    mode: UpdateMode,
    deadline: Duration,
) -> WriteStatus {
    let attempt = async {
        let condition = match store.read(location).await? {
            None => WriteCondition::IfAbsent,
            Some(current) => match mode {
                UpdateMode::Unconditional => WriteCondition::IfMatch(current.etag),
                UpdateMode::Conditional => match codec::decode(&current.bytes) {
                    Ok(stored) if stored.id == expected_id => WriteCondition::IfMatch(current.etag),
                    Ok(stored) => {
                        return Ok(WriteStatus::Conflict(format!(
                            "stored id '{}' does not match '{}'",
                            stored.id, expected_id
                        )));
                    }
                    Err(e) => {
                        return Ok(WriteStatus::Conflict(format!(
                            "stored configuration does not decode: {}",
                            e
                        )));
                    }
                },
            },
        };

        Result::Ok(match store.write(location, payload, condition).await? {
            WriteOutcome::Accepted(_) => WriteStatus::Accepted,
            WriteOutcome::Conflict => {
                WriteStatus::Conflict("concurrency token changed since read".to_string())
            }
        })
    };

    let status = match timeout(deadline, attempt)
        .await
        .unwrap_or_else(|_| Err(deadline_error(location, deadline)))
    {
        Err(e) => WriteStatus::Failed(e.to_string()),
        Ok(status) => status,
    };

    tracing::trace!("write {}: {:?}", location, status);
    status
}

fn decide_write(statuses: &[WriteStatus]) -> QuorumWriteResult {
    let quorum = majority(statuses.len());
    let mut accepted = 0;
    let mut conflicts = 0;
    let mut failures = 0;

    for status in statuses {
        match status {
            WriteStatus::Accepted => accepted += 1,
            WriteStatus::Conflict(_) => conflicts += 1,
            WriteStatus::Failed(_) => failures += 1,
        }
    }

    if !statuses.is_empty() && accepted >= quorum {
        QuorumWriteResult::Success
    } else if failures == 0 && conflicts > 0 {
        QuorumWriteResult::NoQuorum
    } else if conflicts == 0 {
        QuorumWriteResult::NetworkError
    } else {
        QuorumWriteResult::PartialFailure
    }
}

/// Write a configuration to a majority of locations
///
/// The candidate's current `id` is what each location must hold in
/// [`UpdateMode::Conditional`]; the written copy carries a fresh content id.
/// Locations without a blob are created.
pub async fn write_quorum(
    store: &dyn BlobStore,
    locations: &[BlobLocation],
    candidate: &Configuration,
    mode: UpdateMode,
    deadline: Duration,
) -> Result<QuorumWrite> {
    let written = id::with_new_id(candidate)?;
    let payload = Bytes::from(codec::encode(&written)?);

    let statuses = join_all(locations.iter().map(|location| {
        write_location(
            store,
            location,
            &candidate.id,
            payload.clone(),
            mode,
            deadline,
        )
    }))
    .await;

    let result = decide_write(&statuses);

    if result.is_success() {
        for (location, status) in locations.iter().zip(&statuses) {
            if *status != WriteStatus::Accepted {
                tracing::warn!("location {} missed configuration {}: {:?}", location, written.id, status);
            }
        }
        tracing::debug!("quorum write succeeded: id={}", written.id);
    } else {
        for (location, status) in locations.iter().zip(&statuses) {
            tracing::debug!("quorum write {}: {} -> {:?}", result, location, status);
        }
    }

    Ok(QuorumWrite {
        result,
        written,
        statuses,
    })
}
