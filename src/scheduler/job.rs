//! Work item definitions for the scheduler.
//!
//! This module defines the values that travel through the work queue:
//!
//! - `WorkItem`: A unit of work with an identity and an opaque payload
//! - `QueueEntry`: Either a work item or a termination sentinel
//! - `EntryKind`: The payload-free tag of a queue entry
//! - `Outcome`: The classification recorded for a processed item

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unit of pipeline input.
///
/// Items are created by the producer and are immutable afterwards. Exactly one
/// worker owns an item at a time; it is dropped once its stage sequence ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<P> {
    /// Identity key used for logging, events and error reports.
    pub id: String,
    /// Opaque payload interpreted only by the item handler.
    pub payload: P,
}

impl<P> WorkItem<P> {
    /// Creates a new work item.
    pub fn new(id: impl Into<String>, payload: P) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Returns the identity key of the item.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A value occupying one slot of the work queue.
///
/// Termination is a distinct variant so it can never be mistaken for a
/// payload, however that payload is shaped.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry<P> {
    /// Real work to process.
    Item(WorkItem<P>),
    /// No more work for the worker that receives it.
    Sentinel,
}

impl<P> QueueEntry<P> {
    /// Returns the kind of this entry.
    pub fn kind(&self) -> EntryKind {
        match self {
            QueueEntry::Item(_) => EntryKind::Item,
            QueueEntry::Sentinel => EntryKind::Sentinel,
        }
    }

    /// Returns true for the termination sentinel.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, QueueEntry::Sentinel)
    }
}

impl<P> From<WorkItem<P>> for QueueEntry<P> {
    fn from(item: WorkItem<P>) -> Self {
        QueueEntry::Item(item)
    }
}

/// Kind of a queue entry, used for admission and acknowledgement accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Item,
    Sentinel,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Item => write!(f, "item"),
            EntryKind::Sentinel => write!(f, "sentinel"),
        }
    }
}

/// Classification of a processed work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage completed.
    Success,
    /// The item failed validation and never reached the external call.
    Invalid,
    /// A stage after validation failed.
    Failed,
}

impl Outcome {
    /// All outcome kinds, in reporting order.
    pub const ALL: [Outcome; 3] = [Outcome::Success, Outcome::Invalid, Outcome::Failed];

    /// Returns the label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Invalid => "invalid",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
