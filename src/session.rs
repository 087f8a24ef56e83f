use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Immutable partition identity of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardInfo {
    pub index: u32,
    pub total: u32,
}

impl ShardInfo {
    /// Returns an error unless `index < total`
    pub fn new(index: u32, total: u32) -> Result<Self, Error> {
        if index >= total {
            return Err(Error::InvalidShard { index, total });
        }
        Ok(Self { index, total })
    }

    /// `[index, total]` as sent in Identify
    pub fn as_array(&self) -> [u32; 2] {
        [self.index, self.total]
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// Resumable session state of one shard.
///
/// Treated as a value: each update produces a new instance that replaces
/// the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSessionInfo {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_sequence: Option<u64>,
}

impl ShardSessionInfo {
    pub fn new(session_id: impl Into<String>, last_sequence: Option<u64>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            last_sequence,
        }
    }

    /// Both a session id and a sequence are known
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.last_sequence.is_some()
    }

    /// Session with `sequence` applied; the sequence never moves backwards
    #[must_use]
    pub fn with_sequence(&self, sequence: u64) -> Self {
        let last_sequence = match self.last_sequence {
            Some(current) if current >= sequence => current,
            _ => sequence,
        };
        Self {
            session_id: self.session_id.clone(),
            last_sequence: Some(last_sequence),
        }
    }
}

/// Per-shard entry of a [`ClusterSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub info: ShardInfo,
    pub session: ShardSessionInfo,
}

/// Opaque session state exported for warm restarts.
///
/// Serialize it with `serde_json` (or any serde format) and hand it back to
/// [`Cluster::start_or_resume`](crate::Cluster::start_or_resume) after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub shards: Vec<ShardSnapshot>,
}

impl ClusterSnapshot {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The snapshot holds each of the shards `0..expected` exactly once
    pub fn matches(&self, expected: u32) -> bool {
        if self.shards.len() != expected as usize
            || self.shards.iter().any(|s| s.info.total != expected)
        {
            return false;
        }
        let indices: BTreeSet<u32> = self.shards.iter().map(|s| s.info.index).collect();
        indices.len() == expected as usize && indices.into_iter().eq(0..expected)
    }
}
