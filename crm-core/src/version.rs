//! Replica identity, causal stamps, and the per-replica version state.
//!
//! Every committed transaction gets one [`Stamp`]:
//! ```text
//! ┌──────────┬───────────┬─────────┐
//! │ lamport  │ replica   │ seq     │
//! │ u64      │ 16 bytes  │ u64     │
//! └──────────┴───────────┴─────────┘
//! ```
//! `lamport` orders writes for last-write-wins, `replica` breaks ties, and
//! `(replica, seq)` names the transaction for deduplication and diffing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{strip_format, CodecError, FORMAT_VERSION};

/// Identity of one Document instance.
///
/// Ordered by UUID byte order; that order is the LWW tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Causal marker attached to every write.
///
/// Field order matters: the derived `Ord` compares `lamport` first, then
/// `replica`. `seq` never decides since one replica never reuses a lamport value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
    pub seq: u64,
}

/// Lamport clock for one replica.
#[derive(Debug, Clone, Default)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    /// Next value for a local event.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Advance past a remote value.
    pub fn observe(&mut self, remote: u64) {
        self.counter = self.counter.max(remote);
    }

    pub fn current(&self) -> u64 {
        self.counter
    }
}

/// Which transactions, per replica, have been incorporated.
///
/// `frontier[r] = n` means `(r, 1..=n)` are all present; `detached[r]`
/// holds sequence numbers above `n + 1` that arrived out of order.
/// The representation is kept normalized, so equal knowledge encodes to
/// equal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    frontier: BTreeMap<ReplicaId, u64>,
    detached: BTreeMap<ReplicaId, BTreeSet<u64>>,
}

impl VersionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, replica: ReplicaId, seq: u64) -> bool {
        if seq == 0 || seq <= self.frontier_of(replica) {
            return true;
        }
        self.detached
            .get(&replica)
            .is_some_and(|set| set.contains(&seq))
    }

    pub fn covers(&self, stamp: &Stamp) -> bool {
        self.contains(stamp.replica, stamp.seq)
    }

    /// Highest contiguous sequence number seen from `replica`.
    pub fn frontier_of(&self, replica: ReplicaId) -> u64 {
        self.frontier.get(&replica).copied().unwrap_or(0)
    }

    /// Highest sequence number seen from `replica`, contiguous or not.
    pub fn max_seq(&self, replica: ReplicaId) -> u64 {
        let detached = self
            .detached
            .get(&replica)
            .and_then(|set| set.iter().next_back().copied())
            .unwrap_or(0);
        self.frontier_of(replica).max(detached)
    }

    /// Record one transaction. Returns `false` if it was already present.
    pub fn insert(&mut self, replica: ReplicaId, seq: u64) -> bool {
        if self.contains(replica, seq) {
            return false;
        }
        self.detached.entry(replica).or_default().insert(seq);
        self.normalize(replica);
        true
    }

    /// Union with another state.
    pub fn merge(&mut self, other: &VersionState) {
        for (replica, &seq) in &other.frontier {
            let entry = self.frontier.entry(*replica).or_insert(0);
            *entry = (*entry).max(seq);
        }
        for (replica, set) in &other.detached {
            self.detached
                .entry(*replica)
                .or_default()
                .extend(set.iter().copied());
        }
        let replicas: Vec<ReplicaId> = self
            .frontier
            .keys()
            .chain(self.detached.keys())
            .copied()
            .collect();
        for replica in replicas {
            self.normalize(replica);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frontier.is_empty() && self.detached.is_empty()
    }

    /// Replicas known to this state.
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.frontier.keys()
    }

    /// Total number of transactions recorded.
    pub fn transaction_count(&self) -> u64 {
        let contiguous: u64 = self.frontier.values().sum();
        let detached: u64 = self.detached.values().map(|s| s.len() as u64).sum();
        contiguous + detached
    }

    /// Absorb detached entries that became contiguous, drop covered ones.
    fn normalize(&mut self, replica: ReplicaId) {
        let mut frontier = self.frontier_of(replica);
        if let Some(set) = self.detached.get_mut(&replica) {
            while set.remove(&(frontier + 1)) {
                frontier += 1;
            }
            set.retain(|&seq| seq > frontier);
            if set.is_empty() {
                self.detached.remove(&replica);
            }
        }
        if frontier > 0 {
            self.frontier.insert(replica, frontier);
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let body = strip_format(bytes)?;
        let (mut state, _): (VersionState, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| CodecError::Deserialization(e.to_string()))?;
        // Remote input: re-establish the normalized form.
        let replicas: Vec<ReplicaId> = state.detached.keys().copied().collect();
        for replica in replicas {
            state.normalize(replica);
        }
        state.frontier.retain(|_, seq| *seq > 0);
        Ok(state)
    }
}
