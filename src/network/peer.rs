//! Peer membership for P2P networking
//!
//! Tracks the bounded set of peer addresses the node exchanges envelopes
//! with. Identity is the address string.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Default maximum number of peers
pub const MAX_PEERS: usize = 50;

/// What to do when a new peer arrives at a full registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep existing peers, turn the newcomer away
    #[default]
    RejectNew,
    /// Make room by dropping the peer heard from least recently
    EvictLeastRecentlySeen,
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Disconnected,
}

/// Information about a known peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer's address
    pub address: String,
    /// Connection state
    pub state: PeerState,
    /// When the peer was added
    pub added_at: Instant,
    /// Last time we heard from (or added) the peer
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn new(address: String) -> Self {
        let now = Instant::now();
        Self {
            address,
            state: PeerState::Connected,
            added_at: now,
            last_seen: now,
        }
    }
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Added,
    AlreadyPresent,
    /// Registry is full and the policy keeps existing peers
    Rejected,
    /// Added after evicting the given address
    AddedAfterEvicting(String),
}

impl Admission {
    /// Whether the address is in the registry afterwards
    pub fn is_member(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Bounded, thread-safe peer set
pub struct PeerRegistry {
    max_peers: usize,
    policy: EvictionPolicy,
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new(max_peers: usize, policy: EvictionPolicy) -> Self {
        Self {
            max_peers,
            policy,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Add a peer, applying the eviction policy when full
    pub fn add_peer(&self, addr: &str) -> Admission {
        let mut peers = self.peers();

        if let Some(record) = peers.get_mut(addr) {
            record.last_seen = Instant::now();
            return Admission::AlreadyPresent;
        }

        let mut evicted = None;
        if peers.len() >= self.max_peers {
            match self.policy {
                EvictionPolicy::RejectNew => {
                    log::debug!("Peer registry full ({}), rejecting {}", self.max_peers, addr);
                    return Admission::Rejected;
                }
                EvictionPolicy::EvictLeastRecentlySeen => {
                    let oldest = peers
                        .values()
                        .min_by_key(|record| record.last_seen)
                        .map(|record| record.address.clone());
                    match oldest {
                        Some(oldest) => {
                            peers.remove(&oldest);
                            evicted = Some(oldest);
                        }
                        // Only reachable with max_peers == 0
                        None => return Admission::Rejected,
                    }
                }
            }
        }

        peers.insert(addr.to_string(), PeerRecord::new(addr.to_string()));
        drop(peers);

        match evicted {
            Some(old) => {
                log::info!("Added peer: {} (evicted {})", addr, old);
                Admission::AddedAfterEvicting(old)
            }
            None => {
                log::info!("Added peer: {}", addr);
                Admission::Added
            }
        }
    }

    /// Remove a peer. Missing addresses are ignored.
    pub fn remove_peer(&self, addr: &str) -> Option<PeerRecord> {
        let removed = self.peers().remove(addr);
        removed.map(|mut record| {
            log::info!("Removed peer: {}", addr);
            record.state = PeerState::Disconnected;
            record
        })
    }

    /// Refresh a peer's liveness timestamp
    pub fn touch(&self, addr: &str) -> bool {
        match self.peers().get_mut(addr) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Point-in-time list of peer addresses
    pub fn list_peers(&self) -> Vec<String> {
        self.peers().keys().cloned().collect()
    }

    /// Point-in-time copy of all peer records
    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers().values().cloned().collect()
    }

    pub fn get(&self, addr: &str) -> Option<PeerRecord> {
        self.peers().get(addr).cloned()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }
}
