//! Concurrent peer index, keyed by node id and by transport address.
//!
//! One exclusive lock covers every operation. Callers never hold a reference
//! to a `Peer` outside the critical section: access is scoped through
//! closures, and longer-lived data is copied out as [`PeerInfo`]. No lock is
//! held across a socket call.

use super::peer::{Peer, PeerInfo};
use crate::types::{fmt_id, NodeId};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Mutex;
use tracing::warn;

#[derive(Default)]
struct Inner {
    by_id: HashMap<NodeId, Peer>,
    // SocketAddrV4 hashes ip + port only; there is no address family to ignore.
    by_addr: HashMap<SocketAddrV4, NodeId>,
}

#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Idempotent on id: a second claim of the same id
    /// collapses onto the existing entry (re-pointing its address if the
    /// peer moved). Returns true when a new entry was created.
    pub fn add(&self, id: NodeId, addr: SocketAddrV4) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(peer) = inner.by_id.get_mut(&id) {
            if peer.addr != addr {
                let old = peer.addr;
                peer.addr = addr;
                inner.by_addr.remove(&old);
                inner.by_addr.insert(addr, id);
            }
            return false;
        }

        // A different node id claiming a known address supersedes the old
        // record; the previous occupant is gone or restarted.
        if let Some(&stale) = inner.by_addr.get(&addr) {
            warn!(
                "Address {} re-claimed by {} (was {})",
                addr,
                fmt_id(id),
                fmt_id(stale)
            );
            inner.by_id.remove(&stale);
        }

        inner.by_id.insert(id, Peer::new(id, addr));
        inner.by_addr.insert(addr, id);
        true
    }

    pub fn remove(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.by_id.remove(&id) {
            inner.by_addr.remove(&peer.addr);
        }
    }

    /// Run `f` against the peer with this id, under the lock.
    pub fn with_peer<R>(&self, id: NodeId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.by_id.get_mut(&id).map(f)
    }

    /// Run `f` against the peer at this address, under the lock.
    pub fn with_peer_by_addr<R>(
        &self,
        addr: SocketAddrV4,
        f: impl FnOnce(&mut Peer) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        let id = *inner.by_addr.get(&addr)?;
        inner.by_id.get_mut(&id).map(f)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.lock().unwrap().by_id.contains_key(&id)
    }

    pub fn info(&self, id: NodeId) -> Option<PeerInfo> {
        self.inner.lock().unwrap().by_id.get(&id).map(PeerInfo::from)
    }

    pub fn info_by_addr(&self, addr: SocketAddrV4) -> Option<PeerInfo> {
        let inner = self.inner.lock().unwrap();
        let id = *inner.by_addr.get(&addr)?;
        inner.by_id.get(&id).map(PeerInfo::from)
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        self.inner
            .lock()
            .unwrap()
            .by_id
            .values()
            .map(PeerInfo::from)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every peer under the lock; peers for which `keep` returns false
    /// are removed. Used by the maintenance pass for eviction and handshake
    /// retry.
    pub fn sweep(&self, mut keep: impl FnMut(&mut Peer) -> bool) {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = Vec::new();
        inner.by_id.retain(|_, peer| {
            if keep(peer) {
                true
            } else {
                evicted.push(peer.addr);
                false
            }
        });
        for addr in evicted {
            inner.by_addr.remove(&addr);
        }
    }
}
