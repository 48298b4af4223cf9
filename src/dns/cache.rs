use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::http::parser::MAX_HOST_LEN;
use crate::pool::Pool;

/// One cached resolution. Nodes live in the worker's fixed pool; `prev`/
/// `next` thread them into the recency list, most recent first.
struct Node {
    host: Box<str>,
    ip: Ipv4Addr,
    created: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded LRU map from host name to resolved IPv4, with lazy TTL eviction.
///
/// A capacity of 0 disables the cache entirely: every lookup misses and
/// inserts are dropped. Per-worker, no cross-thread coordination.
pub struct NameCache {
    nodes: Pool<Node>,
    map: HashMap<Box<str>, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    lifetime: Duration,
}

impl NameCache {
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        Self {
            nodes: Pool::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            lifetime,
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Free node slots; grows by one whenever a lookup evicts an expired
    /// entry.
    pub fn free_count(&self) -> usize {
        self.nodes.free_count()
    }

    /// Look a name up. A hit moves the entry to the front of the recency
    /// list; a hit older than the configured lifetime evicts the entry and
    /// reports a miss.
    pub fn lookup(&mut self, host: &str) -> Option<Ipv4Addr> {
        let idx = *self.map.get(host)?;
        let (ip, expired) = {
            let node = self.nodes.get(idx)?;
            (node.ip, node.created.elapsed() >= self.lifetime)
        };
        if expired {
            debug!(host, "name cache entry expired");
            self.unlink(idx);
            self.map.remove(host);
            self.nodes.release(idx);
            return None;
        }
        self.move_to_front(idx);
        Some(ip)
    }

    /// Insert at the front of the recency list, evicting the tail entry
    /// when the pool is full. Re-inserting an existing name refreshes it.
    pub fn insert(&mut self, host: &str, ip: Ipv4Addr) {
        if self.nodes.capacity() == 0 || host.len() > MAX_HOST_LEN {
            return;
        }

        if let Some(&idx) = self.map.get(host) {
            if let Some(node) = self.nodes.get_mut(idx) {
                node.ip = ip;
                node.created = Instant::now();
            }
            self.move_to_front(idx);
            return;
        }

        if self.nodes.is_exhausted() {
            if let Some(tail) = self.tail {
                self.unlink(tail);
                let evicted = self.nodes.release(tail);
                self.map.remove(&evicted.host);
                debug!(host = &*evicted.host, "name cache evicted tail entry");
            }
        }

        let node = Node {
            host: host.into(),
            ip,
            created: Instant::now(),
            prev: None,
            next: None,
        };
        if let Ok(idx) = self.nodes.alloc(node) {
            self.map.insert(host.into(), idx);
            self.link_front(idx);
        }
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes.get_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => {
                if let Some(node) = self.nodes.get_mut(head) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes.get(idx) {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(prev) => {
                if let Some(node) = self.nodes.get_mut(prev) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(node) = self.nodes.get_mut(next) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }
}
