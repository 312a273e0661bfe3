//! Per-connection cache of server-side prepared statements.
//!
//! Entries live in an arena keyed by a connection-local handle; a second map
//! points each SQL text at its cached entry. The server id of an entry can
//! change when the session is re-established, the handle never does.
//! Reference counts track the handles given out by `acquire`/`insert` and
//! returned by `release`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::statement::PreparedStatement;

#[derive(Debug)]
struct Entry {
    statement: PreparedStatement,
    ref_count: usize,
    last_used: u64,
    /// Not reachable through the SQL map; closed on its final release
    detached: bool,
}

/// LRU statement cache with reference counting.
#[derive(Debug)]
pub struct PrepareCache {
    enabled: bool,
    capacity: usize,
    entries: HashMap<u32, Entry>,
    by_sql: HashMap<Arc<str>, u32>,
    next_handle: u32,
    tick: u64,
}

impl PrepareCache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            enabled: enabled && capacity > 0,
            capacity,
            entries: HashMap::new(),
            by_sql: HashMap::new(),
            next_handle: 1,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Cached statement for `sql`, with its reference count incremented.
    pub fn acquire(&mut self, sql: &str) -> Option<PreparedStatement> {
        let handle = *self.by_sql.get(sql)?;
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&handle)?;
        entry.ref_count += 1;
        entry.last_used = tick;
        Some(entry.statement.clone())
    }

    /// Register a freshly prepared statement holding one reference.
    ///
    /// Returns the statement with its handle assigned, and the server ids of
    /// statements evicted by this insertion, which the caller must close.
    pub fn insert(&mut self, mut statement: PreparedStatement) -> (PreparedStatement, Vec<u32>) {
        let tick = self.next_tick();
        statement.handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);

        let cacheable = self.enabled && !self.by_sql.contains_key(&statement.sql);
        if cacheable {
            self.by_sql
                .insert(Arc::clone(&statement.sql), statement.handle);
        }
        self.entries.insert(
            statement.handle,
            Entry {
                statement: statement.clone(),
                ref_count: 1,
                last_used: tick,
                detached: !cacheable,
            },
        );
        let evicted = if cacheable {
            self.evict_over_capacity()
        } else {
            Vec::new()
        };
        (statement, evicted)
    }

    fn evict_over_capacity(&mut self) -> Vec<u32> {
        let mut to_close = Vec::new();
        while self.by_sql.len() > self.capacity {
            let Some(victim) = self.lru_victim() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&victim) else {
                break;
            };
            self.by_sql.remove(&entry.statement.sql);
            if entry.ref_count == 0 {
                debug!(statement_id = entry.statement.id, "evicting prepared statement");
                to_close.push(entry.statement.id);
                self.entries.remove(&victim);
            } else {
                // still in use: close on its final release
                entry.detached = true;
            }
        }
        to_close
    }

    /// Least recently used cached entry, preferring unreferenced ones.
    fn lru_victim(&self) -> Option<u32> {
        let cached = || {
            self.by_sql
                .values()
                .filter_map(|handle| self.entries.get(handle).map(|entry| (*handle, entry)))
        };
        cached()
            .filter(|(_, entry)| entry.ref_count == 0)
            .min_by_key(|(_, entry)| entry.last_used)
            .or_else(|| cached().min_by_key(|(_, entry)| entry.last_used))
            .map(|(handle, _)| handle)
    }

    /// Drop one reference. Returns the server id to close when the statement
    /// is no longer needed.
    pub fn release(&mut self, handle: u32) -> Option<u32> {
        let entry = self.entries.get_mut(&handle)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 && entry.detached {
            let id = entry.statement.id;
            self.entries.remove(&handle);
            return Some(id);
        }
        None
    }

    /// Current server id of the statement behind `handle`.
    pub fn server_id(&self, handle: u32) -> Option<u32> {
        self.entries.get(&handle).map(|entry| entry.statement.id)
    }

    /// The statement was prepared again on a new session under `server_id`.
    pub fn rebind(&mut self, handle: u32, server_id: u32) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.statement.id = server_id;
        }
    }

    /// Drop entries nobody holds. Used when the session they were prepared
    /// on is gone, so there is nothing to close.
    pub fn forget_unreferenced(&mut self) {
        self.entries.retain(|_, entry| entry.ref_count > 0);
        let entries = &self.entries;
        self.by_sql.retain(|_, handle| entries.contains_key(handle));
    }

    /// Statements with at least one outstanding reference.
    pub fn referenced(&self) -> Vec<PreparedStatement> {
        self.entries
            .values()
            .filter(|entry| entry.ref_count > 0)
            .map(|entry| entry.statement.clone())
            .collect()
    }

    /// Forget every statement. Returns their server ids.
    pub fn clear(&mut self) -> Vec<u32> {
        self.by_sql.clear();
        self.entries
            .drain()
            .map(|(_, entry)| entry.statement.id)
            .collect()
    }

    /// Number of cached SQL texts.
    pub fn cached(&self) -> usize {
        self.by_sql.len()
    }

    #[cfg(test)]
    fn ref_count(&self, handle: u32) -> Option<usize> {
        self.entries.get(&handle).map(|entry| entry.ref_count)
    }
}
