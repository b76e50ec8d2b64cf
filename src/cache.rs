use std::collections::HashMap;

use crate::loader::CacheEntry;

/// Bookkeeping for a load whose entry is currently owned by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub is_prefetch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub loaded: usize,
    pub loading: usize,
    pub bytes_in_use: u64,
    pub budget: u64,
}

/// Decoded images keyed by canonical path, bounded by a byte budget.
///
/// Eviction is by distance from the cursor in the folder listing rather than
/// by recency: contents cluster around the image being viewed.
pub struct Cache {
    budget: u64,
    loading: HashMap<String, LoadTicket>,
    loaded: HashMap<String, CacheEntry>,
    bytes_in_use: u64,
}

impl Cache {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            loading: HashMap::new(),
            loaded: HashMap::new(),
            bytes_in_use: 0,
        }
    }

    #[cfg(test)]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    #[cfg(test)]
    pub fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            loaded: self.loaded.len(),
            loading: self.loading.len(),
            bytes_in_use: self.bytes_in_use,
            budget: self.budget,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<&CacheEntry> {
        self.loaded.get(key)
    }

    pub fn lookup_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.loaded.get_mut(key)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.loading.contains_key(key)
    }

    pub fn ticket(&self, key: &str) -> Option<&LoadTicket> {
        self.loading.get(key)
    }

    pub fn ticket_mut(&mut self, key: &str) -> Option<&mut LoadTicket> {
        self.loading.get_mut(key)
    }

    #[cfg(test)]
    pub fn loaded_keys(&self) -> Vec<String> {
        self.loaded.keys().cloned().collect()
    }

    /// Record that a load for `key` has been handed to a worker. Refused when
    /// the path is already loaded or loading.
    pub fn begin_load(&mut self, key: &str, ticket: LoadTicket) -> bool {
        if self.loaded.contains_key(key) || self.loading.contains_key(key) {
            return false;
        }
        self.loading.insert(key.to_owned(), ticket);
        true
    }

    /// Drop the in-flight record for a load that will not be committed.
    pub fn abandon_load(&mut self, key: &str) -> Option<LoadTicket> {
        self.loading.remove(key)
    }

    /// Move an entry into `loaded`. Committing the same path again replaces
    /// the previous entry instead of counting it twice.
    pub fn commit_load(&mut self, entry: CacheEntry) {
        let key = entry.key().to_owned();
        self.loading.remove(&key);
        if let Some(old) = self.loaded.remove(&key) {
            self.bytes_in_use -= old.mem_size();
        }
        self.bytes_in_use += entry.mem_size();
        self.loaded.insert(key, entry);
        debug_assert_eq!(self.bytes_in_use, self.recount());
    }

    pub fn evict(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.loaded.remove(key)?;
        self.bytes_in_use -= entry.mem_size();
        Some(entry)
    }

    /// Decide whether a speculative load of `candidate_size` bytes may start,
    /// evicting entries far from `cursor` to make room.
    ///
    /// Victims are loaded entries with a known folder index other than the one
    /// at the cursor, farthest first. Admits only if the candidate then fits.
    pub fn admit_for_prefetch(&mut self, candidate_size: u64, cursor: Option<usize>) -> bool {
        if self.budget == 0 {
            return false;
        }
        while self.bytes_in_use.saturating_add(candidate_size) > self.budget {
            let Some(cursor) = cursor else { break };
            let Some(victim) = self.farthest_from(cursor) else {
                break;
            };
            if let Some(entry) = self.evict(&victim) {
                log::debug!(
                    "[cache] evict {} (index {:?}, cursor {}, {} bytes)",
                    entry.path,
                    entry.folder_index,
                    cursor,
                    entry.mem_size()
                );
            }
        }
        self.bytes_in_use.saturating_add(candidate_size) <= self.budget
    }

    fn farthest_from(&self, cursor: usize) -> Option<String> {
        let mut best: Option<(&String, usize)> = None;
        for (key, entry) in &self.loaded {
            let Some(idx) = entry.folder_index else { continue };
            let dist = idx.abs_diff(cursor);
            if dist == 0 {
                continue;
            }
            // Ties go to the smaller key so the choice does not depend on map order.
            let better = match best {
                None => true,
                Some((bk, bd)) => dist > bd || (dist == bd && key < bk),
            };
            if better {
                best = Some((key, dist));
            }
        }
        best.map(|(k, _)| k.clone())
    }

    /// Re-derive every entry's folder index, e.g. after a rescan.
    pub fn reindex(&mut self, mut index_of: impl FnMut(&CacheEntry) -> Option<usize>) {
        for entry in self.loaded.values_mut() {
            entry.folder_index = index_of(entry);
        }
    }

    /// Evict every loaded entry for which `keep` is false.
    pub fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) -> usize {
        let doomed: Vec<String> = self
            .loaded
            .iter()
            .filter(|(_, e)| !keep(e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.evict(key);
        }
        doomed.len()
    }

    fn recount(&self) -> u64 {
        self.loaded.values().map(|e| e.mem_size()).sum()
    }
}
