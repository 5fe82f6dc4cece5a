//! Adaptive Replacement Cache bookkeeping.
//!
//! Tracks residency lists only; the buffers live in the cache's entry map.
//! Victim selection skips keys the caller reports as not evictable
//! (checked out, journal-pinned), so the resident set may temporarily
//! exceed capacity when every candidate is in use.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
pub(crate) struct ArcState<K> {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<K>,
    t2: VecDeque<K>,
    b1: VecDeque<K>,
    b2: VecDeque<K>,
    loc: HashMap<K, ArcList>,
}

impl<K: Copy + Eq + Hash> ArcState<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
        }
    }

    pub(crate) fn resident_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn remove_from_list(list: &mut VecDeque<K>, key: &K) -> bool {
        if let Some(pos) = list.iter().position(|k| k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn take_first(list: &mut VecDeque<K>, evictable: &dyn Fn(&K) -> bool) -> Option<K> {
        let pos = list.iter().position(|k| evictable(k))?;
        list.remove(pos)
    }

    /// Promote a resident key on hit.
    pub(crate) fn on_hit(&mut self, key: K) {
        match self.loc.get(&key).copied() {
            Some(ArcList::T1) => {
                let _ = Self::remove_from_list(&mut self.t1, &key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T2) => {
                let _ = Self::remove_from_list(&mut self.t2, &key);
                self.t2.push_back(key);
            }
            Some(ArcList::B1 | ArcList::B2) | None => {}
        }
    }

    fn trim_ghosts(&mut self) {
        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    /// Move one evictable resident key to a ghost list.
    fn replace(&mut self, incoming: &K, evictable: &dyn Fn(&K) -> bool) -> Option<K> {
        let t1_len = self.t1.len();
        let prefer_t1 = t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(incoming), Some(ArcList::B2)) && t1_len == self.p));

        let victim = if prefer_t1 {
            Self::take_first(&mut self.t1, evictable)
                .map(|v| (v, ArcList::B1))
                .or_else(|| Self::take_first(&mut self.t2, evictable).map(|v| (v, ArcList::B2)))
        } else {
            Self::take_first(&mut self.t2, evictable)
                .map(|v| (v, ArcList::B2))
                .or_else(|| Self::take_first(&mut self.t1, evictable).map(|v| (v, ArcList::B1)))
        };

        let (victim, ghost) = victim?;
        self.loc.insert(victim, ghost);
        match ghost {
            ArcList::B1 => self.b1.push_back(victim),
            _ => self.b2.push_back(victim),
        }
        self.trim_ghosts();
        Some(victim)
    }

    /// Admit a key that is not resident. Returns the keys whose buffers
    /// must leave memory.
    pub(crate) fn admit(&mut self, key: K, evictable: &dyn Fn(&K) -> bool) -> Vec<K> {
        let mut evicted = Vec::new();
        let full = self.resident_len() >= self.capacity;

        match self.loc.get(&key).copied() {
            Some(ArcList::B1) => {
                let delta = (self.b2.len().max(1) / self.b1.len().max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                let _ = Self::remove_from_list(&mut self.b1, &key);
                if full {
                    evicted.extend(self.replace(&key, evictable));
                }
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::B2) => {
                let delta = (self.b1.len().max(1) / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                let _ = Self::remove_from_list(&mut self.b2, &key);
                if full {
                    evicted.extend(self.replace(&key, evictable));
                }
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T1 | ArcList::T2) => {
                self.on_hit(key);
            }
            None => {
                if self.t1.len() + self.b1.len() >= self.capacity {
                    if self.t1.len() < self.capacity {
                        let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                        if full {
                            evicted.extend(self.replace(&key, evictable));
                        }
                    } else if let Some(victim) = Self::take_first(&mut self.t1, evictable) {
                        let _ = self.loc.remove(&victim);
                        evicted.push(victim);
                    }
                } else {
                    let total = self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len();
                    if total >= self.capacity.saturating_mul(2) {
                        let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
                    }
                    if full {
                        evicted.extend(self.replace(&key, evictable));
                    }
                }
                self.t1.push_back(key);
                self.loc.insert(key, ArcList::T1);
            }
        }
        evicted
    }

    /// Drop a key from every list.
    pub(crate) fn forget(&mut self, key: &K) {
        if let Some(list) = self.loc.remove(key) {
            let queue = match list {
                ArcList::T1 => &mut self.t1,
                ArcList::T2 => &mut self.t2,
                ArcList::B1 => &mut self.b1,
                ArcList::B2 => &mut self.b2,
            };
            let _ = Self::remove_from_list(queue, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(_: &u32) -> bool {
        true
    }

    #[test]
    fn admits_without_eviction_until_full() {
        let mut arc = ArcState::new(3);
        for k in 0..3_u32 {
            assert!(arc.admit(k, &always).is_empty());
        }
        assert_eq!(arc.resident_len(), 3);
        let evicted = arc.admit(3, &always);
        assert_eq!(evicted, vec![0]);
        assert_eq!(arc.resident_len(), 3);
    }

    #[test]
    fn frequently_used_keys_survive_scans() {
        let mut arc = ArcState::new(2);
        let _ = arc.admit(1_u32, &always);
        arc.on_hit(1);
        for k in 10..20_u32 {
            let evicted = arc.admit(k, &always);
            assert!(!evicted.contains(&1), "hot key evicted by scan at {k}");
        }
    }

    #[test]
    fn unevictable_keys_are_skipped() {
        let mut arc = ArcState::new(2);
        let _ = arc.admit(1_u32, &always);
        let _ = arc.admit(2_u32, &always);
        let pinned = |k: &u32| *k != 1;
        let evicted = arc.admit(3, &pinned);
        assert_eq!(evicted, vec![2]);

        let nothing = |_: &u32| false;
        let evicted = arc.admit(4, &nothing);
        assert!(evicted.is_empty());
        assert_eq!(arc.resident_len(), 3, "grows past capacity when all pinned");
    }

    #[test]
    fn ghost_hit_adapts_target_and_evicts_frequent_side() {
        let mut arc = ArcState::new(2);
        let _ = arc.admit(1_u32, &always);
        arc.on_hit(1);
        let _ = arc.admit(2_u32, &always);
        assert_eq!(arc.admit(3_u32, &always), vec![2]);
        // 2 sits in B1; readmitting it raises p and takes the victim from T2
        assert_eq!(arc.admit(2_u32, &always), vec![1]);
        assert_eq!(arc.resident_len(), 2);
        arc.forget(&2);
        assert_eq!(arc.resident_len(), 1);
    }
}
