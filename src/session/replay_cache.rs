use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReplayCacheEntry {
    pub request_id: u16,
    pub opcode: u8,
    pub result_code: u32,
}

/// The [ReplayCache] remembers the result codes of recently executed commands, so that a
///  retransmitted request is answered without executing the command a second time.
///
/// It has a fixed number of slots, and a request occupies slot `request_id mod N`. A new entry
///  silently replaces whatever was in its slot, so there is at most one entry per slot rather than
///  one per request id: a request is only recognized as a retransmission while fewer than `N`
///  other requests have been processed since.
///
/// The cache is keyed by request id alone, which is only sound because every session has its
///  own cache.
pub struct ReplayCache {
    slots: Vec<Option<ReplayCacheEntry>>,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> ReplayCache {
        assert!(capacity > 0, "replay cache capacity must be positive");
        ReplayCache {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, request_id: u16) -> usize {
        request_id as usize % self.slots.len()
    }

    /// A hit requires both request id and opcode to match: a different command that happens to
    ///  reuse the id is a fresh request.
    pub fn lookup(&self, request_id: u16, opcode: u8) -> Option<u32> {
        match &self.slots[self.slot(request_id)] {
            Some(entry) if entry.request_id == request_id && entry.opcode == opcode => Some(entry.result_code),
            _ => None,
        }
    }

    pub fn store(&mut self, request_id: u16, opcode: u8, result_code: u32) {
        let slot = self.slot(request_id);
        if let Some(prev) = &self.slots[slot] {
            trace!("replay cache slot {} overwritten: {:?}", slot, prev);
        }
        self.slots[slot] = Some(ReplayCacheEntry {
            request_id,
            opcode,
            result_code,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_empty() {
        let cache = ReplayCache::new(8);
        assert_eq!(cache.capacity(), 8);
        for id in 0..8 {
            assert_eq!(cache.lookup(id, 0), None);
        }
    }

    #[test]
    fn test_hit() {
        let mut cache = ReplayCache::new(8);
        cache.store(5, 20, 99);
        assert_eq!(cache.lookup(5, 20), Some(99));
        assert_eq!(cache.lookup(5, 20), Some(99));
    }

    #[test]
    fn test_same_id_different_opcode_misses() {
        let mut cache = ReplayCache::new(8);
        cache.store(5, 20, 99);
        assert_eq!(cache.lookup(5, 21), None);

        cache.store(5, 21, 7);
        assert_eq!(cache.lookup(5, 20), None);
        assert_eq!(cache.lookup(5, 21), Some(7));
    }

    #[rstest]
    #[case::next_window(5, 13)]
    #[case::far(5, 5 + 8 * 100)]
    #[case::wrap_around(u16::MAX, 7)]
    fn test_slot_collision_overwrites(#[case] first: u16, #[case] second: u16) {
        let mut cache = ReplayCache::new(8);
        cache.store(first, 20, 1);
        cache.store(second, 20, 2);

        assert_eq!(cache.lookup(first, 20), None);
        assert_eq!(cache.lookup(second, 20), Some(2));
    }

    #[test]
    fn test_window_of_capacity() {
        let mut cache = ReplayCache::new(8);
        for id in 100..108 {
            cache.store(id, 1, id as u32);
        }
        for id in 100..108 {
            assert_eq!(cache.lookup(id, 1), Some(id as u32));
        }

        cache.store(108, 1, 0);
        assert_eq!(cache.lookup(100, 1), None);
        assert_eq!(cache.lookup(101, 1), Some(101));
    }
}
