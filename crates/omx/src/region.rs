//! Registered-region slot pool and reuse cache bookkeeping.
//!
//! Region ids are 8-bit slot indices into a fixed pool. A contiguous
//! (single-segment) region whose use count drops to zero is not
//! deregistered but parked on an LRU list, so a later large transfer of
//! the same buffer reuses the existing registration. Vectorial regions
//! are never cached. The driver calls around these data operations live
//! in the large-message module.

use std::collections::VecDeque;

use omx_driver::abi::USER_REGION_MAX;

use crate::{request::RequestId, segment::SegmentList};

pub(crate) struct Region {
    pub id: u8,
    pub use_count: u32,
    /// Bumped every time a rendezvous hands this region to a peer, so a
    /// stale notify cannot release a reused slot.
    pub last_seqnum: u8,
    pub segs: SegmentList,
    /// Exclusive holder for the rendezvous/notify exchange; concurrent
    /// pulls of the same region are fine as long as they do not reserve.
    pub reserver: Option<RequestId>,
}

pub(crate) struct RegionMap {
    slots: Vec<Option<Region>>,
    free: Vec<u8>,
    /// Per-slot rendezvous counter, persisting across slot reuse.
    last_seqnums: [u8; USER_REGION_MAX],
    /// Registered contiguous regions, searchable by the cache.
    contiguous: Vec<u8>,
    /// Registered vectorial regions, tracked only for teardown.
    vectorial: Vec<u8>,
    /// Contiguous regions with `use_count == 0`, oldest in front.
    unused_lru: VecDeque<u8>,
}

impl RegionMap {
    pub fn new() -> Self {
        Self {
            slots: (0..USER_REGION_MAX).map(|_| None).collect(),
            // pop from the back, so low ids go out first
            free: (0..USER_REGION_MAX as u8).rev().collect(),
            last_seqnums: [23; USER_REGION_MAX],
            contiguous: Vec::new(),
            vectorial: Vec::new(),
            unused_lru: VecDeque::new(),
        }
    }

    /// Takes a free slot id, or `None` when the pool is exhausted.
    pub fn try_alloc(&mut self) -> Option<u8> {
        self.free.pop()
    }

    pub fn release_slot(&mut self, id: u8) {
        debug_assert!(self.slots[id as usize].is_none());
        self.free.push(id);
    }

    /// Installs a freshly registered region into its slot and onto the
    /// matching live list.
    pub fn install(&mut self, segs: SegmentList, id: u8, reserver: Option<RequestId>) {
        let contiguous = segs.is_contiguous();
        self.slots[id as usize] = Some(Region {
            id,
            use_count: 1,
            last_seqnum: self.last_seqnums[id as usize],
            segs,
            reserver,
        });
        if contiguous {
            self.contiguous.push(id);
        } else {
            self.vectorial.push(id);
        }
    }

    /// Unlinks a region from every list and empties its slot. The
    /// caller deregisters it with the driver and releases the slot.
    pub fn extract(&mut self, id: u8) -> Region {
        let region = self.slots[id as usize].take().expect("live region id");
        self.last_seqnums[id as usize] = region.last_seqnum;
        self.contiguous.retain(|&r| r != id);
        self.vectorial.retain(|&r| r != id);
        self.unused_lru.retain(|&r| r != id);
        region
    }

    pub fn get(&self, id: u8) -> Option<&Region> {
        self.slots[id as usize].as_ref()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Region> {
        self.slots[id as usize].as_mut()
    }

    /// Searches the registered contiguous regions for one covering
    /// `(vaddr, len)` that the caller may take: its reserver slot must
    /// be free if the caller wants to reserve, and unless
    /// `parallel` is set it must be idle.
    pub fn find_cached(
        &mut self,
        vaddr: u64,
        len: u32,
        want_reserver: bool,
        parallel: bool,
    ) -> Option<u8> {
        let id = *self.contiguous.iter().find(|&&id| {
            let region = self.slots[id as usize].as_ref().expect("listed region");
            (!want_reserver || region.reserver.is_none())
                && (parallel || region.use_count == 0)
                && region.segs.first().vaddr == vaddr
                && region.segs.first().len >= len
        })?;
        let region = self.slots[id as usize].as_mut().expect("listed region");
        region.use_count += 1;
        if region.use_count == 1 {
            self.unused_lru.retain(|&r| r != id);
        }
        Some(id)
    }

    /// Parks an idle contiguous region at the back of the LRU.
    pub fn park_unused(&mut self, id: u8) {
        debug_assert!(!self.unused_lru.contains(&id));
        self.unused_lru.push_back(id);
    }

    /// Takes the least recently parked idle region, to evict when the
    /// pool runs dry.
    pub fn evict_candidate(&mut self) -> Option<u8> {
        self.unused_lru.pop_front()
    }

    /// Ids of every live region, for endpoint teardown.
    pub fn live_ids(&self) -> Vec<u8> {
        self.contiguous.iter().chain(&self.vectorial).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seglist(vaddr: u64, len: u32) -> SegmentList {
        SegmentList::single(vaddr, len)
    }

    #[test]
    fn alloc_install_extract_cycle() {
        let mut map = RegionMap::new();
        let id = map.try_alloc().unwrap();
        assert_eq!(id, 0);
        map.install(seglist(0x1000, 64), id, None);
        assert_eq!(map.get(id).unwrap().use_count, 1);

        let region = map.extract(id);
        assert_eq!(region.id, id);
        map.release_slot(id);
        assert_eq!(map.try_alloc(), Some(id));
    }

    #[test]
    fn cache_reuses_covering_region() {
        let mut map = RegionMap::new();
        let id = map.try_alloc().unwrap();
        map.install(seglist(0x1000, 128), id, None);
        map.get_mut(id).unwrap().use_count = 0;
        map.park_unused(id);

        // shorter request over the same buffer hits the cache
        assert_eq!(map.find_cached(0x1000, 64, true, false), Some(id));
        assert_eq!(map.get(id).unwrap().use_count, 1);
        // and it was removed from the LRU
        assert!(map.evict_candidate().is_none());
    }

    #[test]
    fn cache_respects_reserver_exclusivity() {
        let mut map = RegionMap::new();
        let id = map.try_alloc().unwrap();
        map.install(seglist(0x1000, 128), id, None);
        let mut arena = crate::request::RequestArena::new();
        let holder = arena.alloc(crate::request::Request::new(
            crate::request::RequestType::SendLarge,
            crate::request::RequestData::Send(crate::request::SendData {
                segs: SegmentList::default(),
                kind: crate::request::SendKind::SelfSend,
            }),
        ));
        map.get_mut(id).unwrap().reserver = Some(holder);

        // a reserving caller must not steal it, a non-reserving pull may
        // share it when parallel use is allowed
        assert_eq!(map.find_cached(0x1000, 64, true, true), None);
        assert_eq!(map.find_cached(0x1000, 64, false, true), Some(id));
    }

    #[test]
    fn last_seqnum_survives_slot_reuse() {
        let mut map = RegionMap::new();
        let id = map.try_alloc().unwrap();
        map.install(seglist(0x1000, 64), id, None);
        map.get_mut(id).unwrap().last_seqnum = 99;
        map.extract(id);
        map.release_slot(id);

        let id2 = map.try_alloc().unwrap();
        assert_eq!(id2, id);
        map.install(seglist(0x2000, 64), id2, None);
        assert_eq!(map.get(id2).unwrap().last_seqnum, 99);
    }
}
