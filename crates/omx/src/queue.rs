//! Intrusive doubly-linked request queues over the request arena.
//!
//! A queue does not own its members; it threads one of the four link
//! nodes every request carries (see [`LinkKind`]). Pushing requires the
//! chosen link to be free, so accidental double-queueing through the
//! same link trips an assertion instead of corrupting a list.

use crate::request::{LinkKind, RequestArena, RequestId};

pub(crate) struct RequestQueue {
    kind: LinkKind,
    head: Option<RequestId>,
    tail: Option<RequestId>,
    len: usize,
}

impl RequestQueue {
    pub fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<RequestId> {
        self.head
    }

    /// The member after `id`, for cursor-style traversal that stays
    /// valid when the current member is unlinked.
    pub fn next_of(&self, arena: &RequestArena, id: RequestId) -> Option<RequestId> {
        arena.req(id).link(self.kind).next
    }

    pub fn push_back(&mut self, arena: &mut RequestArena, id: RequestId) {
        let kind = self.kind;
        {
            let link = arena.req_mut(id).link_mut(kind);
            debug_assert!(!link.queued, "request already on a {kind:?} queue");
            link.queued = true;
            link.prev = self.tail;
            link.next = None;
        }
        match self.tail {
            Some(tail) => arena.req_mut(tail).link_mut(kind).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn push_front(&mut self, arena: &mut RequestArena, id: RequestId) {
        let kind = self.kind;
        {
            let link = arena.req_mut(id).link_mut(kind);
            debug_assert!(!link.queued, "request already on a {kind:?} queue");
            link.queued = true;
            link.prev = None;
            link.next = self.head;
        }
        match self.head {
            Some(head) => arena.req_mut(head).link_mut(kind).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    pub fn remove(&mut self, arena: &mut RequestArena, id: RequestId) {
        let kind = self.kind;
        let link = {
            let link = arena.req_mut(id).link_mut(kind);
            debug_assert!(link.queued, "request not on a {kind:?} queue");
            let copy = *link;
            link.queued = false;
            link.prev = None;
            link.next = None;
            copy
        };
        match link.prev {
            Some(prev) => arena.req_mut(prev).link_mut(kind).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => arena.req_mut(next).link_mut(kind).prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
    }

    pub fn pop_front(&mut self, arena: &mut RequestArena) -> Option<RequestId> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Snapshot of the member ids, for walks that unlink or complete
    /// members along the way.
    pub fn ids(&self, arena: &RequestArena) -> Vec<RequestId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = arena.req(id).link(self.kind).next;
        }
        out
    }

    /// Moves every member of `other` to the back of `self`, preserving
    /// order. Both queues must thread the same link.
    pub fn append(&mut self, arena: &mut RequestArena, other: &mut RequestQueue) {
        debug_assert!(self.kind == other.kind);
        while let Some(id) = other.pop_front(arena) {
            self.push_back(arena, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::request::{MediumRecv, RecvData, RecvKind, Request, RequestData, RequestType};
    use crate::segment::SegmentList;
    use omx_wire::Seq;

    use super::*;

    fn arena_with(n: usize) -> (RequestArena, Vec<RequestId>) {
        let mut arena = RequestArena::new();
        let ids = (0..n)
            .map(|_| {
                arena.alloc(Request::new(
                    RequestType::Recv,
                    RequestData::Recv(RecvData {
                        segs: SegmentList::default(),
                        match_info: 0,
                        match_mask: 0,
                        seqnum: Seq(0),
                        unexp_buffer: None,
                        kind: RecvKind::Basic(MediumRecv::default()),
                    }),
                ))
            })
            .collect();
        (arena, ids)
    }

    #[test]
    fn fifo_order() {
        let (mut arena, ids) = arena_with(3);
        let mut q = RequestQueue::new(LinkKind::Work);
        for &id in &ids {
            q.push_back(&mut arena, id);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front(&mut arena), Some(ids[0]));
        assert_eq!(q.pop_front(&mut arena), Some(ids[1]));
        assert_eq!(q.pop_front(&mut arena), Some(ids[2]));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_from_middle() {
        let (mut arena, ids) = arena_with(3);
        let mut q = RequestQueue::new(LinkKind::Work);
        for &id in &ids {
            q.push_back(&mut arena, id);
        }
        q.remove(&mut arena, ids[1]);
        assert_eq!(q.ids(&arena), vec![ids[0], ids[2]]);
    }

    #[test]
    fn one_request_on_two_queues() {
        let (mut arena, ids) = arena_with(1);
        let mut work = RequestQueue::new(LinkKind::Work);
        let mut partner = RequestQueue::new(LinkKind::Partner);
        work.push_back(&mut arena, ids[0]);
        partner.push_back(&mut arena, ids[0]);
        partner.remove(&mut arena, ids[0]);
        assert_eq!(work.ids(&arena), vec![ids[0]]);
        assert!(partner.is_empty());
    }

    #[test]
    fn push_front_preserves_fifo_of_rest() {
        let (mut arena, ids) = arena_with(3);
        let mut q = RequestQueue::new(LinkKind::Work);
        q.push_back(&mut arena, ids[0]);
        q.push_back(&mut arena, ids[1]);
        q.push_front(&mut arena, ids[2]);
        assert_eq!(q.ids(&arena), vec![ids[2], ids[0], ids[1]]);
    }
}
