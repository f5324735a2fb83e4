//! Multi-segment buffer descriptors and gather/scatter copies.
//!
//! A request references the application's memory as a list of raw
//! `(vaddr, len)` segments, the exact shape the driver ABI consumes for
//! region registration and vectorial sends. The descriptors do not
//! borrow: the application guarantees the memory stays valid until the
//! request completes, which is why the submission entry points of
//! [`Endpoint`](crate::Endpoint) are `unsafe`.
//!
//! Single-segment lists are the overwhelmingly common case and avoid
//! the boxed array.

use omx_driver::abi::{RegionSegment, MAX_SEGMENTS};

use crate::error::Error;

/// One contiguous piece of application memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Virtual address of the first byte.
    pub vaddr: u64,
    /// Length in bytes.
    pub len: u32,
}

impl Segment {
    fn as_slice<'a>(self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.vaddr as usize as *const u8, self.len as usize) }
    }

    fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe {
            std::slice::from_raw_parts_mut(self.vaddr as usize as *mut u8, self.len as usize)
        }
    }
}

/// An ordered list of segments with its total length cached.
#[derive(Debug, Clone)]
pub struct SegmentList {
    segs: SegStore,
    total_length: u32,
}

#[derive(Debug, Clone)]
enum SegStore {
    Single(Segment),
    Multi(Box<[Segment]>),
}

impl Default for SegmentList {
    fn default() -> Self {
        Self::single(0, 0)
    }
}

impl SegmentList {
    /// A single contiguous buffer. A zero-length list uses a null
    /// segment so callers never special-case emptiness.
    #[must_use]
    pub fn single(vaddr: u64, len: u32) -> Self {
        Self {
            segs: SegStore::Single(Segment { vaddr, len }),
            total_length: len,
        }
    }

    /// Wraps a borrowed buffer; the caller keeps it alive for as long as
    /// the list is used.
    #[must_use]
    pub fn from_slice(buf: &[u8]) -> Self {
        Self::single(buf.as_ptr() as u64, buf.len() as u32)
    }

    /// Wraps a borrowed mutable buffer.
    #[must_use]
    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self::single(buf.as_mut_ptr() as u64, buf.len() as u32)
    }

    /// Builds a list from raw segments, collapsing the 0- and 1-segment
    /// cases into the single form.
    pub fn from_segments(segs: &[Segment]) -> Result<Self, Error> {
        match segs {
            [] => Ok(Self::single(0, 0)),
            [seg] => Ok(Self::single(seg.vaddr, seg.len)),
            many if many.len() > MAX_SEGMENTS => Err(Error::SegmentsBadCount),
            many => Ok(Self {
                total_length: many.iter().map(|s| s.len).sum(),
                segs: SegStore::Multi(many.to_vec().into_boxed_slice()),
            }),
        }
    }

    /// Total bytes across all segments.
    #[must_use]
    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    /// Number of segments.
    #[must_use]
    pub fn nseg(&self) -> u32 {
        match &self.segs {
            SegStore::Single(_) => 1,
            SegStore::Multi(segs) => segs.len() as u32,
        }
    }

    /// Whether the list is one contiguous buffer.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        matches!(self.segs, SegStore::Single(_))
    }

    fn segs(&self) -> &[Segment] {
        match &self.segs {
            SegStore::Single(seg) => std::slice::from_ref(seg),
            SegStore::Multi(segs) => segs,
        }
    }

    /// First segment of the list.
    #[must_use]
    pub fn first(&self) -> Segment {
        self.segs()[0]
    }

    /// The ABI form handed to region registration and vectorial sends.
    #[must_use]
    pub fn to_driver_segments(&self) -> Box<[RegionSegment]> {
        self.segs()
            .iter()
            .map(|s| RegionSegment {
                vaddr: s.vaddr,
                len: s.len,
                pad: 0,
            })
            .collect()
    }

    /// Gathers the first `len` bytes of the list into `dst`.
    pub fn copy_into(&self, dst: &mut [u8], len: u32) {
        debug_assert!(len <= self.total_length);
        let mut remaining = len as usize;
        let mut out = 0;
        for seg in self.segs() {
            if remaining == 0 {
                break;
            }
            let chunk = (seg.len as usize).min(remaining);
            dst[out..out + chunk].copy_from_slice(&seg.as_slice()[..chunk]);
            out += chunk;
            remaining -= chunk;
        }
    }

    /// Scatters the first `len` bytes of `src` across the list.
    pub fn copy_from(&self, src: &[u8], len: u32) {
        debug_assert!(len <= self.total_length);
        let mut remaining = len as usize;
        let mut taken = 0;
        for seg in self.segs() {
            if remaining == 0 {
                break;
            }
            let chunk = (seg.len as usize).min(remaining);
            seg.as_mut_slice()[..chunk].copy_from_slice(&src[taken..taken + chunk]);
            taken += chunk;
            remaining -= chunk;
        }
    }

    /// Copies `len` bytes from `src` segments into `dst` segments.
    pub fn copy_between(dst: &SegmentList, src: &SegmentList, len: u32) {
        debug_assert!(len <= src.total_length);
        debug_assert!(len <= dst.total_length);

        let mut remaining = len as usize;
        let src_segs = src.segs();
        let dst_segs = dst.segs();
        let (mut si, mut soff) = (0usize, 0usize);
        let (mut di, mut doff) = (0usize, 0usize);

        while remaining > 0 {
            let s = &src_segs[si];
            let d = &dst_segs[di];
            let chunk = remaining
                .min(s.len as usize - soff)
                .min(d.len as usize - doff);
            d.as_mut_slice()[doff..doff + chunk]
                .copy_from_slice(&s.as_slice()[soff..soff + chunk]);
            remaining -= chunk;

            soff += chunk;
            if soff >= s.len as usize {
                si += 1;
                soff = 0;
            }
            doff += chunk;
            if doff >= d.len as usize {
                di += 1;
                doff = 0;
            }
        }
    }
}

/// Resumable position inside a [`SegmentList`], used by multi-fragment
/// reassembly to avoid rescanning the segment array for every fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegScan {
    seg: u32,
    offset: u32,
    /// Absolute message offset the cursor currently points at; a
    /// fragment whose offset does not continue from here forces a
    /// re-seek from segment zero.
    scan_offset: u32,
}

impl SegScan {
    /// Scatters `src` into `dst` at absolute message offset `offset`.
    ///
    /// Fragments normally arrive back to back, in which case the cursor
    /// resumes where the previous copy stopped; an out-of-order arrival
    /// re-seeks from the start of the list.
    pub fn copy_at(&mut self, dst: &SegmentList, src: &[u8], offset: u32) {
        if offset != self.scan_offset {
            let segs = dst.segs();
            let mut seg = 0usize;
            let mut seg_start = 0u32;
            while offset > seg_start + segs[seg].len {
                seg_start += segs[seg].len;
                seg += 1;
            }
            self.seg = seg as u32;
            self.offset = offset - seg_start;
        }

        let segs = dst.segs();
        let mut seg = self.seg as usize;
        let mut seg_off = self.offset as usize;
        let mut taken = 0usize;

        loop {
            let cur = &segs[seg];
            let room = cur.len as usize - seg_off;
            let chunk = room.min(src.len() - taken);
            cur.as_mut_slice()[seg_off..seg_off + chunk]
                .copy_from_slice(&src[taken..taken + chunk]);
            taken += chunk;
            if chunk != room {
                seg_off += chunk;
                break;
            }
            seg += 1;
            seg_off = 0;
            if taken == src.len() {
                break;
            }
        }

        self.seg = seg as u32;
        self.offset = seg_off as u32;
        self.scan_offset = offset + src.len() as u32;
    }
}

/// Sequential gather cursor over a [`SegmentList`], used when staging
/// medium fragments: fragments are produced front to back, so the
/// cursor only ever advances.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegGather {
    seg: u32,
    offset: u32,
}

impl SegGather {
    /// Fills `dst` with the next `dst.len()` bytes of `src`.
    pub fn read_into(&mut self, src: &SegmentList, dst: &mut [u8]) {
        let segs = src.segs();
        let mut seg = self.seg as usize;
        let mut seg_off = self.offset as usize;
        let mut filled = 0usize;

        while filled < dst.len() {
            let cur = &segs[seg];
            let avail = cur.len as usize - seg_off;
            let chunk = avail.min(dst.len() - filled);
            dst[filled..filled + chunk]
                .copy_from_slice(&cur.as_slice()[seg_off..seg_off + chunk]);
            filled += chunk;
            if chunk == avail {
                seg += 1;
                seg_off = 0;
            } else {
                seg_off += chunk;
            }
        }

        self.seg = seg as u32;
        self.offset = seg_off as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(bufs: &mut [Vec<u8>]) -> SegmentList {
        let segs: Vec<Segment> = bufs
            .iter_mut()
            .map(|b| Segment {
                vaddr: b.as_mut_ptr() as u64,
                len: b.len() as u32,
            })
            .collect();
        SegmentList::from_segments(&segs).unwrap()
    }

    #[test]
    fn gather_and_scatter_multi() {
        let mut bufs = vec![vec![0u8; 3], vec![0u8; 5], vec![0u8; 4]];
        let list = multi(&mut bufs);
        assert_eq!(list.total_length(), 12);
        assert_eq!(list.nseg(), 3);

        list.copy_from(b"abcdefghijkl", 12);
        assert_eq!(bufs[0], b"abc");
        assert_eq!(bufs[1], b"defgh");
        assert_eq!(bufs[2], b"ijkl");

        let mut out = vec![0u8; 12];
        list.copy_into(&mut out, 12);
        assert_eq!(out, b"abcdefghijkl");
    }

    #[test]
    fn copy_between_mismatched_boundaries() {
        let src_data = b"0123456789".to_vec();
        let list_src = SegmentList::from_slice(&src_data);
        let mut bufs = vec![vec![0u8; 4], vec![0u8; 6]];
        let list_dst = multi(&mut bufs);

        SegmentList::copy_between(&list_dst, &list_src, 10);
        assert_eq!(bufs[0], b"0123");
        assert_eq!(bufs[1], b"456789");
    }

    #[test]
    fn scan_resumes_contiguously() {
        let mut bufs = vec![vec![0u8; 4], vec![0u8; 4], vec![0u8; 4]];
        let list = multi(&mut bufs);
        let mut scan = SegScan::default();

        scan.copy_at(&list, b"aaaaa", 0);
        scan.copy_at(&list, b"bbbbb", 5);
        scan.copy_at(&list, b"cc", 10);
        assert_eq!(bufs[0], b"aaaa");
        assert_eq!(bufs[1], b"abbb");
        assert_eq!(bufs[2], b"bbcc");
    }

    #[test]
    fn scan_reseeks_on_out_of_order_offset() {
        let mut bufs = vec![vec![0u8; 4], vec![0u8; 4]];
        let list = multi(&mut bufs);
        let mut scan = SegScan::default();

        // fragment 1 before fragment 0
        scan.copy_at(&list, b"BBBB", 4);
        scan.copy_at(&list, b"AAAA", 0);
        assert_eq!(bufs[0], b"AAAA");
        assert_eq!(bufs[1], b"BBBB");
    }

    #[test]
    fn gather_crosses_segment_boundaries() {
        let mut bufs = vec![b"abc".to_vec(), b"defgh".to_vec(), b"ij".to_vec()];
        let list = multi(&mut bufs);
        let mut gather = SegGather::default();

        let mut a = [0u8; 4];
        gather.read_into(&list, &mut a);
        assert_eq!(&a, b"abcd");
        let mut b = [0u8; 6];
        gather.read_into(&list, &mut b);
        assert_eq!(&b, b"efghij");
    }

    #[test]
    fn too_many_segments_rejected() {
        let segs = vec![Segment { vaddr: 0, len: 0 }; MAX_SEGMENTS + 1];
        assert!(matches!(
            SegmentList::from_segments(&segs),
            Err(Error::SegmentsBadCount)
        ));
    }
}
