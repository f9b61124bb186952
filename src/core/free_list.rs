//! The free list holds file space that was allocated and later released, so
//! it can be handed out again before the end of address is bumped.
//!
//! There is one list ("bucket") per [`MemType`]; a [`crate::FreeListMap`]
//! decides which bucket a memory type actually uses. Each bucket is kept in
//! recency order: a freshly released (and merged) extent goes to the front.
//!
//! ## Searching
//!
//! Without alignment, an exact size match wins immediately; otherwise the
//! smallest extent larger than the request is shrunk from the front.
//!
//! With alignment, extents that already start aligned are preferred (exact
//! match first, then the smallest larger one). Failing that, the smallest
//! unaligned extent that still fits after skipping to the next aligned
//! address is split into a head remainder, the returned block, and a tail
//! remainder.
//!
//! Each bucket caches an upper bound of its largest extent (`maxsize`) so
//! requests that cannot possibly fit skip the scan. Zero means "unknown".

use std::collections::VecDeque;

use crate::core::{
    addr::{Haddr, overlaps},
    error::VfdError,
    mem_type::MemType,
};

/// A reclaimed range of file space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeExtent {
    pub addr: Haddr,
    pub size: u64,
}

impl FreeExtent {
    #[inline]
    pub fn end(&self) -> Haddr {
        self.addr + self.size
    }
}

#[derive(Debug, Default)]
struct Bucket {
    extents: VecDeque<FreeExtent>,
    maxsize: u64,
}

impl Bucket {
    /// Forgets `maxsize` if the extent that reached it is about to change.
    fn invalidate_maxsize(&mut self, size: u64) {
        if size == self.maxsize {
            self.maxsize = 0;
        }
    }
}

/// A search request against one bucket.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Request {
    pub size: u64,
    /// Alignment the returned address must satisfy, if any.
    pub alignment: Option<u64>,
    /// A range the returned block must not overlap.
    pub avoid: Option<(Haddr, u64)>,
}

impl Request {
    fn is_avoided(&self, addr: Haddr) -> bool {
        self.avoid
            .is_some_and(|(start, size)| overlaps(addr, self.size, start, size))
    }
}

/// The free lists of one open file, one bucket per memory type.
#[derive(Debug, Default)]
pub(crate) struct FreeLists {
    buckets: [Bucket; MemType::COUNT],
}

impl FreeLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a block of `req.size` bytes from `bucket`, or returns `None` on a
    /// miss.
    pub fn try_allocate(&mut self, bucket: MemType, req: Request) -> Option<Haddr> {
        let b = &mut self.buckets[bucket.index()];
        if req.size == 0 || b.extents.is_empty() {
            return None;
        }
        if b.maxsize != 0 && req.size > b.maxsize {
            return None;
        }

        let mut best: Option<usize> = None;
        let mut found_aligned = false;
        let mut observed_max = 0;
        let mut i = 0;
        while i < b.extents.len() {
            let ext = b.extents[i];
            observed_max = observed_max.max(ext.size);
            let best_size = best.map(|j| b.extents[j].size);
            match req.alignment {
                Some(align) if ext.addr % align != 0 => {
                    let gap = align - ext.addr % align;
                    let fits = req.size.checked_add(gap).is_some_and(|need| ext.size >= need);
                    if fits && !found_aligned && best_size.is_none_or(|s| ext.size < s) {
                        best = Some(i);
                    }
                }
                alignment => {
                    if ext.size == req.size && !req.is_avoided(ext.addr) {
                        b.extents.remove(i);
                        b.invalidate_maxsize(ext.size);
                        return Some(ext.addr);
                    }
                    let aligned = alignment.is_some();
                    let better = match best_size {
                        None => true,
                        Some(_) if aligned && !found_aligned => true,
                        Some(s) => ext.size < s,
                    };
                    if ext.size > req.size && better {
                        best = Some(i);
                        found_aligned = aligned;
                    }
                }
            }
            i += 1;
        }
        // The scan saw every extent, so the observed maximum is exact.
        b.maxsize = observed_max;

        let i = best?;
        let ext = b.extents[i];
        match req.alignment {
            Some(align) if !found_aligned => {
                let gap = align - ext.addr % align;
                let addr = ext.addr + gap;
                if req.is_avoided(addr) {
                    return None;
                }
                b.invalidate_maxsize(ext.size);
                let tail = ext.size - gap - req.size;
                b.extents[i].size = gap;
                if tail > 0 {
                    b.extents.insert(
                        i + 1,
                        FreeExtent {
                            addr: addr + req.size,
                            size: tail,
                        },
                    );
                }
                Some(addr)
            }
            _ => {
                if req.is_avoided(ext.addr) {
                    return None;
                }
                b.invalidate_maxsize(ext.size);
                let e = &mut b.extents[i];
                e.addr += req.size;
                e.size -= req.size;
                Some(ext.addr)
            }
        }
    }

    /// Returns `[addr, addr + size)` to `bucket`, merging it with every extent
    /// it touches. The merged extent ends up at the front of the bucket and is
    /// returned.
    pub fn release(&mut self, bucket: MemType, addr: Haddr, size: u64) -> Result<FreeExtent, VfdError> {
        let b = &mut self.buckets[bucket.index()];
        if let Some(dup) = b.extents.iter().find(|e| overlaps(e.addr, e.size, addr, size)) {
            return Err(VfdError::InvalidArgument(
                format!(
                    "{size} bytes at {addr:#x} overlap free extent of {} bytes at {:#x}",
                    dup.size, dup.addr
                )
                .into(),
            ));
        }

        let mut merged = FreeExtent { addr, size };
        while let Some(j) = b
            .extents
            .iter()
            .position(|e| e.end() == merged.addr || merged.end() == e.addr)
        {
            let Some(e) = b.extents.remove(j) else {
                break;
            };
            merged = FreeExtent {
                addr: merged.addr.min(e.addr),
                size: merged.size + e.size,
            };
        }
        b.extents.push_front(merged);
        if b.maxsize != 0 {
            b.maxsize = b.maxsize.max(merged.size);
        }
        Ok(merged)
    }

    /// Removes the front extent of `bucket`, i.e. the one [`Self::release`]
    /// just returned.
    pub fn discard_front(&mut self, bucket: MemType) -> Option<FreeExtent> {
        let b = &mut self.buckets[bucket.index()];
        let ext = b.extents.pop_front()?;
        b.invalidate_maxsize(ext.size);
        Some(ext)
    }

    /// Drops free space at or above `end`, shortening extents that cross it.
    /// `maxsize` stays a valid upper bound.
    pub fn truncate(&mut self, end: Haddr) {
        for b in &mut self.buckets {
            b.extents.retain_mut(|e| {
                if e.end() > end {
                    e.size = end.saturating_sub(e.addr);
                }
                e.size > 0
            });
        }
    }

    /// Total number of free bytes in `bucket`.
    pub fn free_space(&self, bucket: MemType) -> u64 {
        self.buckets[bucket.index()].extents.iter().map(|e| e.size).sum()
    }

    pub fn total_free_space(&self) -> u64 {
        MemType::ALL.iter().map(|&ty| self.free_space(ty)).sum()
    }

    pub fn extents(&self, bucket: MemType) -> impl Iterator<Item = &FreeExtent> {
        self.buckets[bucket.index()].extents.iter()
    }

    /// Empties every bucket, yielding what was in it.
    pub fn drain(&mut self) -> impl Iterator<Item = (MemType, FreeExtent)> + '_ {
        MemType::ALL.into_iter().flat_map(move |ty| {
            let b = std::mem::take(&mut self.buckets[ty.index()]);
            b.extents.into_iter().map(move |e| (ty, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(size: u64) -> Request {
        Request {
            size,
            alignment: None,
            avoid: None,
        }
    }

    fn aligned(size: u64, align: u64) -> Request {
        Request {
            size,
            alignment: Some(align),
            avoid: None,
        }
    }

    fn extents(fl: &FreeLists, bucket: MemType) -> Vec<(Haddr, u64)> {
        fl.extents(bucket).map(|e| (e.addr, e.size)).collect()
    }

    #[test]
    fn test_exact_fit_preferred() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 0, 4096).unwrap();
        fl.release(MemType::Draw, 8192, 100).unwrap();
        fl.release(MemType::Draw, 16384, 200).unwrap();

        assert_eq!(fl.try_allocate(MemType::Draw, req(4096)), Some(0));
        assert_eq!(extents(&fl, MemType::Draw), vec![(16384, 200), (8192, 100)]);
    }

    #[test]
    fn test_best_fit_shrinks_from_front() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Btree, 0, 500).unwrap();
        fl.release(MemType::Btree, 1000, 150).unwrap();
        fl.release(MemType::Btree, 2000, 300).unwrap();

        assert_eq!(fl.try_allocate(MemType::Btree, req(100)), Some(1000));
        assert_eq!(fl.free_space(MemType::Btree), 850);
        assert!(extents(&fl, MemType::Btree).contains(&(1100, 50)));
    }

    #[test]
    fn test_buckets_are_independent() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Ohdr, 0, 64).unwrap();
        assert_eq!(fl.try_allocate(MemType::Lheap, req(64)), None);
        assert_eq!(fl.try_allocate(MemType::Ohdr, req(64)), Some(0));
        assert_eq!(fl.total_free_space(), 0);
    }

    #[test]
    fn test_release_merges_both_directions() {
        let mut fl = FreeLists::new();
        // B, then A, then C.
        fl.release(MemType::Default, 100, 100).unwrap();
        fl.release(MemType::Default, 0, 100).unwrap();
        let merged = fl.release(MemType::Default, 200, 100).unwrap();
        assert_eq!(merged, FreeExtent { addr: 0, size: 300 });
        assert_eq!(extents(&fl, MemType::Default), vec![(0, 300)]);

        // A gap filler joins two existing extents.
        let mut fl = FreeLists::new();
        fl.release(MemType::Default, 0, 10).unwrap();
        fl.release(MemType::Default, 20, 10).unwrap();
        fl.release(MemType::Default, 50, 10).unwrap();
        let merged = fl.release(MemType::Default, 10, 10).unwrap();
        assert_eq!(merged, FreeExtent { addr: 0, size: 30 });
        assert_eq!(extents(&fl, MemType::Default), vec![(0, 30), (50, 10)]);
    }

    #[test]
    fn test_release_rejects_double_free() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Default, 100, 100).unwrap();
        assert!(matches!(
            fl.release(MemType::Default, 150, 10),
            Err(VfdError::InvalidArgument(_))
        ));
        assert_eq!(fl.free_space(MemType::Default), 100);
    }

    #[test]
    fn test_aligned_split_into_three() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 300, 1000).unwrap();

        let addr = fl.try_allocate(MemType::Draw, aligned(400, 512)).unwrap();
        assert_eq!(addr, 512);
        assert_eq!(
            extents(&fl, MemType::Draw),
            vec![(300, 212), (912, 388)],
            "head and tail remain free"
        );
    }

    #[test]
    fn test_aligned_extent_preferred_over_unaligned() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 100, 2000).unwrap();
        fl.release(MemType::Draw, 4096, 600).unwrap();
        fl.release(MemType::Draw, 8192 + 7, 5000).unwrap();

        assert_eq!(fl.try_allocate(MemType::Draw, aligned(512, 512)), Some(4096));
        assert_eq!(fl.free_space(MemType::Draw), 2000 + 88 + 5000);
    }

    #[test]
    fn test_aligned_exact_match() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 1024, 512).unwrap();
        fl.release(MemType::Draw, 4096, 2048).unwrap();
        assert_eq!(fl.try_allocate(MemType::Draw, aligned(512, 512)), Some(1024));
        assert_eq!(extents(&fl, MemType::Draw), vec![(4096, 2048)]);
    }

    #[test]
    fn test_unaligned_too_small_after_gap() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 10, 600).unwrap();
        // The next aligned address is 512, leaving only 98 bytes.
        assert_eq!(fl.try_allocate(MemType::Draw, aligned(100, 512)), None);
    }

    #[test]
    fn test_avoided_range_is_a_miss() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 0, 100).unwrap();
        let mut r = req(100);
        r.avoid = Some((50, 10));
        assert_eq!(fl.try_allocate(MemType::Draw, r), None);

        let mut r = req(40);
        r.avoid = Some((50, 10));
        assert_eq!(fl.try_allocate(MemType::Draw, r), Some(0));
    }

    #[test]
    fn test_maxsize_fast_reject_stays_conservative() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 0, 100).unwrap();
        fl.release(MemType::Draw, 1000, 300).unwrap();

        // Full scan with a miss learns the exact maximum.
        assert_eq!(fl.try_allocate(MemType::Draw, req(400)), None);
        assert_eq!(fl.buckets[MemType::Draw.index()].maxsize, 300);

        // Consuming the largest extent forgets it.
        assert_eq!(fl.try_allocate(MemType::Draw, req(300)), Some(1000));
        assert_eq!(fl.buckets[MemType::Draw.index()].maxsize, 0);

        // A larger release is never hidden by a stale bound.
        assert_eq!(fl.try_allocate(MemType::Draw, req(150)), None);
        fl.release(MemType::Draw, 5000, 1000).unwrap();
        assert_eq!(fl.try_allocate(MemType::Draw, req(600)), Some(5000));
    }

    #[test]
    fn test_discard_front_and_drain() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Super, 0, 10).unwrap();
        fl.release(MemType::Super, 100, 10).unwrap();
        fl.release(MemType::Gheap, 200, 10).unwrap();
        assert_eq!(
            fl.discard_front(MemType::Super),
            Some(FreeExtent { addr: 100, size: 10 })
        );
        let drained: Vec<_> = fl.drain().collect();
        assert_eq!(
            drained,
            vec![
                (MemType::Super, FreeExtent { addr: 0, size: 10 }),
                (MemType::Gheap, FreeExtent { addr: 200, size: 10 }),
            ]
        );
        assert_eq!(fl.total_free_space(), 0);
    }

    #[test]
    fn test_truncate_drops_space_past_end() {
        let mut fl = FreeLists::new();
        fl.release(MemType::Draw, 0, 100).unwrap();
        fl.release(MemType::Draw, 500, 1000).unwrap();
        fl.release(MemType::Ohdr, 2000, 100).unwrap();

        fl.truncate(800);
        assert_eq!(extents(&fl, MemType::Draw), vec![(500, 300), (0, 100)]);
        assert_eq!(extents(&fl, MemType::Ohdr), vec![]);
        assert_eq!(fl.try_allocate(MemType::Draw, req(301)), None);
        assert_eq!(fl.try_allocate(MemType::Draw, req(300)), Some(500));
    }
}
