//! Aggregators carve many small allocations out of a few large "slabs" of
//! real file space. An open file keeps one for metadata and one for small raw
//! data.
//!
//! An [`Aggregator`] only does the bookkeeping. Obtaining slabs and returning
//! leftovers is driven by [`crate::VfdFile`], which owns the free lists and
//! the end of address.

use crate::core::{
    addr::Haddr,
    driver::Features,
    free_list::FreeExtent,
    mem_type::MemType,
};

/// Which of a file's two aggregators serves a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AggrKind {
    Metadata,
    SmallData,
}

impl AggrKind {
    pub fn for_type(ty: MemType) -> Self {
        if ty.is_raw() {
            AggrKind::SmallData
        } else {
            AggrKind::Metadata
        }
    }

    /// The feature bit that enables this aggregator.
    pub fn feature(self) -> Features {
        match self {
            AggrKind::Metadata => Features::AGGREGATE_METADATA,
            AggrKind::SmallData => Features::AGGREGATE_SMALLDATA,
        }
    }

    /// The memory type slabs are allocated as and leftovers are freed as.
    pub fn slab_type(self) -> MemType {
        match self {
            AggrKind::Metadata => MemType::Default,
            AggrKind::SmallData => MemType::Draw,
        }
    }
}

/// The unused tail of the current slab.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Slab {
    cursor: Haddr,
    remaining: u64,
}

impl Slab {
    fn end(&self) -> Haddr {
        self.cursor + self.remaining
    }
}

/// A block carved out of a slab.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Carve {
    pub addr: Haddr,
    /// Bytes skipped to reach an aligned address. The caller frees them.
    pub fragment: Option<FreeExtent>,
}

#[derive(Debug)]
pub(crate) struct Aggregator {
    kind: AggrKind,
    default_size: u64,
    // Created by the first slab allocation.
    slab: Option<Slab>,
}

impl Aggregator {
    /// A `default_size` of zero disables the aggregator.
    pub fn new(kind: AggrKind, default_size: u64) -> Self {
        Aggregator {
            kind,
            default_size,
            slab: None,
        }
    }

    pub fn default_size(&self) -> u64 {
        self.default_size
    }

    pub fn is_enabled(&self, features: Features) -> bool {
        self.default_size > 0 && features.contains(self.kind.feature())
    }

    pub fn remaining(&self) -> u64 {
        self.slab.map_or(0, |s| s.remaining)
    }

    /// Takes `size` bytes from the front of the slab, skipping ahead to the
    /// next multiple of `alignment` if one is given. Returns `None` if the
    /// slab is too small.
    pub fn carve(&mut self, size: u64, alignment: Option<u64>) -> Option<Carve> {
        let slab = self.slab.as_mut()?;
        let gap = alignment.map_or(0, |a| (a - slab.cursor % a) % a);
        if size.checked_add(gap)? > slab.remaining {
            return None;
        }
        let fragment = (gap > 0).then_some(FreeExtent {
            addr: slab.cursor,
            size: gap,
        });
        let addr = slab.cursor + gap;
        slab.cursor = addr + size;
        slab.remaining -= gap + size;
        Some(Carve { addr, fragment })
    }

    /// Handles a large block of `size` bytes that was just allocated at
    /// `addr`. If it starts right where the slab ends, the block is handed
    /// out from the slab cursor instead, so the slab keeps its remainder and
    /// moves past the new block. Returns the address to use, or `None` if the
    /// block is unrelated to the slab.
    pub fn absorb_adjacent(&mut self, addr: Haddr, size: u64, alignment: Option<u64>) -> Option<Haddr> {
        let slab = self.slab.as_mut()?;
        if slab.end() != addr || alignment.is_some_and(|a| slab.cursor % a != 0) {
            return None;
        }
        let start = slab.cursor;
        slab.cursor += size;
        Some(start)
    }

    /// Installs `[addr, addr + size)` as the slab. A new slab that continues
    /// the current one extends it; otherwise the old remainder is returned so
    /// the caller can free it.
    pub fn adopt_slab(&mut self, addr: Haddr, size: u64) -> Option<FreeExtent> {
        match &mut self.slab {
            Some(slab) if slab.end() == addr => {
                slab.remaining += size;
                None
            }
            slot => {
                let old = slot.replace(Slab {
                    cursor: addr,
                    remaining: size,
                });
                old.filter(|s| s.remaining > 0).map(|s| FreeExtent {
                    addr: s.cursor,
                    size: s.remaining,
                })
            }
        }
    }

    /// Gives up the rest of the slab.
    pub fn take_remainder(&mut self) -> Option<FreeExtent> {
        let slab = self.slab.as_mut()?;
        if slab.remaining == 0 {
            return None;
        }
        let rest = FreeExtent {
            addr: slab.cursor,
            size: slab.remaining,
        };
        slab.cursor = slab.end();
        slab.remaining = 0;
        Some(rest)
    }

    /// Whether the block `[addr, addr + size)` ends at the slab cursor while
    /// the slab itself ends at `eoa`.
    pub fn is_trailing_edge(&self, addr: Haddr, size: u64, eoa: Haddr) -> bool {
        self.slab
            .is_some_and(|s| s.end() == eoa && addr.checked_add(size) == Some(s.cursor))
    }

    /// Grows the block at the slab cursor by `extra` bytes of the slab.
    /// Returns `false` if the slab is too small, in which case nothing
    /// changes.
    pub fn extend_within(&mut self, extra: u64) -> bool {
        match &mut self.slab {
            Some(slab) if extra <= slab.remaining => {
                slab.cursor += extra;
                slab.remaining -= extra;
                true
            }
            _ => false,
        }
    }

    /// Gives up any slab space at or above `end`.
    pub fn clamp_to(&mut self, end: Haddr) {
        if let Some(slab) = &mut self.slab {
            if slab.end() > end {
                slab.remaining = end.saturating_sub(slab.cursor);
            }
        }
    }

    /// Marks the slab as used up to `end`, which becomes the new end of
    /// address.
    pub fn exhaust_at(&mut self, end: Haddr) {
        self.slab = Some(Slab {
            cursor: end,
            remaining: 0,
        });
    }
}
