//! File space allocation.
//!
//! A request is served, in order of preference, by
//! 1. the free list its memory type maps to,
//! 2. the metadata or small data aggregator, if enabled,
//! 3. a real allocation: the driver's own allocator if it has one, else
//!    bumping the end of address.
//!
//! Freed space goes back to the free list of its memory type. A free extent
//! that ends up touching the end of address is given back by lowering the
//! end of address instead.

use tracing::{debug, trace, warn};

use super::{Result, VfdFile};
use crate::core::{
    addr::{Haddr, addr_defined, checked_end},
    aggregator::AggrKind,
    consts,
    error::VfdError,
    free_list::Request,
    mem_type::MemType,
};

impl VfdFile {
    /// Allocates `size` bytes of file space for `ty`.
    pub fn alloc(&mut self, ty: MemType, size: u64) -> Result<Haddr> {
        if size == 0 {
            return Err(VfdError::InvalidArgument("zero-size allocation".into()));
        }
        if let Some(bucket) = self.fl_map.resolve(ty) {
            let avoid = if ty.is_raw() && self.accumulating() {
                self.accum.range()
            } else {
                None
            };
            let req = Request {
                size,
                alignment: self.alignment_for(size),
                avoid,
            };
            if let Some(addr) = self.free_lists.try_allocate(bucket, req) {
                trace!(%ty, addr, size, "allocated from free list");
                return Ok(addr);
            }
        }

        let kind = AggrKind::for_type(ty);
        let addr = if self.aggr(kind).is_enabled(self.features) {
            self.aggr_alloc(kind, ty, size)?
        } else {
            self.real_alloc(ty, size)?
        };
        trace!(%ty, addr, size, "allocated");
        Ok(addr)
    }

    /// Allocates `size` bytes from the driver or at the end of address.
    fn real_alloc(&mut self, ty: MemType, size: u64) -> Result<Haddr> {
        if let Some(ops) = self.driver.space_ops() {
            let addr = ops.alloc(ty, size)?;
            checked_end(addr, size, self.max_addr)?;
            return Ok(addr);
        }

        let eoa = self.driver.eoa();
        let pad = self.alignment_for(size).map_or(0, |a| (a - eoa % a) % a);
        let addr = checked_end(eoa, pad, self.max_addr)?;
        let end = checked_end(addr, size, self.max_addr)?;
        self.driver.set_eoa(end)?;
        if pad > 0 {
            self.free(ty, eoa, pad)?;
        }
        Ok(addr)
    }

    fn aggr_alloc(&mut self, kind: AggrKind, ty: MemType, size: u64) -> Result<Haddr> {
        let alignment = self.alignment_for(size);
        if let Some(addr) = self.carve(kind, size, alignment)? {
            return Ok(addr);
        }

        let default_size = self.aggr(kind).default_size();
        if size >= default_size {
            let addr = self.real_alloc(ty, size)?;
            return Ok(self
                .aggr_mut(kind)
                .absorb_adjacent(addr, size, alignment)
                .unwrap_or(addr));
        }

        let slab_type = kind.slab_type();
        let slab = self.real_alloc(slab_type, default_size)?;
        if let Some(rest) = self.aggr_mut(kind).adopt_slab(slab, default_size) {
            debug!(?kind, addr = rest.addr, size = rest.size, "replacing slab");
            self.free(slab_type, rest.addr, rest.size)?;
        }
        match self.carve(kind, size, alignment)? {
            Some(addr) => Ok(addr),
            // Only possible when the alignment gap eats the new slab.
            None => self.real_alloc(ty, size),
        }
    }

    fn carve(&mut self, kind: AggrKind, size: u64, alignment: Option<u64>) -> Result<Option<Haddr>> {
        let Some(carve) = self.aggr_mut(kind).carve(size, alignment) else {
            return Ok(None);
        };
        if let Some(frag) = carve.fragment {
            self.free(kind.slab_type(), frag.addr, frag.size)?;
        }
        Ok(Some(carve.addr))
    }

    /// Returns `[addr, addr + size)` to the file's free space. The range must
    /// lie below the end of address.
    ///
    /// Cached metadata in the freed range is dropped first. Types without a
    /// free list hand the space to the driver, or leak it if the driver
    /// manages no space.
    pub fn free(&mut self, ty: MemType, addr: Haddr, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = checked_end(addr, size, self.max_addr)?;
        let eoa = self.driver.eoa();
        if end > eoa {
            return Err(VfdError::AddressOverflow {
                addr,
                size,
                limit: eoa,
            });
        }
        if self.accumulating() {
            self.accum.discard(self.driver.as_mut(), addr, size)?;
        }

        let Some(bucket) = self.fl_map.resolve(ty) else {
            match self.driver.space_ops() {
                Some(ops) => ops.free(ty, addr, size)?,
                None => trace!(%ty, addr, size, "leaked file space"),
            }
            return Ok(());
        };

        let merged = self.free_lists.release(bucket, addr, size)?;
        trace!(%ty, addr, size, "freed");
        if merged.end() == self.driver.eoa() {
            self.driver.set_eoa(merged.addr)?;
            self.free_lists.discard_front(bucket);
            debug!(%bucket, eoa = merged.addr, reclaimed = merged.size, "lowered end of address");
        }
        Ok(())
    }

    /// Resizes the block at `old_addr`, moving it if it has to grow.
    ///
    /// Returns the block's address, or `None` when `new_size` is zero and the
    /// block was freed. An undefined `old_addr` or zero `old_size` makes this
    /// a plain allocation.
    pub fn realloc(&mut self, ty: MemType, old_addr: Haddr, old_size: u64, new_size: u64) -> Result<Option<Haddr>> {
        if !addr_defined(old_addr) || old_size == 0 {
            if new_size == 0 {
                return Ok(None);
            }
            return self.alloc(ty, new_size).map(Some);
        }
        if new_size == old_size {
            return Ok(Some(old_addr));
        }
        if new_size == 0 {
            self.free(ty, old_addr, old_size)?;
            return Ok(None);
        }
        if new_size < old_size {
            self.free(ty, old_addr + new_size, old_size - new_size)?;
            return Ok(Some(old_addr));
        }

        let new_addr = self.alloc(ty, new_size)?;
        if let Err(err) = self.copy_block(ty, old_addr, new_addr, old_size) {
            if let Err(cleanup) = self.free(ty, new_addr, new_size) {
                warn!(%ty, addr = new_addr, size = new_size, %cleanup, "failed to free realloc destination");
            }
            return Err(err);
        }
        self.free(ty, old_addr, old_size)?;
        Ok(Some(new_addr))
    }

    fn copy_block(&mut self, ty: MemType, from: Haddr, to: Haddr, size: u64) -> Result<()> {
        let len = usize::try_from(size)
            .map_err(|_| VfdError::InvalidArgument(format!("cannot stage {size} bytes").into()))?;
        if len <= consts::STACK_COPY_SIZE {
            let mut staging = [0u8; consts::STACK_COPY_SIZE];
            let buf = &mut staging[..len];
            self.read(ty, from, buf)?;
            self.write(ty, to, buf)
        } else {
            let mut buf = Vec::new();
            buf.try_reserve_exact(len).map_err(VfdError::no_space(len))?;
            buf.resize(len, 0);
            self.read(ty, from, &mut buf)?;
            self.write(ty, to, &buf)
        }
    }

    /// Whether the block `[addr, addr + size)` can grow in place, i.e. it
    /// ends at the end of address or at the cursor of an aggregator slab
    /// that does.
    pub fn can_extend(&self, ty: MemType, addr: Haddr, size: u64) -> bool {
        let eoa = self.driver.eoa();
        if addr.checked_add(size) == Some(eoa) {
            return true;
        }
        let aggr = self.aggr(AggrKind::for_type(ty));
        aggr.is_enabled(self.features) && aggr.is_trailing_edge(addr, size, eoa)
    }

    /// Grows the block `[addr, addr + size)` by `extra` bytes in place.
    pub fn extend(&mut self, ty: MemType, addr: Haddr, size: u64, extra: u64) -> Result<()> {
        let end = checked_end(addr, size, self.max_addr)?;
        if extra == 0 {
            return Ok(());
        }
        let eoa = self.driver.eoa();
        if end == eoa {
            let new_eoa = checked_end(end, extra, self.max_addr)?;
            return Ok(self.driver.set_eoa(new_eoa)?);
        }

        let kind = AggrKind::for_type(ty);
        let features = self.features;
        let aggr = self.aggr_mut(kind);
        if !(aggr.is_enabled(features) && aggr.is_trailing_edge(addr, size, eoa)) {
            return Err(VfdError::InvalidArgument(
                format!("{size} bytes at {addr:#x} cannot be extended in place").into(),
            ));
        }
        if !aggr.extend_within(extra) {
            let new_eoa = checked_end(end, extra, self.max_addr)?;
            self.driver.set_eoa(new_eoa)?;
            self.aggr_mut(kind).exhaust_at(new_eoa);
        }
        Ok(())
    }
}
