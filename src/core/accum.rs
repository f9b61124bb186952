//! The metadata accumulator is a write-combining cache for one contiguous
//! range of metadata.
//!
//! It mirrors the bytes `[loc, loc + size)` of the file. Writes that touch or
//! overlap the cached range are merged into it; a write elsewhere first
//! flushes dirty contents and then takes over the buffer. Reads are served
//! from the buffer where they overlap it, and go to the driver for the rest.
//!
//! The buffer grows by doubling. When it is reloaded with a range much
//! smaller than its capacity, it shrinks by [`consts::ACCUM_THROTTLE`] as
//! long as it is larger than [`consts::ACCUM_THRESHOLD`].

use tracing::debug;

use crate::core::{
    addr::{HADDR_UNDEF, Haddr, overlaps},
    consts,
    driver::Driver,
    error::VfdError,
    mem_type::MemType,
};

/// Where a write lands relative to the cached range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Placement {
    /// Ends exactly where the cache begins.
    Prepend,
    /// Begins exactly where the cache ends.
    Append,
    Inside,
    /// Starts before the cache and ends inside it.
    OverlapFront,
    /// Starts inside the cache and ends after it.
    OverlapEnd,
    /// Starts before the cache and ends after it.
    Covers,
    Disjoint,
}

#[derive(Debug)]
pub(crate) struct Accumulator {
    // The whole vector is usable; its length is the capacity.
    buf: Vec<u8>,
    loc: Haddr,
    size: usize,
    dirty: bool,
}

impl Accumulator {
    pub fn new() -> Self {
        Accumulator {
            buf: Vec::new(),
            loc: HADDR_UNDEF,
            size: 0,
            dirty: false,
        }
    }

    /// The cached range, if any.
    pub fn range(&self) -> Option<(Haddr, u64)> {
        (self.size > 0).then_some((self.loc, self.size as u64))
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn end(&self) -> Haddr {
        self.loc + self.size as u64
    }

    fn reset(&mut self) {
        self.loc = HADDR_UNDEF;
        self.size = 0;
        self.dirty = false;
    }

    fn classify(&self, addr: Haddr, end: Haddr) -> Placement {
        if self.size == 0 {
            return Placement::Disjoint;
        }
        let (loc, cur_end) = (self.loc, self.end());
        if end == loc {
            Placement::Prepend
        } else if addr == cur_end {
            Placement::Append
        } else if end < loc || addr > cur_end {
            Placement::Disjoint
        } else if addr >= loc {
            if end <= cur_end {
                Placement::Inside
            } else {
                Placement::OverlapEnd
            }
        } else if end <= cur_end {
            Placement::OverlapFront
        } else {
            Placement::Covers
        }
    }

    /// Makes room for at least `needed` bytes, doubling the capacity when it
    /// has to grow.
    fn ensure_capacity(&mut self, needed: usize) -> Result<(), VfdError> {
        let cap = self.buf.len();
        if needed <= cap {
            return Ok(());
        }
        let new_cap = needed.max(cap.saturating_mul(2));
        self.resize_buf(new_cap)
    }

    /// Sizes the buffer for a fresh range of `needed` bytes.
    fn fit_for_replace(&mut self, needed: usize) -> Result<(), VfdError> {
        let cap = self.buf.len();
        if needed > cap {
            self.resize_buf(needed)
        } else if needed < cap / consts::ACCUM_THROTTLE && cap > consts::ACCUM_THRESHOLD {
            self.resize_buf(cap / consts::ACCUM_THROTTLE)
        } else {
            Ok(())
        }
    }

    fn resize_buf(&mut self, new_cap: usize) -> Result<(), VfdError> {
        let cap = self.buf.len();
        if new_cap > cap {
            self.buf
                .try_reserve_exact(new_cap - cap)
                .map_err(VfdError::no_space(new_cap))?;
            self.buf.resize(new_cap, 0);
        } else {
            self.buf.truncate(new_cap);
            self.buf.shrink_to_fit();
        }
        debug!(from = cap, to = new_cap, "resized metadata accumulator");
        Ok(())
    }

    /// Writes dirty contents to the driver.
    pub fn flush(&mut self, driver: &mut dyn Driver) -> Result<(), VfdError> {
        if self.dirty && self.size > 0 {
            driver.write(MemType::Default, self.loc, &self.buf[..self.size])?;
            debug!(loc = self.loc, size = self.size, "flushed metadata accumulator");
        }
        self.dirty = false;
        Ok(())
    }

    /// Replaces the cached range with `data` at `addr`, which is not flushed.
    fn replace(&mut self, addr: Haddr, data: &[u8]) -> Result<(), VfdError> {
        self.fit_for_replace(data.len())?;
        self.buf[..data.len()].copy_from_slice(data);
        self.loc = addr;
        self.size = data.len();
        self.dirty = true;
        Ok(())
    }

    /// Caches a metadata write of `data` at `addr`.
    pub fn write(&mut self, driver: &mut dyn Driver, addr: Haddr, data: &[u8]) -> Result<(), VfdError> {
        let n = data.len();
        if n == 0 {
            return Ok(());
        }
        let end = addr + n as u64;
        match self.classify(addr, end) {
            Placement::Prepend => {
                let new_size = self.size + n;
                self.ensure_capacity(new_size)?;
                self.buf.copy_within(..self.size, n);
                self.buf[..n].copy_from_slice(data);
                self.loc = addr;
                self.size = new_size;
            }
            Placement::Append => {
                let new_size = self.size + n;
                self.ensure_capacity(new_size)?;
                self.buf[self.size..new_size].copy_from_slice(data);
                self.size = new_size;
            }
            Placement::Inside => {
                let off = (addr - self.loc) as usize;
                self.buf[off..off + n].copy_from_slice(data);
            }
            Placement::OverlapFront => {
                let new_size = (self.end() - addr) as usize;
                self.ensure_capacity(new_size)?;
                let kept = (end - self.loc) as usize;
                self.buf.copy_within(kept..self.size, n);
                self.buf[..n].copy_from_slice(data);
                self.loc = addr;
                self.size = new_size;
            }
            Placement::OverlapEnd => {
                let off = (addr - self.loc) as usize;
                let new_size = off + n;
                self.ensure_capacity(new_size)?;
                self.buf[off..new_size].copy_from_slice(data);
                self.size = new_size;
            }
            // Every cached byte is superseded.
            Placement::Covers => return self.replace(addr, data),
            Placement::Disjoint => {
                self.flush(driver)?;
                return self.replace(addr, data);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Reads metadata at `addr` into `out`.
    ///
    /// When the request misses the cache it is loaded into the cache, unless
    /// the cache is dirty and `allow_displace` is false, in which case the
    /// request bypasses the cache.
    pub fn read(
        &mut self,
        driver: &mut dyn Driver,
        ty: MemType,
        addr: Haddr,
        out: &mut [u8],
        allow_displace: bool,
    ) -> Result<(), VfdError> {
        let n = out.len();
        if n == 0 {
            return Ok(());
        }
        if self.size > 0 && overlaps(addr, n as u64, self.loc, self.size as u64) {
            return self.read_overlapping(driver, ty, addr, out);
        }
        if self.dirty && !allow_displace {
            driver.read(ty, addr, out)?;
            return Ok(());
        }

        self.flush(driver)?;
        self.reset();
        self.fit_for_replace(n)?;
        driver.read(ty, addr, &mut self.buf[..n])?;
        self.loc = addr;
        self.size = n;
        out.copy_from_slice(&self.buf[..n]);
        Ok(())
    }

    fn read_overlapping(
        &mut self,
        driver: &mut dyn Driver,
        ty: MemType,
        addr: Haddr,
        out: &mut [u8],
    ) -> Result<(), VfdError> {
        let n = out.len();
        let end = addr + n as u64;
        let mut done = 0;

        if addr < self.loc {
            let prefix = (self.loc - addr) as usize;
            driver.read(ty, addr, &mut out[..prefix])?;
            done += prefix;
        }

        let start = addr.max(self.loc);
        let stop = end.min(self.end());
        let (src, dst) = ((start - self.loc) as usize, (start - addr) as usize);
        let len = (stop - start) as usize;
        out[dst..dst + len].copy_from_slice(&self.buf[src..src + len]);
        done += len;

        if end > self.end() {
            let suffix_at = (self.end() - addr) as usize;
            driver.read(ty, self.end(), &mut out[suffix_at..])?;
            done += n - suffix_at;
        }

        if done != n {
            return Err(VfdError::Logic(
                format!("split read of {n} bytes at {addr:#x} covered {done} bytes").into(),
            ));
        }
        Ok(())
    }

    /// Drops `[addr, addr + size)` from the cache because that space is being
    /// freed. Dirty bytes past the freed range that can no longer be kept are
    /// written out first.
    pub fn discard(&mut self, driver: &mut dyn Driver, addr: Haddr, size: u64) -> Result<(), VfdError> {
        if self.size == 0 || !overlaps(addr, size, self.loc, self.size as u64) {
            return Ok(());
        }
        let (loc, cur_end) = (self.loc, self.end());
        let end = addr + size;

        if addr <= loc {
            if end >= cur_end {
                self.reset();
            } else {
                let cut = (end - loc) as usize;
                self.buf.copy_within(cut..self.size, 0);
                self.loc = end;
                self.size -= cut;
            }
            return Ok(());
        }

        if end < cur_end && self.dirty {
            let from = (end - loc) as usize;
            driver.write(MemType::Default, end, &self.buf[from..self.size])?;
        }
        self.size = (addr - loc) as usize;
        Ok(())
    }
}
