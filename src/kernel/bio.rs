// Buffer cache.
//
// The cache is a fixed pool of buffers, each holding one disk block.
// Buffers are threaded on two lists at once: a per-device chain of every
// buffer currently assigned to that device, and the global LRU free list
// of buffers no one holds. Both are index lists into the pool; the last
// pool slot is the free-list sentinel, and its device chain doubles as
// the home of NODEV scratch buffers.
//
// Interface:
// * To get a buffer for a particular disk block, call bread.
// * After changing buffer data, call bwrite (or bdwrite to defer the
//   write until the buffer is reused).
// * When done with the buffer, call brelse.
// * Only one holder at a time can use a buffer; everyone else sleeps on
//   the buffer itself until it is released.

use crate::defs::{KError, Result};
use crate::kernel::{Cpu, KernelState};
use crate::param::{Dev, BSIZE, CLICK, CLPB, NODEV, PRIBIO};
use crate::proc::Chan;

use bitflags::bitflags;
use log::warn;

/// Index value terminating a device chain.
pub const NIL: usize = usize::MAX;

bitflags! {
    pub struct BFlags: u16 {
        /// Transfer direction is device-to-core. Write is the absence.
        const READ   = 0o1;
        /// Transfer has completed; contents are valid.
        const DONE   = 0o2;
        /// Transfer failed.
        const ERROR  = 0o4;
        /// Some holder owns the buffer; it is off the free list.
        const BUSY   = 0o10;
        /// Somebody sleeps on this buffer waiting for it.
        const WANTED = 0o100;
        /// Do not wait for completion; release at interrupt level.
        const ASYNC  = 0o400;
        /// Contents are dirty; write back before reassignment.
        const DELWRI = 0o1000;
    }
}

#[derive(Debug)]
pub struct Buf {
    pub flags: BFlags,
    /// Next buffer on the same device chain.
    pub forw: usize,
    /// Free list links, valid while the buffer is not BUSY.
    pub av_forw: usize,
    pub av_back: usize,
    pub dev: Dev,
    pub blkno: u32,
    pub data: [u8; BSIZE],
}

impl Buf {
    pub fn new(dev: Dev) -> Self {
        Self {
            flags: BFlags::empty(),
            forw: NIL,
            av_forw: NIL,
            av_back: NIL,
            dev,
            blkno: 0,
            data: [0; BSIZE],
        }
    }
}

impl KernelState {
    /// Build the pool: every buffer starts free and unassigned (NODEV).
    pub(crate) fn binit(&mut self, nbuf: usize) {
        self.bufs.clear();
        for _ in 0..nbuf {
            self.bufs.push(Buf::new(NODEV));
        }
        self.bufs.push(Buf::new(NODEV)); // free list sentinel
        let s = self.sentinel();
        self.bufs[s].av_forw = s;
        self.bufs[s].av_back = s;
        for b in 0..nbuf {
            self.bavail_tail(b);
            self.bhash_insert(b);
        }
    }

    pub(crate) fn sentinel(&self) -> usize {
        self.bufs.len() - 1
    }

    fn bhash_head(&self, dev: Dev) -> usize {
        if dev == NODEV {
            self.bufs[self.sentinel()].forw
        } else {
            self.bdevsw[dev.major()].tab.forw
        }
    }

    fn bhash_set_head(&mut self, dev: Dev, b: usize) {
        if dev == NODEV {
            let s = self.sentinel();
            self.bufs[s].forw = b;
        } else {
            self.bdevsw[dev.major()].tab.forw = b;
        }
    }

    fn bhash_insert(&mut self, b: usize) {
        let dev = self.bufs[b].dev;
        self.bufs[b].forw = self.bhash_head(dev);
        self.bhash_set_head(dev, b);
    }

    fn bhash_remove(&mut self, b: usize) {
        let dev = self.bufs[b].dev;
        let next = self.bufs[b].forw;
        let mut p = self.bhash_head(dev);
        if p == b {
            self.bhash_set_head(dev, next);
            return;
        }
        while p != NIL {
            if self.bufs[p].forw == b {
                self.bufs[p].forw = next;
                return;
            }
            p = self.bufs[p].forw;
        }
        panic!("bhash");
    }

    /// Is the block already in the cache, busy or not?
    pub fn incore(&self, dev: Dev, blkno: u32) -> Option<usize> {
        let mut b = self.bhash_head(dev);
        while b != NIL {
            if self.bufs[b].dev == dev && self.bufs[b].blkno == blkno {
                return Some(b);
            }
            b = self.bufs[b].forw;
        }
        None
    }

    /// Take a buffer off the free list and mark it owned.
    fn notavail(&mut self, b: usize) {
        let (f, k) = (self.bufs[b].av_forw, self.bufs[b].av_back);
        self.bufs[k].av_forw = f;
        self.bufs[f].av_back = k;
        self.bufs[b].av_forw = NIL;
        self.bufs[b].av_back = NIL;
        self.bufs[b].flags.insert(BFlags::BUSY);
    }

    fn bavail_tail(&mut self, b: usize) {
        let s = self.sentinel();
        let t = self.bufs[s].av_back;
        self.bufs[t].av_forw = b;
        self.bufs[s].av_back = b;
        self.bufs[b].av_back = t;
        self.bufs[b].av_forw = s;
    }

    fn bavail_head(&mut self, b: usize) {
        let s = self.sentinel();
        let h = self.bufs[s].av_forw;
        self.bufs[s].av_forw = b;
        self.bufs[h].av_back = b;
        self.bufs[b].av_forw = h;
        self.bufs[b].av_back = s;
    }

    /// Release a buffer: wake anyone waiting for it or for any free
    /// buffer, and put it back on the free list. A buffer whose I/O
    /// failed loses its identity and goes to the head for quick reuse;
    /// everything else ages from the tail.
    pub fn brelse(&mut self, b: usize) {
        if self.bufs[b].flags.contains(BFlags::WANTED) {
            self.wakeup(Chan::Buf(b));
        }
        let s = self.sentinel();
        if self.bufs[s].flags.contains(BFlags::WANTED) {
            self.bufs[s].flags.remove(BFlags::WANTED);
            self.wakeup(Chan::BFree);
        }
        if self.bufs[b].flags.contains(BFlags::ERROR) {
            // no association survives a failed transfer
            self.bhash_remove(b);
            self.bufs[b].dev = NODEV;
            self.bufs[b].blkno = 0;
            self.bhash_insert(b);
            self.bufs[b].flags.remove(BFlags::DELWRI | BFlags::DONE);
            self.bavail_head(b);
        } else {
            self.bavail_tail(b);
        }
        self.bufs[b]
            .flags
            .remove(BFlags::BUSY | BFlags::WANTED | BFlags::ASYNC);
    }

    /// Hand the buffer to its device and run the transfer. The strategy
    /// contract is synchronous: the request queue holds the buffer only
    /// for the duration of the call.
    fn devstart(&mut self, b: usize) {
        let dev = self.bufs[b].dev;
        if dev == NODEV || dev.major() >= self.bdevsw.len() {
            panic!("blkdev");
        }
        let maj = dev.major();
        {
            let tab = &mut self.bdevsw[maj].tab;
            tab.actf = b;
            tab.active = true;
        }
        {
            let st = &mut *self;
            let ent = &mut st.bdevsw[maj];
            let bp = &mut st.bufs[b];
            ent.dev.strategy(bp);
        }
        {
            let failed = self.bufs[b].flags.contains(BFlags::ERROR);
            let tab = &mut self.bdevsw[maj].tab;
            tab.actf = NIL;
            tab.active = false;
            if failed {
                tab.errcnt = tab.errcnt.saturating_add(1);
            }
        }
        self.iodone(b);
    }

    /// Mark a transfer finished. Asynchronous buffers are released here;
    /// everyone else is woken to collect the result.
    fn iodone(&mut self, b: usize) {
        self.bufs[b].flags.insert(BFlags::DONE);
        if self.bufs[b].flags.contains(BFlags::ASYNC) {
            self.brelse(b);
        } else {
            self.bufs[b].flags.remove(BFlags::WANTED);
            self.wakeup(Chan::Buf(b));
        }
    }

    /// Write the buffer out. Unless the write is asynchronous the buffer
    /// is released afterwards, error or not.
    pub fn bwrite(&mut self, b: usize) -> Result<()> {
        let flags = self.bufs[b].flags;
        self.bufs[b]
            .flags
            .remove(BFlags::READ | BFlags::DONE | BFlags::ERROR | BFlags::DELWRI);
        self.devstart(b);
        if !flags.contains(BFlags::ASYNC) {
            let failed = self.bufs[b].flags.contains(BFlags::ERROR);
            if failed {
                warn!("write error on dev {}", self.bufs[b].dev);
            }
            self.brelse(b);
            if failed {
                return Err(KError::Io);
            }
        }
        Ok(())
    }

    /// Start a write and release the buffer without waiting.
    pub fn bawrite(&mut self, b: usize) {
        self.bufs[b].flags.insert(BFlags::ASYNC);
        let _ = self.bwrite(b);
    }

    /// Mark the buffer dirty and release it; the contents reach the disk
    /// when the buffer is flushed or reassigned.
    pub fn bdwrite(&mut self, b: usize) {
        self.bufs[b].flags.insert(BFlags::DELWRI | BFlags::DONE);
        self.brelse(b);
    }

    /// Write out every delayed-write buffer for `dev`, or for every
    /// device when given NODEV.
    pub fn bflush(&mut self, dev: Dev) {
        for b in 0..self.sentinel() {
            let bp = &self.bufs[b];
            if bp.flags.contains(BFlags::DELWRI)
                && !bp.flags.contains(BFlags::BUSY)
                && (dev == NODEV || bp.dev == dev)
            {
                self.notavail(b);
                self.bufs[b].flags.insert(BFlags::ASYNC);
                let _ = self.bwrite(b);
            }
        }
    }

    /// Zero the data area.
    pub fn clrbuf(&mut self, b: usize) {
        self.bufs[b].data = [0; BSIZE];
    }

    /// Raw transfer between core and the swap device, bypassing the
    /// cache. `blkno` is absolute on the swap device, `coreaddr` and
    /// `count` are clicks. Used only for process images; a false return
    /// is a swap error the caller turns into a panic.
    pub fn swap(&mut self, blkno: usize, coreaddr: usize, count: usize, read: bool) -> bool {
        let maj = self.swapdev.major();
        if maj >= self.bdevsw.len() {
            panic!("no swap device");
        }
        let mut scratch = Buf::new(self.swapdev);
        let mut blk = blkno;
        let mut click = coreaddr;
        let mut left = count;
        while left > 0 {
            let n = left.min(CLPB);
            scratch.blkno = blk as u32;
            scratch.flags = if read {
                BFlags::BUSY | BFlags::READ
            } else {
                BFlags::BUSY
            };
            if !read {
                let base = click * CLICK;
                scratch.data[..n * CLICK].copy_from_slice(&self.core[base..base + n * CLICK]);
                for byte in scratch.data[n * CLICK..].iter_mut() {
                    *byte = 0;
                }
            }
            self.bdevsw[maj].dev.strategy(&mut scratch);
            if scratch.flags.contains(BFlags::ERROR) {
                return false;
            }
            if read {
                let base = click * CLICK;
                self.core[base..base + n * CLICK].copy_from_slice(&scratch.data[..n * CLICK]);
            }
            blk += 1;
            click += n;
            left -= n;
        }
        true
    }
}

impl<'a> Cpu<'a> {
    /// Get a buffer assigned to (dev, blkno), BUSY and off the free
    /// list, with no promise about its contents. NODEV yields an
    /// anonymous scratch buffer. Sleeps until one can be had.
    pub fn getblk(&mut self, dev: Dev, blkno: u32) -> Result<usize> {
        if dev != NODEV && dev.major() >= self.bdevsw.len() {
            panic!("blkdev");
        }
        'retry: loop {
            if dev != NODEV {
                if let Some(i) = self.incore(dev, blkno) {
                    if self.bufs[i].flags.contains(BFlags::BUSY) {
                        self.bufs[i].flags.insert(BFlags::WANTED);
                        self.sleep(Chan::Buf(i), PRIBIO)?;
                        continue 'retry;
                    }
                    self.notavail(i);
                    return Ok(i);
                }
            }
            let s = self.sentinel();
            let b = self.bufs[s].av_forw;
            if b == s {
                // every buffer is busy
                self.bufs[s].flags.insert(BFlags::WANTED);
                self.sleep(Chan::BFree, PRIBIO)?;
                continue 'retry;
            }
            self.notavail(b);
            if self.bufs[b].flags.contains(BFlags::DELWRI) {
                self.bufs[b].flags.insert(BFlags::ASYNC);
                let _ = self.bwrite(b);
                continue 'retry;
            }
            self.bhash_remove(b);
            self.bufs[b].flags = BFlags::BUSY;
            self.bufs[b].dev = dev;
            self.bufs[b].blkno = blkno;
            self.bhash_insert(b);
            return Ok(b);
        }
    }

    /// Read the block into the cache if it is not already there and
    /// return its buffer, BUSY and valid.
    pub fn bread(&mut self, dev: Dev, blkno: u32) -> Result<usize> {
        let b = self.getblk(dev, blkno)?;
        if self.bufs[b].flags.contains(BFlags::DONE) {
            return Ok(b);
        }
        self.bufs[b].flags.insert(BFlags::READ);
        self.devstart(b);
        if self.bufs[b].flags.contains(BFlags::ERROR) {
            warn!("read error on dev {}", dev);
            self.brelse(b);
            return Err(KError::Io);
        }
        Ok(b)
    }
}
