// In-core inodes.
//
// The inode table caches the on-disk inodes of every active file,
// keyed by (device, i-number). An entry with a zero reference count
// keeps its identity and still satisfies lookups; it is only
// reassigned when some other inode needs the slot. The LOCK flag
// serializes multi-step operations against an inode, with the table
// slot as the sleep channel.
//
// The usual sequence is
//   ip = iget(dev, ino);     // find or read, locked, referenced
//   ... examine and modify ...
//   iput(ip);                // write back and release
// with prele dropping just the lock when a long-term reference is kept
// (an open file, a current directory).

use crate::defs::{KError, Result};
use crate::fs::{set_word, word};
use crate::kernel::{Cpu, KernelState};
use crate::param::{Dev, BSIZE, NODEV, PINOD};
use crate::proc::Chan;

use bitflags::bitflags;
use log::warn;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, Unaligned};

type Le16 = U16<LittleEndian>;

/// Inodes per block.
pub const IPB: usize = BSIZE / core::mem::size_of::<DInode>();

/// Largest file size expressible in the 24-bit size field.
pub const MAXSIZE: u32 = 0x00ff_ffff;

/// Logical blocks reachable through the eight indirect blocks.
const NBLK_LARGE: u32 = 8 * (BSIZE as u32 / 2);

bitflags! {
    pub struct IFlag: u8 {
        /// Inode is locked against concurrent manipulation.
        const LOCK = 0o1;
        /// Inode fields have changed; write back on release.
        const UPD  = 0o2;
        /// Access time must be updated on disk.
        const ACC  = 0o4;
        /// Somebody sleeps on this slot waiting for the lock.
        const WANT = 0o20;
        /// Inode backs an active shared text segment.
        const TEXT = 0o40;
    }
}

// Mode word: type, set-id and permission bits.
pub const IALLOC: u16 = 0o100000;
pub const IFMT: u16 = 0o60000;
pub const IFDIR: u16 = 0o40000;
pub const IFCHR: u16 = 0o20000;
pub const IFBLK: u16 = 0o60000;
pub const ILARG: u16 = 0o10000;
pub const ISUID: u16 = 0o4000;
pub const ISGID: u16 = 0o2000;
pub const ISVTX: u16 = 0o1000;
pub const IREAD: u16 = 0o400;
pub const IWRITE: u16 = 0o200;
pub const IEXEC: u16 = 0o100;

/// On-disk inode layout: 32 bytes, packed little-endian.
#[repr(C)]
#[derive(FromBytes, AsBytes, Unaligned)]
pub struct DInode {
    pub d_mode: Le16,
    pub d_nlink: u8,
    pub d_uid: u8,
    pub d_gid: u8,
    pub d_size0: u8,
    pub d_size1: Le16,
    pub d_addr: [Le16; 8],
    pub d_atime: [Le16; 2],
    pub d_mtime: [Le16; 2],
}

/// Block holding inode `ino`; the inode list starts at block 2.
pub fn iblock(ino: u32) -> u32 {
    2 + (ino - 1) / IPB as u32
}

fn ioffset(ino: u32) -> usize {
    ((ino - 1) as usize % IPB) * core::mem::size_of::<DInode>()
}

#[derive(Debug)]
pub struct Inode {
    pub flag: IFlag,
    pub count: u8,
    pub dev: Dev,
    pub number: u32,
    pub mode: u16,
    pub nlink: u8,
    pub uid: u8,
    pub gid: u8,
    /// 24 bits on disk.
    pub size: u32,
    /// Direct block numbers, or indirect block numbers under ILARG.
    pub addr: [u16; 8],
    /// Last logical block read, for the read-ahead heuristic.
    pub lastr: u32,
}

impl Inode {
    pub fn new() -> Self {
        Self {
            flag: IFlag::empty(),
            count: 0,
            dev: NODEV,
            number: 0,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            addr: [0; 8],
            lastr: 0,
        }
    }
}

impl KernelState {
    /// Drop the lock on an inode and wake anyone queued for it. The
    /// reference count is untouched.
    pub fn prele(&mut self, ip: usize) {
        self.inodes[ip].flag.remove(IFlag::LOCK);
        if self.inodes[ip].flag.contains(IFlag::WANT) {
            self.inodes[ip].flag.remove(IFlag::WANT);
            self.wakeup(Chan::Inode(ip));
        }
    }
}

impl<'a> Cpu<'a> {
    /// Find or create the in-core inode for (dev, ino). Returns the
    /// slot locked, with the reference count raised. A locked match is
    /// waited out and the search restarted.
    pub fn iget(&mut self, dev: Dev, ino: u32) -> Result<usize> {
        loop {
            let mut found = None;
            let mut empty = None;
            for i in 0..self.inodes.len() {
                let ip = &self.inodes[i];
                if ip.dev == dev && ip.number == ino {
                    found = Some(i);
                    break;
                }
                if empty.is_none() && ip.count == 0 {
                    empty = Some(i);
                }
            }
            if let Some(i) = found {
                if self.inodes[i].flag.contains(IFlag::LOCK) {
                    self.inodes[i].flag.insert(IFlag::WANT);
                    self.sleep(Chan::Inode(i), PINOD)?;
                    continue;
                }
                self.inodes[i].count = self.inodes[i].count.saturating_add(1);
                self.inodes[i].flag.insert(IFlag::LOCK);
                return Ok(i);
            }
            let i = match empty {
                Some(i) => i,
                None => {
                    warn!("inode table overflow");
                    return Err(KError::NFile);
                }
            };
            {
                let ip = &mut self.inodes[i];
                ip.dev = dev;
                ip.number = ino;
                ip.flag = IFlag::LOCK;
                ip.count = 1;
                ip.lastr = 0;
            }
            let bp = match self.bread(dev, iblock(ino)) {
                Ok(bp) => bp,
                Err(e) => {
                    let ip = &mut self.inodes[i];
                    ip.count = 0;
                    ip.dev = NODEV;
                    ip.number = 0;
                    ip.flag = IFlag::empty();
                    return Err(e);
                }
            };
            let d = DInode::read_from_prefix(&self.bufs[bp].data[ioffset(ino)..]).unwrap();
            {
                let ip = &mut self.inodes[i];
                ip.mode = d.d_mode.get();
                ip.nlink = d.d_nlink;
                ip.uid = d.d_uid;
                ip.gid = d.d_gid;
                ip.size = ((d.d_size0 as u32) << 16) | d.d_size1.get() as u32;
                for k in 0..8 {
                    ip.addr[k] = d.d_addr[k].get();
                }
            }
            self.brelse(bp);
            return Ok(i);
        }
    }

    /// Release one reference. On the last one a link-free inode gives
    /// its storage back and its number to the free cache, and a
    /// modified inode is written out. The lock is dropped either way.
    pub fn iput(&mut self, ip: usize) -> Result<()> {
        debug_assert!(self.inodes[ip].count > 0);
        let mut r = Ok(());
        if self.inodes[ip].count == 1 {
            self.inodes[ip].flag.insert(IFlag::LOCK);
            if self.inodes[ip].nlink == 0 {
                r = self.itrunc(ip);
                self.inodes[ip].mode = 0;
                self.inodes[ip].flag.insert(IFlag::UPD);
                let (dev, ino) = (self.inodes[ip].dev, self.inodes[ip].number);
                self.ifree(dev, ino);
            }
            r = r.and(self.iupdat(ip));
        }
        self.prele(ip);
        self.inodes[ip].count -= 1;
        r
    }

    /// Lock an inode held by reference, waiting out the current holder.
    pub fn plock(&mut self, ip: usize) -> Result<()> {
        while self.inodes[ip].flag.contains(IFlag::LOCK) {
            self.inodes[ip].flag.insert(IFlag::WANT);
            self.sleep(Chan::Inode(ip), PINOD)?;
        }
        self.inodes[ip].flag.insert(IFlag::LOCK);
        Ok(())
    }

    /// Write the inode back to its disk slot if it is dirty, stamping
    /// whichever times the flags call for.
    pub fn iupdat(&mut self, ip: usize) -> Result<()> {
        if !self.inodes[ip].flag.intersects(IFlag::UPD | IFlag::ACC) {
            return Ok(());
        }
        let dev = self.inodes[ip].dev;
        let fsx = self.getfs(dev);
        if self.fsys(fsx).ronly {
            return Ok(());
        }
        let ino = self.inodes[ip].number;
        let bp = self.bread(dev, iblock(ino))?;
        let off = ioffset(ino);
        let mut d = DInode::read_from_prefix(&self.bufs[bp].data[off..]).unwrap();
        {
            let now = self.time;
            let ipp = &self.inodes[ip];
            d.d_mode = Le16::new(ipp.mode);
            d.d_nlink = ipp.nlink;
            d.d_uid = ipp.uid;
            d.d_gid = ipp.gid;
            d.d_size0 = (ipp.size >> 16) as u8;
            d.d_size1 = Le16::new(ipp.size as u16);
            for k in 0..8 {
                d.d_addr[k] = Le16::new(ipp.addr[k]);
            }
            if ipp.flag.contains(IFlag::ACC) {
                d.d_atime = [Le16::new((now >> 16) as u16), Le16::new(now as u16)];
            }
            if ipp.flag.contains(IFlag::UPD) {
                d.d_mtime = [Le16::new((now >> 16) as u16), Le16::new(now as u16)];
            }
        }
        self.bufs[bp].data[off..off + core::mem::size_of::<DInode>()]
            .copy_from_slice(d.as_bytes());
        self.inodes[ip].flag.remove(IFlag::UPD | IFlag::ACC);
        self.bwrite(bp)
    }

    /// Free every data block of the file, indirect blocks included, and
    /// zero its size. Special files have no storage to give back.
    pub fn itrunc(&mut self, ip: usize) -> Result<()> {
        let mode = self.inodes[ip].mode;
        if mode & IFMT == IFCHR || mode & IFMT == IFBLK {
            return Ok(());
        }
        let dev = self.inodes[ip].dev;
        for i in (0..8).rev() {
            let a = self.inodes[ip].addr[i];
            if a == 0 {
                continue;
            }
            if mode & ILARG != 0 {
                let bp = self.bread(dev, a as u32)?;
                let mut blocks = Vec::new();
                for j in (0..BSIZE / 2).rev() {
                    let w = word(&self.bufs[bp].data, j);
                    if w != 0 {
                        blocks.push(w);
                    }
                }
                self.brelse(bp);
                for w in blocks {
                    self.bfree(dev, w)?;
                }
            }
            self.bfree(dev, a)?;
            self.inodes[ip].addr[i] = 0;
        }
        self.inodes[ip].mode &= !ILARG;
        self.inodes[ip].size = 0;
        self.inodes[ip].flag.insert(IFlag::UPD);
        Ok(())
    }

    /// Disk block holding logical block `bn` of the file. A write maps
    /// missing blocks by allocating them (converting a small file to
    /// indirect form when it outgrows its direct slots); a read of an
    /// unmapped block yields 0, meaning a hole.
    pub fn bmap(&mut self, ip: usize, bn: u32, wr: bool) -> Result<u32> {
        if bn >= NBLK_LARGE {
            return Err(KError::FBig);
        }
        let dev = self.inodes[ip].dev;
        if self.inodes[ip].mode & ILARG == 0 {
            if bn < 8 {
                let a = self.inodes[ip].addr[bn as usize];
                if a != 0 {
                    return Ok(a as u32);
                }
                if !wr {
                    return Ok(0);
                }
                let bp = self.alloc(dev)?;
                let a = self.bufs[bp].blkno as u16;
                self.bdwrite(bp);
                self.inodes[ip].addr[bn as usize] = a;
                self.inodes[ip].flag.insert(IFlag::UPD);
                return Ok(a as u32);
            }
            if !wr {
                return Ok(0);
            }
            // outgrown the direct slots: move them into an indirect block
            let bp = self.alloc(dev)?;
            let nb = self.bufs[bp].blkno as u16;
            let old = self.inodes[ip].addr;
            {
                let data = &mut self.bufs[bp].data;
                for (i, a) in old.iter().enumerate() {
                    set_word(data, i, *a);
                }
            }
            self.bdwrite(bp);
            self.inodes[ip].addr = [0; 8];
            self.inodes[ip].addr[0] = nb;
            self.inodes[ip].mode |= ILARG;
            self.inodes[ip].flag.insert(IFlag::UPD);
        }
        let i = (bn >> 8) as usize;
        let mut ia = self.inodes[ip].addr[i];
        if ia == 0 {
            if !wr {
                return Ok(0);
            }
            let bp = self.alloc(dev)?;
            ia = self.bufs[bp].blkno as u16;
            self.bdwrite(bp);
            self.inodes[ip].addr[i] = ia;
            self.inodes[ip].flag.insert(IFlag::UPD);
        }
        let bp = self.bread(dev, ia as u32)?;
        let j = (bn & 0xff) as usize;
        let mut b = word(&self.bufs[bp].data, j);
        if b == 0 {
            if !wr {
                self.brelse(bp);
                return Ok(0);
            }
            let nbp = self.alloc(dev)?;
            b = self.bufs[nbp].blkno as u16;
            self.bdwrite(nbp);
            set_word(&mut self.bufs[bp].data, j, b);
            self.bdwrite(bp);
        } else {
            self.brelse(bp);
        }
        Ok(b as u32)
    }

    /// Read file contents at `off` into `buf`. Character specials
    /// dispatch to their driver; holes read as zeros.
    pub fn readi(&mut self, ip: usize, buf: &mut [u8], off: u32) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.inodes[ip].flag.insert(IFlag::ACC);
        let dev = self.inodes[ip].dev;
        if self.inodes[ip].mode & IFMT == IFCHR {
            let maj = dev.major();
            if maj >= self.cdevsw.len() {
                return Err(KError::NxIo);
            }
            let st: &mut KernelState = &mut *self;
            return st.cdevsw[maj].dev.read(dev, buf);
        }
        let size = self.inodes[ip].size;
        if off >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - off) as usize);
        let mut tot = 0;
        while tot < n {
            let pos = off as usize + tot;
            let lbn = (pos / BSIZE) as u32;
            self.inodes[ip].lastr = lbn;
            let bn = self.bmap(ip, lbn, false)?;
            let o = pos % BSIZE;
            let m = (BSIZE - o).min(n - tot);
            if bn == 0 {
                for byte in buf[tot..tot + m].iter_mut() {
                    *byte = 0;
                }
            } else {
                let bp = self.bread(dev, bn)?;
                buf[tot..tot + m].copy_from_slice(&self.bufs[bp].data[o..o + m]);
                self.brelse(bp);
            }
            tot += m;
        }
        Ok(tot)
    }

    /// Write `buf` at `off`, allocating blocks as needed and growing
    /// the size. Full-block writes skip the read and go out
    /// asynchronously; partial blocks are delayed writes.
    pub fn writei(&mut self, ip: usize, buf: &[u8], off: u32) -> Result<usize> {
        let dev = self.inodes[ip].dev;
        if self.inodes[ip].mode & IFMT == IFCHR {
            let maj = dev.major();
            if maj >= self.cdevsw.len() {
                return Err(KError::NxIo);
            }
            let st: &mut KernelState = &mut *self;
            return st.cdevsw[maj].dev.write(dev, buf);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if off as u64 + buf.len() as u64 > MAXSIZE as u64 {
            return Err(KError::FBig);
        }
        let n = buf.len();
        let mut tot = 0;
        while tot < n {
            let pos = off as usize + tot;
            let lbn = (pos / BSIZE) as u32;
            let bn = self.bmap(ip, lbn, true)?;
            let o = pos % BSIZE;
            let m = (BSIZE - o).min(n - tot);
            let bp = if m == BSIZE {
                self.getblk(dev, bn)?
            } else {
                self.bread(dev, bn)?
            };
            self.bufs[bp].data[o..o + m].copy_from_slice(&buf[tot..tot + m]);
            if o + m == BSIZE {
                self.bawrite(bp);
            } else {
                self.bdwrite(bp);
            }
            tot += m;
            if (pos + m) as u32 > self.inodes[ip].size {
                self.inodes[ip].size = (pos + m) as u32;
            }
        }
        self.inodes[ip].flag.insert(IFlag::UPD);
        Ok(tot)
    }

    /// Check one of IREAD/IWRITE/IEXEC against the inode for the
    /// current process. Writing needs a writable file system and no
    /// active text; the super-user passes everything except execution
    /// of a file with no execute bit anywhere.
    pub fn access(&mut self, ip: usize, mode: u16) -> Result<()> {
        let mut m = mode;
        if m == IWRITE {
            let dev = self.inodes[ip].dev;
            let fsx = self.getfs(dev);
            if self.fsys(fsx).ronly {
                return Err(KError::RoFs);
            }
            if self.inodes[ip].flag.contains(IFlag::TEXT) {
                return Err(KError::TxtBsy);
            }
        }
        let uid = self.procs[self.p].u.uid;
        if uid == 0 {
            if m == IEXEC && self.inodes[ip].mode & (IEXEC | (IEXEC >> 3) | (IEXEC >> 6)) == 0 {
                return Err(KError::Acces);
            }
            return Ok(());
        }
        if uid != self.inodes[ip].uid {
            m >>= 3;
            if self.procs[self.p].u.gid != self.inodes[ip].gid {
                m >>= 3;
            }
        }
        if self.inodes[ip].mode & m != 0 {
            return Ok(());
        }
        Err(KError::Acces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dinode_is_32_bytes() {
        assert_eq!(core::mem::size_of::<DInode>(), 32);
        assert_eq!(IPB, 16);
    }

    #[test]
    fn inode_blocks_start_at_two() {
        assert_eq!(iblock(1), 2);
        assert_eq!(iblock(16), 2);
        assert_eq!(iblock(17), 3);
        assert_eq!(ioffset(1), 0);
        assert_eq!(ioffset(18), 32);
    }
}
