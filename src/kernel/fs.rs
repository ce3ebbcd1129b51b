// File system metadata: the in-core superblock and the two allocators
// layered on the buffer cache.
//
//   - Blocks: a pool of free block numbers cached in the superblock,
//     chained on disk through free-list blocks of 100 numbers each.
//   - Inodes: a cache of free i-numbers in the superblock, refilled by
//     scanning the on-disk inode list.
//
// The superblock lives at block 1 of every file system. Its two lock
// bytes guard the multi-step cache refill/spill sequences, using the
// lock itself as the sleep channel.

use crate::defs::{KError, Result};
use crate::inode::{IFlag, IPB};
use crate::kernel::{Cpu, KernelState};
use crate::param::{Dev, NODEV, PINOD};
use crate::proc::Chan;

use log::warn;

/// Entries in the in-core free caches.
pub const NICFREE: usize = 100;
pub const NICINOD: usize = 100;

// On-disk superblock layout, 416 bytes of block 1: sizes, the two
// free caches behind their counts, four flag bytes, and a split
// timestamp. All multi-byte fields are 16-bit little-endian words.
const SB_ISIZE: usize = 0;
const SB_FSIZE: usize = 1;
const SB_NFREE: usize = 2;
const SB_FREE: usize = 3;
const SB_NINODE: usize = SB_FREE + NICFREE;
const SB_INODE: usize = SB_NINODE + 1;
const SB_FLAGS: usize = 2 * (SB_INODE + NICINOD);
const SB_TIME: usize = SB_FLAGS + 4;
pub const SBSIZE: usize = SB_TIME + 4;

/// In-core superblock of a mounted file system.
#[derive(Debug, Clone)]
pub struct FileSys {
    /// Size of the inode list in blocks.
    pub isize: u16,
    /// Size of the whole file system in blocks.
    pub fsize: u16,
    pub nfree: u16,
    pub free: [u16; NICFREE],
    pub ninode: u16,
    pub inode: [u16; NICINOD],
    /// Free-list manipulation lock; doubles as a sleep channel.
    pub flock: bool,
    /// Inode-cache refill lock; doubles as a sleep channel.
    pub ilock: bool,
    pub fmod: bool,
    pub ronly: bool,
    pub time: u32,
}

impl FileSys {
    /// Decode the superblock from a block image.
    pub fn from_block(data: &[u8]) -> Self {
        let mut fs = FileSys {
            isize: word(data, SB_ISIZE),
            fsize: word(data, SB_FSIZE),
            nfree: word(data, SB_NFREE),
            free: [0; NICFREE],
            ninode: word(data, SB_NINODE),
            inode: [0; NICINOD],
            flock: data[SB_FLAGS] != 0,
            ilock: data[SB_FLAGS + 1] != 0,
            fmod: data[SB_FLAGS + 2] != 0,
            ronly: data[SB_FLAGS + 3] != 0,
            time: ((word(data, SB_TIME / 2) as u32) << 16)
                | word(data, SB_TIME / 2 + 1) as u32,
        };
        for i in 0..NICFREE {
            fs.free[i] = word(data, SB_FREE + i);
        }
        for i in 0..NICINOD {
            fs.inode[i] = word(data, SB_INODE + i);
        }
        fs
    }

    /// Encode the superblock into a block image.
    pub fn to_block(&self, data: &mut [u8]) {
        set_word(data, SB_ISIZE, self.isize);
        set_word(data, SB_FSIZE, self.fsize);
        set_word(data, SB_NFREE, self.nfree);
        for i in 0..NICFREE {
            set_word(data, SB_FREE + i, self.free[i]);
        }
        set_word(data, SB_NINODE, self.ninode);
        for i in 0..NICINOD {
            set_word(data, SB_INODE + i, self.inode[i]);
        }
        data[SB_FLAGS] = self.flock as u8;
        data[SB_FLAGS + 1] = self.ilock as u8;
        data[SB_FLAGS + 2] = self.fmod as u8;
        data[SB_FLAGS + 3] = self.ronly as u8;
        set_word(data, SB_TIME / 2, (self.time >> 16) as u16);
        set_word(data, SB_TIME / 2 + 1, self.time as u16);
    }
}

/// Mount table entry.
#[derive(Debug)]
pub struct Mount {
    pub dev: Dev,
    pub sb: FileSys,
    /// Inode mounted on, unused for the root file system.
    pub inodp: Option<usize>,
}

/// 16-bit little-endian word `i` of a block image; the free-list chain
/// blocks are arrays of these.
pub fn word(data: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([data[2 * i], data[2 * i + 1]])
}

pub fn set_word(data: &mut [u8], i: usize, v: u16) {
    data[2 * i..2 * i + 2].copy_from_slice(&v.to_le_bytes());
}

impl KernelState {
    /// Mount slot for a device. Every caller is on a path where the
    /// device is known mounted; a miss is a broken invariant.
    pub fn getfs(&mut self, dev: Dev) -> usize {
        for (i, m) in self.mounts.iter_mut().enumerate() {
            if let Some(m) = m {
                if m.dev == dev {
                    let fs = &mut m.sb;
                    if fs.nfree as usize > NICFREE || fs.ninode as usize > NICINOD {
                        warn!("bad count in superblock of dev {}", dev);
                        fs.nfree = 0;
                        fs.free[0] = 0;
                        fs.ninode = 0;
                        fs.inode[0] = 0;
                        fs.fmod = true;
                    }
                    return i;
                }
            }
        }
        panic!("no fs");
    }

    /// Shorthand for the superblock in a mount slot.
    pub fn fsys(&mut self, fsx: usize) -> &mut FileSys {
        &mut self.mounts[fsx].as_mut().expect("no fs").sb
    }

    /// Is `bno` outside the data region of the file system?
    pub fn badblock(&mut self, fsx: usize, bno: u16, dev: Dev) -> bool {
        let fs = self.fsys(fsx);
        if bno < fs.isize + 2 || bno >= fs.fsize {
            warn!("bad block {} on dev {}", bno, dev);
            return true;
        }
        false
    }

    /// Drop a freed i-number into the superblock cache if there is room
    /// and the cache is not being refilled; otherwise lose the hint, a
    /// later scan will rediscover it.
    pub fn ifree(&mut self, dev: Dev, ino: u32) {
        let fsx = self.getfs(dev);
        let fs = self.fsys(fsx);
        if fs.ilock {
            return;
        }
        if fs.ninode as usize >= NICINOD {
            return;
        }
        let n = fs.ninode as usize;
        fs.inode[n] = ino as u16;
        fs.ninode += 1;
        fs.fmod = true;
    }
}

impl<'a> Cpu<'a> {
    /// Read the root superblock into mount slot 0. Called once at boot.
    pub(crate) fn iinit(&mut self) -> Result<()> {
        let dev = self.rootdev;
        let bp = self.bread(dev, 1)?;
        let mut sb = FileSys::from_block(&self.bufs[bp].data);
        self.brelse(bp);
        sb.flock = false;
        sb.ilock = false;
        sb.ronly = false;
        self.mounts[0] = Some(Mount {
            dev,
            sb,
            inodp: None,
        });
        Ok(())
    }

    /// Allocate a free block on `dev` and hand back its buffer, zeroed.
    ///
    /// The in-core cache supplies block numbers until it empties; the
    /// number that empties it names the disk block holding the next 100
    /// free blocks, which is ingested before the block itself is
    /// reused. A zero number at the bottom means the chain is finished
    /// and the file system is full.
    pub fn alloc(&mut self, dev: Dev) -> Result<usize> {
        let fsx = self.getfs(dev);
        while self.fsys(fsx).flock {
            self.sleep(Chan::FLock(fsx), PINOD)?;
        }
        let bno = loop {
            let bno = {
                let fs = self.fsys(fsx);
                if fs.nfree == 0 {
                    warn!("no space on dev {}", dev);
                    return Err(KError::NoSpc);
                }
                fs.nfree -= 1;
                let bno = fs.free[fs.nfree as usize];
                if bno == 0 {
                    fs.nfree += 1;
                    warn!("no space on dev {}", dev);
                    return Err(KError::NoSpc);
                }
                bno
            };
            if !self.badblock(fsx, bno, dev) {
                break bno;
            }
        };
        if self.fsys(fsx).nfree == 0 {
            self.fsys(fsx).flock = true;
            let r = self.bread(dev, bno as u32);
            let bp = match r {
                Ok(bp) => bp,
                Err(e) => {
                    self.fsys(fsx).flock = false;
                    self.wakeup(Chan::FLock(fsx));
                    return Err(e);
                }
            };
            let mut n = word(&self.bufs[bp].data, 0);
            if n as usize > NICFREE {
                warn!("corrupt free list on dev {}", dev);
                n = 0;
            }
            for i in 0..n as usize {
                let w = word(&self.bufs[bp].data, 1 + i);
                self.fsys(fsx).free[i] = w;
            }
            self.fsys(fsx).nfree = n;
            self.brelse(bp);
            self.fsys(fsx).flock = false;
            self.wakeup(Chan::FLock(fsx));
        }
        let bp = self.getblk(dev, bno as u32)?;
        self.clrbuf(bp);
        self.fsys(fsx).fmod = true;
        Ok(bp)
    }

    /// Return block `bno` to the free pool of `dev`. When the in-core
    /// cache is already full its hundred numbers are written out to the
    /// block being freed, which becomes the new head of the chain.
    pub fn bfree(&mut self, dev: Dev, bno: u16) -> Result<()> {
        let fsx = self.getfs(dev);
        self.fsys(fsx).fmod = true;
        while self.fsys(fsx).flock {
            self.sleep(Chan::FLock(fsx), PINOD)?;
        }
        if self.badblock(fsx, bno, dev) {
            return Ok(());
        }
        if self.fsys(fsx).nfree as usize >= NICFREE {
            self.fsys(fsx).flock = true;
            let r = self.getblk(dev, bno as u32);
            let bp = match r {
                Ok(bp) => bp,
                Err(e) => {
                    self.fsys(fsx).flock = false;
                    self.wakeup(Chan::FLock(fsx));
                    return Err(e);
                }
            };
            let (nfree, free) = {
                let fs = self.fsys(fsx);
                (fs.nfree, fs.free)
            };
            {
                let data = &mut self.bufs[bp].data;
                set_word(data, 0, nfree);
                for i in 0..NICFREE {
                    set_word(data, 1 + i, free[i]);
                }
            }
            self.fsys(fsx).nfree = 0;
            let r = self.bwrite(bp);
            self.fsys(fsx).flock = false;
            self.wakeup(Chan::FLock(fsx));
            r?;
        }
        let fs = self.fsys(fsx);
        let n = fs.nfree as usize;
        fs.free[n] = bno;
        fs.nfree += 1;
        fs.fmod = true;
        Ok(())
    }

    /// Allocate a free inode on `dev`: locked, referenced, mode zero.
    ///
    /// Numbers come from the superblock cache but are only hints; one
    /// that turns out busy on disk is dropped and the next one tried.
    /// An empty cache is refilled by scanning the inode list for
    /// numbers free on disk and not held in core.
    pub fn ialloc(&mut self, dev: Dev) -> Result<usize> {
        let fsx = self.getfs(dev);
        while self.fsys(fsx).ilock {
            self.sleep(Chan::ILock(fsx), PINOD)?;
        }
        loop {
            if self.fsys(fsx).ninode > 0 {
                let ino = {
                    let fs = self.fsys(fsx);
                    fs.ninode -= 1;
                    fs.inode[fs.ninode as usize]
                };
                let ip = match self.iget(dev, ino as u32) {
                    Ok(ip) => ip,
                    Err(e) => {
                        let fs = self.fsys(fsx);
                        let n = fs.ninode as usize;
                        fs.inode[n] = ino;
                        fs.ninode += 1;
                        return Err(e);
                    }
                };
                if self.inodes[ip].mode == 0 {
                    self.inodes[ip].addr = [0; 8];
                    self.fsys(fsx).fmod = true;
                    return Ok(ip);
                }
                // stale hint: somebody claimed it since the cache was filled
                warn!("busy inode {} on dev {}", ino, dev);
                self.iput(ip)?;
                continue;
            }
            // refill by scanning the inode list
            self.fsys(fsx).ilock = true;
            let nlist = self.fsys(fsx).isize as u32;
            let mut ino: u32 = 0;
            'scan: for blk in 0..nlist {
                let bp = match self.bread(dev, blk + 2) {
                    Ok(bp) => bp,
                    Err(e) => {
                        self.fsys(fsx).ilock = false;
                        self.wakeup(Chan::ILock(fsx));
                        return Err(e);
                    }
                };
                for j in 0..IPB {
                    ino += 1;
                    let mode = word(&self.bufs[bp].data, j * 16);
                    if mode != 0 {
                        continue;
                    }
                    if self
                        .inodes
                        .iter()
                        .any(|ip| ip.count > 0 && ip.dev == dev && ip.number == ino)
                    {
                        continue;
                    }
                    let fs = self.fsys(fsx);
                    if (fs.ninode as usize) < NICINOD {
                        let n = fs.ninode as usize;
                        fs.inode[n] = ino as u16;
                        fs.ninode += 1;
                    } else {
                        self.brelse(bp);
                        break 'scan;
                    }
                }
                self.brelse(bp);
                if self.fsys(fsx).ninode as usize >= NICINOD {
                    break;
                }
            }
            self.fsys(fsx).ilock = false;
            self.wakeup(Chan::ILock(fsx));
            if self.fsys(fsx).ninode == 0 {
                warn!("out of inodes on dev {}", dev);
                return Err(KError::NoSpc);
            }
        }
    }

    /// Write every piece of modified metadata back to disk: superblocks
    /// with fresh timestamps, referenced inodes, then all delayed
    /// writes.
    pub fn update(&mut self) -> Result<()> {
        if self.updlock {
            return Ok(());
        }
        self.updlock = true;
        for fsx in 0..self.mounts.len() {
            let snap = match &self.mounts[fsx] {
                Some(m)
                    if m.sb.fmod && !m.sb.ilock && !m.sb.flock && !m.sb.ronly =>
                {
                    (m.dev, {
                        let mut sb = m.sb.clone();
                        sb.fmod = false;
                        sb.time = self.time;
                        sb
                    })
                }
                _ => continue,
            };
            let (dev, sb) = snap;
            {
                let fs = self.fsys(fsx);
                fs.fmod = false;
                fs.time = sb.time;
            }
            let bp = self.getblk(dev, 1)?;
            self.clrbuf(bp);
            sb.to_block(&mut self.bufs[bp].data);
            self.bwrite(bp)?;
        }
        for ip in 0..self.inodes.len() {
            if self.inodes[ip].count > 0 && !self.inodes[ip].flag.contains(IFlag::LOCK) {
                self.inodes[ip].flag.insert(IFlag::LOCK);
                self.iupdat(ip)?;
                self.prele(ip);
            }
        }
        self.updlock = false;
        self.bflush(NODEV);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::BSIZE;

    #[test]
    fn superblock_fits_in_a_block() {
        assert_eq!(SBSIZE, 416);
        assert!(SBSIZE <= BSIZE);
    }

    #[test]
    fn superblock_round_trips_through_a_block() {
        let mut fs = FileSys {
            isize: 10,
            fsize: 200,
            nfree: 2,
            free: [0; NICFREE],
            ninode: 1,
            inode: [0; NICINOD],
            flock: false,
            ilock: true,
            fmod: true,
            ronly: false,
            time: 0x0102_0304,
        };
        fs.free[0] = 33;
        fs.free[1] = 34;
        fs.inode[0] = 7;
        let mut blk = [0u8; BSIZE];
        fs.to_block(&mut blk);
        let back = FileSys::from_block(&blk);
        assert_eq!(back.isize, 10);
        assert_eq!(back.fsize, 200);
        assert_eq!(back.nfree, 2);
        assert_eq!(back.free[1], 34);
        assert_eq!(back.ninode, 1);
        assert_eq!(back.inode[0], 7);
        assert!(back.fmod && back.ilock);
        assert!(!back.flock && !back.ronly);
        assert_eq!(back.time, 0x0102_0304);
    }

    #[test]
    fn flag_bytes_sit_behind_the_caches() {
        let mut fs = FileSys::from_block(&[0u8; BSIZE]);
        fs.fmod = true;
        let mut blk = [0u8; BSIZE];
        fs.to_block(&mut blk);
        assert_eq!(blk[410], 1); // s_fmod
        assert_eq!(blk[408], 0); // s_flock
    }

    #[test]
    fn words_are_little_endian() {
        let mut blk = [0u8; 8];
        set_word(&mut blk, 1, 0x1234);
        assert_eq!(blk[2], 0x34);
        assert_eq!(blk[3], 0x12);
        assert_eq!(word(&blk, 1), 0x1234);
    }
}
