// The open-file layer and the device switch.
//
// Three levels of indirection stand between a file descriptor and the
// data: the per-process descriptor table holds indices into the system
// file table, whose entries carry the open mode and offset and a
// reference to an in-core inode. Descriptors duplicated within a
// process or inherited across a fork land on the same file table
// entry, so they share one offset.
//
// Special files dispatch open and close through one of two switch
// tables indexed by major device number: block devices, which also own
// a strategy routine and a request queue, and character devices.

use crate::bio::{Buf, NIL};
use crate::defs::{KError, Result};
use crate::inode::{IFBLK, IFCHR, IFMT, IREAD, IWRITE};
use crate::kernel::{Cpu, KernelState};
use crate::param::{Dev, BSIZE, NFILE, NOFILE};
use crate::proc::Chan;

use bitflags::bitflags;
use log::warn;

bitflags! {
    pub struct FFlag: u8 {
        const READ  = 0o1;
        const WRITE = 0o2;
        const PIPE  = 0o4;
    }
}

/// System open-file table entry. A zero count marks a free slot.
#[derive(Debug)]
pub struct File {
    pub flag: FFlag,
    pub count: u8,
    /// In-core inode index; holds one inode reference while the entry
    /// is live.
    pub inode: Option<usize>,
    pub offset: u32,
}

impl File {
    pub fn new() -> Self {
        Self {
            flag: FFlag::empty(),
            count: 0,
            inode: None,
            offset: 0,
        }
    }
}

/// Block device interface. The strategy contract is synchronous: the
/// transfer described by the buffer is complete when the call returns,
/// with ERROR set on failure.
pub trait BlockDev: Send {
    fn open(&mut self, _dev: Dev, _flag: u16) -> Result<()> {
        Ok(())
    }
    fn close(&mut self, _dev: Dev, _flag: u16) -> Result<()> {
        Ok(())
    }
    fn strategy(&mut self, bp: &mut Buf);
}

/// Character device interface.
pub trait CharDev: Send {
    fn open(&mut self, _dev: Dev, _flag: u16) -> Result<()> {
        Ok(())
    }
    fn close(&mut self, _dev: Dev, _flag: u16) -> Result<()> {
        Ok(())
    }
    fn read(&mut self, dev: Dev, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, dev: Dev, buf: &[u8]) -> Result<usize>;
    fn sgtty(&mut self, _dev: Dev, _cmd: u16, _arg: u16) -> Result<u16> {
        Err(KError::NoTty)
    }
}

/// Per-block-device bookkeeping: the chain of buffers assigned to the
/// device and the request queue, occupied for the duration of each
/// synchronous transfer.
#[derive(Debug)]
pub struct DevTab {
    pub active: bool,
    pub errcnt: u8,
    /// Head of the buffer chain for this device.
    pub forw: usize,
    /// Buffer currently queued for I/O.
    pub actf: usize,
}

impl DevTab {
    pub fn new() -> Self {
        Self {
            active: false,
            errcnt: 0,
            forw: NIL,
            actf: NIL,
        }
    }
}

pub struct BlockEntry {
    pub dev: Box<dyn BlockDev>,
    pub tab: DevTab,
}

pub struct CharEntry {
    pub dev: Box<dyn CharDev>,
}

/// A block device held entirely in memory. Backs both file systems and
/// swap in tests and demos.
pub struct RamDisk {
    blocks: Vec<u8>,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: vec![0; nblocks * BSIZE],
        }
    }
}

impl BlockDev for RamDisk {
    fn strategy(&mut self, bp: &mut Buf) {
        use crate::bio::BFlags;
        let off = bp.blkno as usize * BSIZE;
        if off + BSIZE > self.blocks.len() {
            bp.flags.insert(BFlags::ERROR);
            return;
        }
        if bp.flags.contains(BFlags::READ) {
            bp.data.copy_from_slice(&self.blocks[off..off + BSIZE]);
        } else {
            self.blocks[off..off + BSIZE].copy_from_slice(&bp.data);
        }
    }
}

impl<'a> Cpu<'a> {
    /// File table entry behind a descriptor of the current process.
    pub fn getf(&mut self, fd: usize) -> Result<usize> {
        if fd >= NOFILE {
            return Err(KError::BadF);
        }
        self.procs[self.p].u.ofile[fd].ok_or(KError::BadF)
    }

    /// First free descriptor slot of the current process.
    pub fn ufalloc(&mut self) -> Result<usize> {
        let u = &self.procs[self.p].u;
        for fd in 0..NOFILE {
            if u.ofile[fd].is_none() {
                return Ok(fd);
            }
        }
        Err(KError::MFile)
    }

    /// Allocate a descriptor and a fresh file table entry wired to it.
    /// A full system table undoes the descriptor allocation.
    pub fn falloc(&mut self) -> Result<(usize, usize)> {
        let fd = self.ufalloc()?;
        for f in 0..NFILE {
            if self.files[f].count == 0 {
                let p = self.p;
                self.procs[p].u.ofile[fd] = Some(f);
                let fp = &mut self.files[f];
                fp.count = 1;
                fp.flag = FFlag::empty();
                fp.inode = None;
                fp.offset = 0;
                return Ok((fd, f));
            }
        }
        warn!("file table overflow");
        let p = self.p;
        self.procs[p].u.ofile[fd] = None;
        Err(KError::NFile)
    }

    /// Dispatch a device open for special files; NXIO for a major
    /// number outside either table.
    pub fn openi(&mut self, ip: usize, flag: FFlag) -> Result<()> {
        let dev = self.inodes[ip].dev;
        let maj = dev.major();
        match self.inodes[ip].mode & IFMT {
            IFCHR => {
                if maj >= self.cdevsw.len() {
                    return Err(KError::NxIo);
                }
                let st: &mut KernelState = &mut *self;
                st.cdevsw[maj].dev.open(dev, flag.bits() as u16)
            }
            IFBLK => {
                if maj >= self.bdevsw.len() {
                    return Err(KError::NxIo);
                }
                let st: &mut KernelState = &mut *self;
                st.bdevsw[maj].dev.open(dev, flag.bits() as u16)
            }
            _ => Ok(()),
        }
    }

    /// Open a referenced inode into a new descriptor. On success the
    /// file table entry takes over the caller's inode reference and the
    /// inode is unlocked; on failure the reference is released.
    pub fn open1(&mut self, ip: usize, flag: FFlag) -> Result<usize> {
        if let Err(e) = self.openi(ip, flag) {
            let _ = self.iput(ip);
            return Err(e);
        }
        let (fd, f) = match self.falloc() {
            Ok(x) => x,
            Err(e) => {
                let _ = self.iput(ip);
                return Err(e);
            }
        };
        self.files[f].flag = flag;
        self.files[f].inode = Some(ip);
        self.prele(ip);
        Ok(fd)
    }

    /// Duplicate a descriptor onto the first free slot; both now share
    /// the same file table entry and offset.
    pub fn dup(&mut self, fd: usize) -> Result<usize> {
        let f = self.getf(fd)?;
        let nfd = self.ufalloc()?;
        let p = self.p;
        self.procs[p].u.ofile[nfd] = Some(f);
        self.files[f].count = self.files[f].count.saturating_add(1);
        Ok(nfd)
    }

    /// Close a descriptor of the current process.
    pub fn close(&mut self, fd: usize) -> Result<()> {
        let f = self.getf(fd)?;
        let p = self.p;
        self.procs[p].u.ofile[fd] = None;
        self.closef(f)
    }

    /// Drop one reference to a file table entry. A pipe wakes both of
    /// its rendezvous channels every time an end goes away; the last
    /// reference closes the inode.
    pub fn closef(&mut self, f: usize) -> Result<()> {
        let flag = self.files[f].flag;
        if flag.contains(FFlag::PIPE) {
            if let Some(ip) = self.files[f].inode {
                self.inodes[ip].mode &= !(IREAD | IWRITE);
                self.wakeup(Chan::PipeR(ip));
                self.wakeup(Chan::PipeW(ip));
            }
        }
        if self.files[f].count <= 1 {
            let r = match self.files[f].inode.take() {
                Some(ip) => self.closei(ip, flag.contains(FFlag::WRITE)),
                None => Ok(()),
            };
            self.files[f].count = 0;
            self.files[f].flag = FFlag::empty();
            r
        } else {
            self.files[f].count -= 1;
            Ok(())
        }
    }

    /// Last-close device dispatch, then release the inode reference.
    pub fn closei(&mut self, ip: usize, wflag: bool) -> Result<()> {
        if self.inodes[ip].count <= 1 {
            let dev = self.inodes[ip].dev;
            let maj = dev.major();
            match self.inodes[ip].mode & IFMT {
                IFCHR => {
                    if maj < self.cdevsw.len() {
                        let st: &mut KernelState = &mut *self;
                        let _ = st.cdevsw[maj].dev.close(dev, wflag as u16);
                    }
                }
                IFBLK => {
                    if maj < self.bdevsw.len() {
                        let st: &mut KernelState = &mut *self;
                        let _ = st.bdevsw[maj].dev.close(dev, wflag as u16);
                    }
                }
                _ => {}
            }
        }
        self.iput(ip)
    }

    /// Read through a descriptor, advancing the shared offset.
    pub fn fread(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let f = self.getf(fd)?;
        if !self.files[f].flag.contains(FFlag::READ) {
            return Err(KError::BadF);
        }
        let ip = self.files[f].inode.ok_or(KError::BadF)?;
        self.plock(ip)?;
        let off = self.files[f].offset;
        let r = self.readi(ip, buf, off);
        self.prele(ip);
        let n = r?;
        self.files[f].offset += n as u32;
        Ok(n)
    }

    /// Write through a descriptor, advancing the shared offset.
    pub fn fwrite(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
        let f = self.getf(fd)?;
        if !self.files[f].flag.contains(FFlag::WRITE) {
            return Err(KError::BadF);
        }
        let ip = self.files[f].inode.ok_or(KError::BadF)?;
        self.plock(ip)?;
        let off = self.files[f].offset;
        let r = self.writei(ip, buf, off);
        self.prele(ip);
        let n = r?;
        self.files[f].offset += n as u32;
        Ok(n)
    }
}
