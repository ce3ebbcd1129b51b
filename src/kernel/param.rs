// System-wide tunables and fundamental constants.
//
// The table sizes here are the compiled-in defaults; the buffer pool
// size and the amount of simulated core are overridable through
// kernel::Config, everything else is fixed at build time.

/// Default number of buffers in the block cache.
pub const NBUF: usize = 15;
/// Number of in-core inodes.
pub const NINODE: usize = 100;
/// Number of entries in the system open file table.
pub const NFILE: usize = 100;
/// Maximum number of mounted file systems.
pub const NMOUNT: usize = 5;
/// Maximum number of open files per process.
pub const NOFILE: usize = 15;
/// Maximum number of processes.
pub const NPROC: usize = 50;
/// Maximum number of shared text segments.
pub const NTEXT: usize = 20;
/// Default core memory size in clicks.
pub const MAXMEM: usize = 32 * 32;
/// Initial stack size for user processes, in clicks.
pub const SSIZE: usize = 20;

/// Block size in bytes, the unit of disk transfer.
pub const BSIZE: usize = 512;
/// Click size in bytes, the unit of core allocation. Orthogonal to BSIZE.
pub const CLICK: usize = 64;
/// Clicks per block; swap I/O moves one block of clicks at a time.
pub const CLPB: usize = BSIZE / CLICK;
/// Size of the per-process u-area in clicks, part of every process image.
pub const USIZE: usize = 16;

/// I-number of the root directory.
pub const ROOTINO: u32 = 1;
/// Maximum length of a directory name component.
pub const DIRSIZ: usize = 14;

// Scheduling priorities. Lower numeric value is stronger; a negative
// priority makes a sleep uninterruptible by signals.
pub const PSWP: i16 = -100;
pub const PINOD: i16 = -90;
pub const PRIBIO: i16 = -50;
pub const PPIPE: i16 = 1;
pub const PWAIT: i16 = 40;
pub const PSLEP: i16 = 90;
pub const PUSER: i16 = 100;

// Signal numbers.
pub const NSIG: usize = 13;
pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQIT: u8 = 3;
pub const SIGINS: u8 = 4;
pub const SIGTRC: u8 = 5;
pub const SIGIOT: u8 = 6;
pub const SIGEMT: u8 = 7;
pub const SIGFPT: u8 = 8;
pub const SIGKIL: u8 = 9;
pub const SIGBUS: u8 = 10;
pub const SIGSEG: u8 = 11;
pub const SIGSYS: u8 = 12;

/// Device number: major in the high byte, minor in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dev(pub u16);

/// The "no device" sentinel used by the buffer cache and mount table.
pub const NODEV: Dev = Dev(u16::MAX);

impl Dev {
    pub const fn new(major: u8, minor: u8) -> Self {
        Dev(((major as u16) << 8) | minor as u16)
    }

    pub fn major(self) -> usize {
        (self.0 >> 8) as usize
    }

    pub fn minor(self) -> usize {
        (self.0 & 0xff) as usize
    }
}

impl core::fmt::Display for Dev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.major(), self.minor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_split() {
        let d = Dev::new(3, 7);
        assert_eq!(d.major(), 3);
        assert_eq!(d.minor(), 7);
        assert_eq!(NODEV.major(), 0xff);
    }

    #[test]
    fn clicks_per_block() {
        assert_eq!(CLPB, 8);
    }
}
