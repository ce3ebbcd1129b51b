// File system builder.
//
// Lays a fresh, empty file system onto a block device: boot block
// left alone, superblock at block 1, `isize` blocks of zeroed inodes
// with the root directory allocated as inode 1, and every block of
// the data region strung onto the free chain. Writes go straight
// through the device's strategy routine; the kernel proper is not
// involved.

use crate::bio::{BFlags, Buf};
use crate::file::BlockDev;
use crate::fs::{set_word, FileSys, NICFREE, NICINOD};
use crate::inode::{DInode, IALLOC, IFDIR};
use crate::param::{BSIZE, NODEV};

use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes};

type Le16 = U16<LittleEndian>;

fn put(dev: &mut dyn BlockDev, blkno: u16, data: &[u8; BSIZE]) {
    let mut bp = Buf::new(NODEV);
    bp.blkno = blkno as u32;
    bp.flags = BFlags::BUSY;
    bp.data = *data;
    dev.strategy(&mut bp);
    if bp.flags.contains(BFlags::ERROR) {
        panic!("mkfs: write error on block {}", blkno);
    }
}

/// Build a file system of `fsize` blocks with an inode list of
/// `isize` blocks on `dev`.
pub fn mkfs(dev: &mut dyn BlockDev, isize: u16, fsize: u16) {
    assert!(fsize > isize + 2, "mkfs: no data region");

    // inode list, with the root directory in the first slot
    let mut iblk = [0u8; BSIZE];
    let mut root = DInode::new_zeroed();
    root.d_mode = Le16::new(IALLOC | IFDIR | 0o755);
    root.d_nlink = 2;
    iblk[..core::mem::size_of::<DInode>()].copy_from_slice(root.as_bytes());
    put(dev, 2, &iblk);
    let zero = [0u8; BSIZE];
    for b in 1..isize {
        put(dev, 2 + b, &zero);
    }

    // free chain over the data region, built exactly the way the
    // allocator tears it down
    let mut nfree: u16 = 1;
    let mut free = [0u16; NICFREE];
    for bno in (isize + 2)..fsize {
        if nfree as usize >= NICFREE {
            let mut chain = [0u8; BSIZE];
            set_word(&mut chain, 0, nfree);
            for i in 0..NICFREE {
                set_word(&mut chain, 1 + i, free[i]);
            }
            put(dev, bno, &chain);
            nfree = 0;
        }
        free[nfree as usize] = bno;
        nfree += 1;
    }

    // superblock
    let fs = FileSys {
        isize,
        fsize,
        nfree,
        free,
        ninode: 0,
        inode: [0; NICINOD],
        flock: false,
        ilock: false,
        fmod: false,
        ronly: false,
        time: 1,
    };
    let mut sb = [0u8; BSIZE];
    fs.to_block(&mut sb);
    put(dev, 1, &sb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::RamDisk;
    use crate::fs::{word, FileSys};

    fn get(dev: &mut dyn BlockDev, blkno: u16) -> [u8; BSIZE] {
        let mut bp = Buf::new(NODEV);
        bp.blkno = blkno as u32;
        bp.flags = BFlags::BUSY | BFlags::READ;
        dev.strategy(&mut bp);
        assert!(!bp.flags.contains(BFlags::ERROR));
        bp.data
    }

    #[test]
    fn small_fs_has_unchained_free_list() {
        let mut disk = RamDisk::new(64);
        mkfs(&mut disk, 4, 60);
        let fs = FileSys::from_block(&get(&mut disk, 1));
        assert_eq!(fs.isize, 4);
        assert_eq!(fs.fsize, 60);
        // 54 data blocks plus the zero sentinel, no chain block needed
        assert_eq!(fs.nfree, 55);
        assert_eq!(fs.free[0], 0);
        assert_eq!(fs.free[1], 6);
    }

    #[test]
    fn large_fs_spills_into_chain_blocks() {
        let mut disk = RamDisk::new(300);
        mkfs(&mut disk, 10, 300);
        let fs = FileSys::from_block(&get(&mut disk, 1));
        assert!(fs.nfree > 0 && (fs.nfree as usize) <= NICFREE);
        // the bottom of the in-core cache chains to a free-list block
        let chain = fs.free[0];
        assert!(chain >= 12 && chain < 300);
        let blk = get(&mut disk, chain);
        assert_eq!(word(&blk, 0), 100);
    }

    #[test]
    fn root_inode_is_a_directory() {
        let mut disk = RamDisk::new(64);
        mkfs(&mut disk, 4, 60);
        let iblk = get(&mut disk, 2);
        let d = DInode::read_from_prefix(&iblk[..]).unwrap();
        assert_eq!(d.d_mode.get() & IFDIR, IFDIR);
        assert!(d.d_mode.get() & IALLOC != 0);
        assert_eq!(d.d_nlink, 2);
    }
}
