// File system scenarios: the block allocator against its free chain,
// the buffer cache against turnover, and the inode allocator against
// its hint cache.

mod common;

use common::ROOT;
use kernel::fs::{word, NICFREE, NICINOD};
use kernel::inode::IALLOC;
use kernel::{KError, NODEV};
use pretty_assertions::assert_eq;

#[test]
fn exhausted_free_chain_reports_nospc() {
    let (kern, mut t0) = common::boot(15, 1024);
    kern.with_state(|st| {
        let fs = &mut st.mounts[0].as_mut().unwrap().sb;
        fs.nfree = 1;
        fs.free = [0; NICFREE];
    });
    assert_eq!(t0.alloc(ROOT), Err(KError::NoSpc));
    // the sentinel entry stays put for the next caller to trip over
    let nfree = kern.with_state(|st| st.mounts[0].as_ref().unwrap().sb.nfree);
    assert_eq!(nfree, 1);
}

#[test]
fn freeing_onto_a_full_cache_spills_a_chain_block() {
    let (kern, mut t0) = common::boot(15, 1024);
    let prior: Vec<u16> = (0..NICFREE as u16).map(|i| 12 + i).collect();
    kern.with_state(|st| {
        let fs = &mut st.mounts[0].as_mut().unwrap().sb;
        fs.nfree = NICFREE as u16;
        for (i, &b) in prior.iter().enumerate() {
            fs.free[i] = b;
        }
    });

    t0.bfree(ROOT, 42).unwrap();

    kern.with_state(|st| {
        let fs = &st.mounts[0].as_ref().unwrap().sb;
        assert_eq!(fs.nfree, 1);
        assert_eq!(fs.free[0], 42);
    });
    // block 42 now carries the hundred spilled numbers behind a count
    let bp = t0.bread(ROOT, 42).unwrap();
    kern.with_state(|st| {
        let data = &st.bufs[bp].data;
        assert_eq!(word(data, 0), NICFREE as u16);
        for (i, &b) in prior.iter().enumerate() {
            assert_eq!(word(data, 1 + i), b);
        }
    });
    t0.brelse(bp);
}

#[test]
fn lru_reassigns_the_oldest_buffer() {
    let (_kern, mut t0) = common::boot(3, 1024);
    for bno in [20u32, 21, 22, 23] {
        let b = t0.bread(ROOT, bno).unwrap();
        t0.brelse(b);
    }
    assert!(t0.incore(ROOT, 21).is_some());
    assert!(t0.incore(ROOT, 22).is_some());
    assert!(t0.incore(ROOT, 23).is_some());
    assert!(t0.incore(ROOT, 20).is_none());
}

#[test]
fn delayed_write_survives_cache_turnover() {
    let (kern, mut t0) = common::boot(3, 1024);
    let b = t0.getblk(ROOT, 30).unwrap();
    kern.with_state(|st| st.bufs[b].data[..5].copy_from_slice(b"waite"));
    t0.bdwrite(b);
    // churn every buffer in the pool so the dirty one is written back
    for bno in [31u32, 32, 33, 34] {
        let b = t0.bread(ROOT, bno).unwrap();
        t0.brelse(b);
    }
    assert!(t0.incore(ROOT, 30).is_none());
    let b = t0.bread(ROOT, 30).unwrap();
    kern.with_state(|st| assert_eq!(&st.bufs[b].data[..5], b"waite"));
    t0.brelse(b);
}

#[test]
fn block_alloc_then_free_restores_the_pool() {
    let (kern, mut t0) = common::boot(15, 1024);
    let before = kern.with_state(|st| {
        let fs = &st.mounts[0].as_ref().unwrap().sb;
        (fs.nfree, fs.free)
    });
    let bp = t0.alloc(ROOT).unwrap();
    let bno = kern.with_state(|st| st.bufs[bp].blkno) as u16;
    t0.brelse(bp);
    t0.bfree(ROOT, bno).unwrap();
    let after = kern.with_state(|st| {
        let fs = &st.mounts[0].as_ref().unwrap().sb;
        (fs.nfree, fs.free)
    });
    assert_eq!(after.0, before.0);
    assert_eq!(&after.1[..after.0 as usize], &before.1[..before.0 as usize]);
}

#[test]
fn allocated_blocks_come_back_zeroed_and_in_range() {
    let (kern, mut t0) = common::boot(15, 1024);
    let bp = t0.alloc(ROOT).unwrap();
    let (bno, clean) = kern.with_state(|st| {
        (
            st.bufs[bp].blkno,
            st.bufs[bp].data.iter().all(|&b| b == 0),
        )
    });
    assert!(clean);
    assert!(bno >= (common::ISIZE + 2) as u32 && bno < common::FSIZE as u32);
    t0.brelse(bp);
}

#[test]
fn inode_alloc_scans_and_ifree_restores_the_cache() {
    let (kern, mut t0) = common::boot(15, 1024);
    // the cache starts empty; the first allocation scans the list
    let ip = t0.ialloc(ROOT).unwrap();
    let (ino, ninode) = kern.with_state(|st| {
        (
            st.inodes[ip].number,
            st.mounts[0].as_ref().unwrap().sb.ninode,
        )
    });
    assert_eq!(ninode, NICINOD as u16 - 1);
    assert_eq!(ino, 101); // top of the freshly refilled cache
    assert_eq!(kern.with_state(|st| st.inodes[ip].mode), 0);

    // claim it in core so releasing it does not free disk storage
    kern.with_state(|st| {
        st.inodes[ip].mode = IALLOC | 0o644;
        st.inodes[ip].nlink = 1;
    });
    t0.ifree(ROOT, ino);
    kern.with_state(|st| {
        let fs = &st.mounts[0].as_ref().unwrap().sb;
        assert_eq!(fs.ninode, NICINOD as u16);
        assert_eq!(fs.inode[NICINOD - 1], ino as u16);
    });
    t0.iput(ip).unwrap();
}

#[test]
fn scratch_buffers_come_from_nodev() {
    let (kern, mut t0) = common::boot(15, 1024);
    let b = t0.getblk(NODEV, 0).unwrap();
    kern.with_state(|st| {
        assert!(st.bufs[b].flags.contains(kernel::bio::BFlags::BUSY));
        assert_eq!(st.bufs[b].dev, NODEV);
    });
    t0.brelse(b);
}

#[test]
fn update_writes_back_the_superblock() {
    let (kern, mut t0) = common::boot(15, 1024);
    kern.with_state(|st| {
        let fs = &mut st.mounts[0].as_mut().unwrap().sb;
        fs.fmod = true;
    });
    t0.update().unwrap();
    kern.with_state(|st| assert!(!st.mounts[0].as_ref().unwrap().sb.fmod));
    // the on-disk copy agrees with the in-core sizes
    let bp = t0.bread(ROOT, 1).unwrap();
    kern.with_state(|st| {
        let data = &st.bufs[bp].data;
        assert_eq!(word(data, 0), common::ISIZE);
        assert_eq!(word(data, 1), common::FSIZE);
    });
    t0.brelse(bp);
}

#[test]
#[should_panic(expected = "no fs")]
fn unmounted_device_is_fatal() {
    let (_kern, mut t0) = common::boot(15, 1024);
    let _ = t0.alloc(kernel::Dev::new(0, 9));
}
