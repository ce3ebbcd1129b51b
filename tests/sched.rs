// Process scenarios: the sleep/wakeup rendezvous, priority dispatch,
// descriptor inheritance across fork, the fork-onto-swap path with the
// swapper, address space establishment, permissions, and pipe close.

mod common;

use common::ROOT;
use kernel::inode::{IALLOC, IEXEC, IREAD, IWRITE};
use kernel::param::{NOFILE, PRIBIO, PSLEP, SIGINT};
use kernel::proc::{PFlag, PStat};
use kernel::{Chan, FFlag, KError};
use std::sync::mpsc;
use std::sync::Arc;

#[test]
fn sleep_then_wakeup_transitions_exactly_once() {
    let (kern, mut t0) = common::boot(15, 1024);
    let pid = t0
        .newproc(|t| {
            let _ = t.sleep(Chan::User(1), PRIBIO);
        })
        .unwrap();
    t0.yielding(); // the child runs until it sleeps
    let slot = common::find_slot(&kern, pid);
    kern.with_state(|st| {
        assert_eq!(st.procs[slot].stat, PStat::Wait);
        assert_eq!(st.procs[slot].wchan, Some(Chan::User(1)));
        assert_eq!(st.procs[slot].pri, PRIBIO);
    });

    t0.wakeup(Chan::User(1));
    kern.with_state(|st| {
        assert_eq!(st.procs[slot].stat, PStat::Run);
        assert!(st.procs[slot].wchan.is_none());
        assert!(st.runrun);
    });
    // a second wakeup finds nobody on the channel
    t0.wakeup(Chan::User(1));
    kern.with_state(|st| assert_eq!(st.procs[slot].stat, PStat::Run));

    t0.waitc().unwrap();
}

#[test]
fn second_getblk_waits_for_brelse() {
    let (kern, mut t0) = common::boot(15, 1024);
    let dev = kernel::Dev(0x0100);
    let (tx, rx) = mpsc::channel::<&'static str>();

    let ka = Arc::clone(&kern);
    let txa = tx.clone();
    t0.newproc(move |t| {
        let b = t.getblk(dev, 5).unwrap();
        ka.with_state(|st| st.bufs[b].data[..4].copy_from_slice(b"unix"));
        txa.send("a-holds").unwrap();
        t.yielding(); // give the second process its chance to block
        t.brelse(b);
        txa.send("a-released").unwrap();
    })
    .unwrap();

    let kb = Arc::clone(&kern);
    let txb = tx.clone();
    t0.newproc(move |t| {
        let b = t.getblk(dev, 5).unwrap(); // sleeps on the buffer
        let same = kb.with_state(|st| &st.bufs[b].data[..4] == b"unix");
        assert!(same, "second holder sees the first one's bytes");
        t.brelse(b);
        txb.send("b-got").unwrap();
    })
    .unwrap();

    t0.waitc().unwrap();
    t0.waitc().unwrap();
    let order: Vec<_> = rx.try_iter().collect();
    assert_eq!(order, vec!["a-holds", "a-released", "b-got"]);
}

#[test]
fn swtch_prefers_the_strongest_priority() {
    let (kern, mut t0) = common::boot(15, 1024);
    let (tx, rx) = mpsc::channel::<&'static str>();

    let tx3 = tx.clone();
    let p3 = t0
        .newproc(move |t| {
            // parks early; pri 40 is assigned by the sleep itself
            let _ = t.sleep(Chan::User(7), 40);
            tx3.send("P3").unwrap();
        })
        .unwrap();
    let tx1 = tx.clone();
    let p1 = t0
        .newproc(move |t| {
            tx1.send("P1").unwrap();
            t.wakeup(Chan::User(7));
            t.yielding();
        })
        .unwrap();
    let tx2 = tx.clone();
    let p2 = t0.newproc(move |t| tx2.send("P2").unwrap()).unwrap();

    let (s1, s2, s3) = (
        common::find_slot(&kern, p1),
        common::find_slot(&kern, p2),
        common::find_slot(&kern, p3),
    );
    kern.with_state(|st| {
        st.procs[s1].pri = 60;
        st.procs[s2].pri = 80;
        st.procs[s3].pri = 10; // so the sleeper gets to park first
    });

    for _ in 0..3 {
        t0.waitc().unwrap();
    }
    let order: Vec<_> = rx.try_iter().collect();
    // P1 beats P2; the woken P3 then beats the yielding P1
    assert_eq!(order, vec!["P1", "P3", "P2"]);
}

#[test]
fn fork_bumps_every_inherited_descriptor() {
    let (kern, mut t0) = common::boot(15, 1024);
    let ip = t0.ialloc(ROOT).unwrap();
    kern.with_state(|st| {
        st.inodes[ip].mode = IALLOC | 0o644;
        st.inodes[ip].nlink = 1;
    });
    let fd0 = t0.open1(ip, FFlag::READ | FFlag::WRITE).unwrap();
    t0.fwrite(fd0, b"abcdefgh").unwrap();
    let f = kern.with_state(|st| st.procs[0].u.ofile[fd0].unwrap());
    kern.with_state(|st| st.files[f].offset = 0);

    let fd1 = t0.dup(fd0).unwrap();
    assert_eq!(kern.with_state(|st| st.files[f].count), 2);

    let (tx, rx) = mpsc::channel();
    let ka = Arc::clone(&kern);
    t0.newproc(move |t| {
        let count = ka.with_state(|st| st.files[f].count);
        let mut buf = [0u8; 4];
        let n = t.fread(fd0, &mut buf).unwrap();
        let off = ka.with_state(|st| st.files[f].offset);
        tx.send((count, n, buf, off)).unwrap();
    })
    .unwrap();
    // one increment per inherited descriptor
    assert_eq!(kern.with_state(|st| st.files[f].count), 4);

    t0.close(fd0).unwrap();
    t0.close(fd1).unwrap();
    assert_eq!(kern.with_state(|st| st.files[f].count), 2);

    t0.waitc().unwrap();
    let (count, n, buf, off) = rx.recv().unwrap();
    assert_eq!(count, 2); // the child saw the entry outlive the parent's close
    assert_eq!(n, 4);
    assert_eq!(&buf, b"abcd");
    assert_eq!(off, 4); // the shared offset moved

    // the child's exit closed the last descriptors
    kern.with_state(|st| {
        assert_eq!(st.files[f].count, 0);
        assert_eq!(st.inodes[ip].count, 0);
    });
}

#[test]
fn fork_without_core_lands_on_swap_and_comes_back() {
    let (kern, mut t0) = common::boot(15, 64);
    // fill core: process 0 plus three 16-click residents
    for i in 0..3u32 {
        t0.newproc(move |t| {
            let _ = t.sleep(Chan::User(100 + i as usize), PRIBIO);
        })
        .unwrap();
    }
    t0.yielding(); // cascade: each filler runs to its sleep
    kern.with_state(|st| assert_eq!(st.coremap.total_free(), 0));

    let ka = Arc::clone(&kern);
    let (tx, rx) = mpsc::channel();
    let bpid = t0
        .newproc(move |t| {
            // this very first statement already needed a swap-in
            let me = t.slot();
            let flags = ka.with_state(|st| st.procs[me].flag);
            tx.send(flags).unwrap();
            ka.halt();
        })
        .unwrap();

    let bslot = common::find_slot(&kern, bpid);
    kern.with_state(|st| {
        let b = &st.procs[bslot];
        assert_eq!(b.stat, PStat::Run);
        assert!(!b.flag.contains(PFlag::LOAD), "no core behind the child");
        assert!(b.flag.contains(PFlag::SWAP));
        assert!(b.addr != 0, "image parked at a swap address");
        assert!(b.addr >= st.swplo && b.addr < st.swplo + st.nswap);
    });

    // process 0 turns swapper: evicts a waiting filler, loads the child
    t0.sched();

    let flags = rx.recv().unwrap();
    assert!(flags.contains(PFlag::LOAD));
    assert!(!flags.contains(PFlag::SWAP), "swap frame consumed at dispatch");
    let evicted = kern.with_state(|st| {
        st.procs
            .iter()
            .filter(|p| p.stat == PStat::Wait && !p.flag.contains(PFlag::LOAD))
            .count()
    });
    assert_eq!(evicted, 1, "one resident sleeper paid for the swap-in");
    t0.waitc().unwrap();
}

#[test]
fn estabur_rejects_more_than_eight_segments() {
    let (_kern, mut t0) = common::boot(15, 1024);
    assert_eq!(t0.estabur(8 * 128 + 1, 0, 0), Err(KError::NoMem));
    assert_eq!(t0.estabur(0, 8 * 128 + 1, 0), Err(KError::NoMem));
    assert_eq!(t0.estabur(0, 0, 8 * 128 + 1), Err(KError::NoMem));
    assert_eq!(t0.estabur(512, 512, 1), Err(KError::NoMem));
}

#[test]
fn estabur_lays_out_text_data_and_stack() {
    use kernel::vm::{ED, RO, RW};
    let (kern, mut t0) = common::boot(15, 1024);
    t0.estabur(10, 20, 30).unwrap();
    kern.with_state(|st| {
        let u = &st.procs[0].u;
        assert_eq!(u.uisa[0], 0);
        assert_eq!(u.uisd[0], (9 << 8) | RO);
        assert_eq!(u.uisa[1], kernel::USIZE as u16);
        assert_eq!(u.uisd[1], (19 << 8) | RW);
        assert_eq!(u.uisa[7], (8 * 128 - 30) as u16);
        assert_eq!(u.uisd[7], ((128 - 30) << 8) | RW | ED);
        for i in 2..7 {
            assert_eq!(u.uisd[i], 0);
        }
    });
}

#[test]
fn superuser_passes_everything_but_exec_on_mode_zero() {
    let (kern, mut t0) = common::boot(15, 1024);
    let ip = t0.ialloc(ROOT).unwrap();
    kern.with_state(|st| {
        st.inodes[ip].mode = IALLOC; // no permission bits anywhere
        st.inodes[ip].nlink = 1;
    });
    assert_eq!(t0.access(ip, IREAD), Ok(()));
    assert_eq!(t0.access(ip, IWRITE), Ok(()));
    assert_eq!(t0.access(ip, IEXEC), Err(KError::Acces));

    // an ordinary user is turned away entirely
    kern.with_state(|st| st.procs[0].u.uid = 5);
    assert_eq!(t0.access(ip, IREAD), Err(KError::Acces));
    kern.with_state(|st| st.procs[0].u.uid = 0);
    t0.iput(ip).unwrap();
}

#[test]
fn last_pipe_close_wakes_reader_and_writer() {
    let (kern, mut t0) = common::boot(15, 1024);
    let ip = t0.ialloc(ROOT).unwrap();
    kern.with_state(|st| {
        st.inodes[ip].mode = IALLOC | IREAD | IWRITE;
        st.inodes[ip].nlink = 0; // pipes are born unlinked
    });
    let fd = t0
        .open1(ip, FFlag::READ | FFlag::WRITE | FFlag::PIPE)
        .unwrap();

    let (tx, rx) = mpsc::channel::<&'static str>();
    let txr = tx.clone();
    let rpid = t0
        .newproc(move |t| {
            let _ = t.sleep(Chan::PipeR(ip), PRIBIO);
            txr.send("reader").unwrap();
        })
        .unwrap();
    let txw = tx.clone();
    let wpid = t0
        .newproc(move |t| {
            let _ = t.sleep(Chan::PipeW(ip), PRIBIO);
            txw.send("writer").unwrap();
        })
        .unwrap();
    t0.yielding(); // both ends park on their channels
    let (rs, ws) = (
        common::find_slot(&kern, rpid),
        common::find_slot(&kern, wpid),
    );
    kern.with_state(|st| {
        assert_eq!(st.procs[rs].stat, PStat::Wait);
        assert_eq!(st.procs[ws].stat, PStat::Wait);
    });

    t0.close(fd).unwrap();

    kern.with_state(|st| {
        assert_eq!(st.procs[rs].stat, PStat::Run);
        assert_eq!(st.procs[ws].stat, PStat::Run);
    });
    t0.waitc().unwrap();
    t0.waitc().unwrap();
    let mut woken: Vec<_> = rx.try_iter().collect();
    woken.sort();
    assert_eq!(woken, vec!["reader", "writer"]);

    // the unlinked pipe inode went back to the free pool
    kern.with_state(|st| {
        assert_eq!(st.inodes[ip].count, 0);
        assert_eq!(st.inodes[ip].mode, 0);
    });
}

#[test]
fn signals_interrupt_only_interruptible_sleeps() {
    let (kern, mut t0) = common::boot(15, 1024);
    let (tx, rx) = mpsc::channel();
    let pid = t0
        .newproc(move |t| {
            let r = t.sleep(Chan::User(3), PSLEP);
            tx.send(r).unwrap();
        })
        .unwrap();
    t0.yielding();
    let slot = common::find_slot(&kern, pid);
    kern.with_state(|st| assert_eq!(st.procs[slot].stat, PStat::Sleep));

    kern.post_signal(pid, SIGINT).unwrap();
    t0.waitc().unwrap();
    assert_eq!(rx.recv().unwrap(), Err(KError::Intr));
}

#[test]
fn descriptor_table_runs_out_at_nofile() {
    let (kern, mut t0) = common::boot(15, 1024);
    let ip = t0.ialloc(ROOT).unwrap();
    kern.with_state(|st| {
        st.inodes[ip].mode = IALLOC | 0o644;
        st.inodes[ip].nlink = 1;
    });
    let fd = t0.open1(ip, FFlag::READ).unwrap();
    for _ in 1..NOFILE {
        t0.dup(fd).unwrap();
    }
    assert_eq!(t0.dup(fd), Err(KError::MFile));
    kern.with_state(|st| assert_eq!(st.files[st.procs[0].u.ofile[fd].unwrap()].count, NOFILE as u8));
}
