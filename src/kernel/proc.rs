// Processes: sleep and wakeup, the short-term scheduler, process
// creation, image resizing, and the swapper.
//
// The kernel is cooperative on a single processor. A kernel activity
// keeps the processor until it sleeps, switches, or exits; the handoff
// itself is the condvar rendezvous in Kernel::reschedule, which plays
// the part of the saved-register switch. Any code between two
// suspension points is therefore atomic with respect to every other
// process.
//
// Priorities are assigned where a process sleeps: the pri argument of
// sleep becomes its scheduling priority, and a negative priority makes
// the sleep immune to signals.

use crate::defs::{KError, Result};
use crate::kernel::{proc_entry, Cpu, KernelState, Task};
use crate::param::{Dev, CLPB, NOFILE, NPROC, PSWP, PWAIT, USIZE};
use crate::vm::SegRegs;

use bitflags::bitflags;
use log::debug;
use std::sync::Arc;
use std::thread;

/// A rendezvous point for sleep and wakeup. Channels name the kernel
/// object being waited on; User channels are free for embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chan {
    /// A buffer, while busy or in transfer.
    Buf(usize),
    /// The buffer free list, while empty.
    BFree,
    /// A superblock's free-list lock.
    FLock(usize),
    /// A superblock's inode-cache lock.
    ILock(usize),
    /// An in-core inode's lock.
    Inode(usize),
    /// Pipe ends of an inode slot.
    PipeR(usize),
    PipeW(usize),
    /// A process slot; parents wait here for exiting children.
    Proc(usize),
    /// Swapper rendezvous: something may need swapping out / in.
    Runin,
    Runout,
    User(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PStat {
    /// Free slot.
    Unused,
    /// Asleep, wakeable by signals.
    Sleep,
    /// Asleep uninterruptibly, typically in disk I/O.
    Wait,
    /// Ready to run.
    Run,
    /// Mid-creation.
    Idl,
    /// Exited, not yet reaped.
    Zomb,
}

bitflags! {
    pub struct PFlag: u8 {
        /// Image is resident in core; p_addr is a click address.
        /// Otherwise the image is on swap and p_addr a block number.
        const LOAD = 0o1;
        /// System process; never swapped out.
        const SYS  = 0o2;
        /// Pinned in core for the duration of swap I/O.
        const LOCK = 0o4;
        /// Freshly created or resized onto swap; cleared at first
        /// dispatch after swap-in.
        const SWAP = 0o10;
    }
}

/// Per-process data carried with the image.
#[derive(Debug, Clone)]
pub struct UArea {
    pub uid: u8,
    pub gid: u8,
    /// Current directory; owns one inode reference.
    pub cdir: Option<usize>,
    /// Descriptor table: indices into the system file table.
    pub ofile: [Option<usize>; NOFILE],
    pub uisa: [u16; 8],
    pub uisd: [u16; 8],
    pub tsize: usize,
    pub dsize: usize,
    pub ssize: usize,
}

impl UArea {
    pub fn new() -> Self {
        Self {
            uid: 0,
            gid: 0,
            cdir: None,
            ofile: [None; NOFILE],
            uisa: [0; 8],
            uisd: [0; 8],
            tsize: 0,
            dsize: 0,
            ssize: 0,
        }
    }
}

#[derive(Debug)]
pub struct Proc {
    pub stat: PStat,
    pub flag: PFlag,
    pub pri: i16,
    /// Lowest pending signal, 0 for none.
    pub sig: u8,
    pub uid: u8,
    /// Ticks since the image last changed residence; drives swapping.
    pub time: u8,
    pub ttyp: Option<Dev>,
    pub pid: i32,
    pub ppid: i32,
    /// Core click address under LOAD, swap block address otherwise.
    pub addr: usize,
    /// Image size in clicks, u-area included.
    pub size: usize,
    pub wchan: Option<Chan>,
    pub textp: Option<usize>,
    pub segs: SegRegs,
    pub u: UArea,
}

impl Proc {
    pub fn new() -> Self {
        Self {
            stat: PStat::Unused,
            flag: PFlag::empty(),
            pri: 0,
            sig: 0,
            uid: 0,
            time: 0,
            ttyp: None,
            pid: 0,
            ppid: 0,
            addr: 0,
            size: 0,
            wchan: None,
            textp: None,
            segs: SegRegs::default(),
            u: UArea::new(),
        }
    }
}

/// Shared text segment.
#[derive(Debug, Clone, Copy)]
pub struct Text {
    /// Processes sharing the text.
    pub count: u8,
    /// Of those, how many are resident.
    pub ccount: u8,
    /// Swap image address, blocks.
    pub daddr: usize,
    /// Core address while any sharer is resident.
    pub caddr: usize,
    /// Size in clicks.
    pub size: usize,
}

impl Text {
    pub fn new() -> Self {
        Self {
            count: 0,
            ccount: 0,
            daddr: 0,
            caddr: 0,
            size: 0,
        }
    }
}

impl KernelState {
    /// Make every process sleeping on `chan` runnable. If a woken
    /// process is not resident and the swapper is parked waiting for
    /// inbound work, the swapper is woken in turn (once, on its own
    /// channel).
    pub fn wakeup(&mut self, chan: Chan) {
        let mut chan = chan;
        loop {
            let mut swapper = false;
            for p in self.procs.iter_mut() {
                if p.stat != PStat::Unused && p.wchan == Some(chan) {
                    if self.runout && !p.flag.contains(PFlag::LOAD) {
                        self.runout = false;
                        swapper = true;
                    }
                    p.wchan = None;
                    p.stat = PStat::Run;
                    self.runrun = true;
                }
            }
            if swapper {
                chan = Chan::Runout;
            } else {
                break;
            }
        }
    }

    pub fn issig(&self, p: usize) -> bool {
        self.procs[p].sig != 0
    }

    /// Round-robin choice of the next process: scan the whole table
    /// from just past the last dispatch, keeping the runnable resident
    /// process with the strongest (numerically lowest) priority.
    pub(crate) fn select(&self) -> Option<usize> {
        let mut best = None;
        let mut bestpri = i16::MAX;
        let mut i = self.runq_hint;
        for _ in 0..NPROC {
            i += 1;
            if i >= NPROC {
                i = 0;
            }
            let rp = &self.procs[i];
            if rp.stat == PStat::Run && rp.flag.contains(PFlag::LOAD) && rp.pri < bestpri {
                best = Some(i);
                bestpri = rp.pri;
            }
        }
        best
    }

    /// Claim the processor for process `p` if it is the scheduler's
    /// choice. A process arriving via swap-in comes back through its
    /// swap save frame: the SWAP flag is consumed here.
    pub(crate) fn try_dispatch(&mut self, p: usize) -> bool {
        if self.curproc.is_some() {
            return false;
        }
        match self.select() {
            Some(q) if q == p => {
                self.curproc = Some(p);
                self.runq_hint = p;
                self.runrun = false;
                if self.procs[p].flag.contains(PFlag::SWAP) {
                    self.procs[p].flag.remove(PFlag::SWAP);
                }
                self.sureg(p);
                true
            }
            _ => false,
        }
    }

    /// Write a process image to swap. The swap extent is sized for the
    /// current p_size while `os` clicks (the pre-resize size) are
    /// written, so a growing process reserves its new footprint in one
    /// step. `ff` frees the core copy. Swap exhaustion and swap I/O
    /// failure are fatal.
    pub fn xswap(&mut self, p: usize, ff: bool, os: usize) {
        let size = self.procs[p].size;
        let os = if os == 0 { size } else { os };
        let a = match self.swapmap.alloc((size + CLPB - 1) / CLPB) {
            Some(a) => a,
            None => panic!("out of swap space"),
        };
        if let Some(t) = self.procs[p].textp {
            self.xccdec(t);
        }
        self.procs[p].flag.insert(PFlag::LOCK);
        let oldaddr = self.procs[p].addr;
        if !self.swap(a, oldaddr, os, false) {
            panic!("swap error");
        }
        if ff {
            self.coremap.free(os, oldaddr);
        }
        let rp = &mut self.procs[p];
        rp.addr = a;
        rp.flag.remove(PFlag::LOAD | PFlag::LOCK);
        rp.time = 0;
        debug!("pid {} swapped out, {} clicks", rp.pid, os);
    }

    /// One resident sharer of a text segment goes away; the core copy
    /// is given back when the last one does.
    pub fn xccdec(&mut self, t: usize) {
        if self.texts[t].ccount != 0 {
            self.texts[t].ccount -= 1;
            if self.texts[t].ccount == 0 {
                let (size, caddr) = (self.texts[t].size, self.texts[t].caddr);
                self.coremap.free(size, caddr);
            }
        }
    }

    /// Drop a process's claim on its text segment, releasing the swap
    /// image with the last claim.
    pub fn xfree(&mut self, t: usize) {
        self.xccdec(t);
        let x = &mut self.texts[t];
        x.count = x.count.saturating_sub(1);
        if x.count == 0 {
            let (size, daddr) = (x.size, x.daddr);
            self.texts[t] = Text::new();
            self.swapmap.free((size + CLPB - 1) / CLPB, daddr);
        }
    }
}

impl<'a> Cpu<'a> {
    /// Give up the processor until the scheduler picks this process
    /// again.
    pub fn swtch(&mut self) {
        let g = self.st.take().expect("lost cpu context");
        let g = self.kern.reschedule(g, self.p);
        self.st = Some(g);
    }

    /// Suspend the current process on `chan`. A non-negative priority
    /// makes the sleep interruptible: pending signals abort it, before
    /// or after the rendezvous, and the abandoned operation unwinds
    /// with Intr. Putting an interruptible sleeper down is also the
    /// moment to let a parked swapper reconsider the core.
    pub fn sleep(&mut self, chan: Chan, pri: i16) -> Result<()> {
        let p = self.p;
        if pri >= 0 {
            if self.issig(p) {
                return Err(KError::Intr);
            }
            {
                let rp = &mut self.procs[p];
                rp.wchan = Some(chan);
                rp.stat = PStat::Sleep;
                rp.pri = pri;
            }
            if self.runin {
                self.runin = false;
                self.wakeup(Chan::Runin);
            }
            self.swtch();
            if self.issig(p) {
                return Err(KError::Intr);
            }
        } else {
            {
                let rp = &mut self.procs[p];
                rp.wchan = Some(chan);
                rp.stat = PStat::Wait;
                rp.pri = pri;
            }
            self.swtch();
        }
        Ok(())
    }

    /// Let equal and stronger priorities run; the caller stays
    /// runnable.
    pub fn yielding(&mut self) {
        let p = self.p;
        self.procs[p].stat = PStat::Run;
        self.swtch();
    }

    /// Create a new process as a copy of the current one.
    ///
    /// Every non-empty descriptor, the shared text and the current
    /// directory gain a reference. The child gets its own copy of the
    /// parent's image, or, when core is short, the image is written
    /// straight to swap and the child starts life swapped out with the
    /// SWAP flag up. The parent returns the child's pid; the child
    /// continues in `body` on its own kernel activity.
    pub fn newproc(&mut self, body: Box<dyn FnOnce(&mut Task) + Send>) -> Result<i32> {
        let parent = self.p;
        let slot = (0..NPROC)
            .find(|&i| self.procs[i].stat == PStat::Unused)
            .ok_or(KError::Again)?;
        self.mpid += 1;
        let pid = self.mpid;

        let (puid, pttyp, ptextp, ppri, psize, paddr, parent_pid) = {
            let pp = &self.procs[parent];
            (pp.uid, pp.ttyp, pp.textp, pp.pri, pp.size, pp.addr, pp.pid)
        };
        let psegs = self.procs[parent].segs;
        let uarea = self.procs[parent].u.clone();
        {
            let rpp = &mut self.procs[slot];
            rpp.stat = PStat::Run;
            rpp.flag = PFlag::LOAD;
            rpp.uid = puid;
            rpp.ttyp = pttyp;
            rpp.textp = ptextp;
            rpp.pid = pid;
            rpp.ppid = parent_pid;
            rpp.pri = ppri;
            rpp.time = 0;
            rpp.sig = 0;
            rpp.size = psize;
            rpp.wchan = None;
            rpp.segs = psegs;
            rpp.u = uarea;
        }

        for fd in 0..NOFILE {
            if let Some(f) = self.procs[slot].u.ofile[fd] {
                self.files[f].count = self.files[f].count.saturating_add(1);
            }
        }
        if let Some(t) = ptextp {
            self.texts[t].count = self.texts[t].count.saturating_add(1);
            self.texts[t].ccount = self.texts[t].ccount.saturating_add(1);
        }
        if let Some(ip) = self.procs[slot].u.cdir {
            self.inodes[ip].count = self.inodes[ip].count.saturating_add(1);
        }

        match self.coremap.alloc(psize) {
            None => {
                // no room for a copy: write the child image to swap
                // directly from the parent's core
                self.procs[parent].stat = PStat::Idl;
                self.procs[slot].addr = paddr;
                self.xswap(slot, false, psize);
                self.procs[slot].flag.insert(PFlag::SWAP);
                self.procs[parent].stat = PStat::Run;
            }
            Some(a) => {
                self.procs[slot].addr = a;
                for k in 0..psize {
                    self.copyseg(paddr + k, a + k);
                }
            }
        }

        let kern = Arc::clone(self.kern);
        thread::spawn(move || proc_entry(kern, slot, body));
        Ok(pid)
    }

    /// Resize the image to `newsize` clicks. Shrinking frees the tail
    /// at once. Growing moves the image into a fresh allocation,
    /// clearing only the added data clicks; with no core to be had the
    /// process writes itself to swap at the old size (reserving the
    /// new) and lets the swapper bring it back at the new size.
    pub fn expand(&mut self, newsize: usize) -> Result<()> {
        let p = self.p;
        let os = self.procs[p].size;
        let oa = self.procs[p].addr;
        let ssize = self.procs[p].u.ssize;
        let old_dend = USIZE + self.procs[p].u.dsize;
        let nd = newsize.saturating_sub(USIZE + ssize);

        self.procs[p].size = newsize;
        if os >= newsize {
            if os > newsize {
                self.coremap.free(os - newsize, oa + newsize);
            }
            self.procs[p].u.dsize = nd;
            return Ok(());
        }
        match self.coremap.alloc(newsize) {
            Some(a) => {
                for i in 0..os {
                    self.copyseg(oa + i, a + i);
                }
                self.coremap.free(os, oa);
                self.procs[p].addr = a;
                for c in old_dend..USIZE + nd {
                    self.clearseg(a + c);
                }
            }
            None => {
                self.xswap(p, true, os);
                self.procs[p].flag.insert(PFlag::SWAP);
                self.swtch();
                // back in core at the new size; the added region is
                // whatever the swap-in read behind the old image
                let a = self.procs[p].addr;
                for c in old_dend..USIZE + nd {
                    self.clearseg(a + c);
                }
            }
        }
        self.procs[p].u.dsize = nd;
        self.sureg(p);
        Ok(())
    }

    /// The swapper, the long-term half of the scheduler. Runs as
    /// process 0 and never returns until the kernel is halted.
    ///
    /// Each round brings in the runnable swapped-out process that has
    /// been out the longest, loading its text first if no sharer is
    /// resident. When core is short it evicts, preferring a resident
    /// process stuck in uninterruptible I/O, then the longest-resident
    /// runnable or interruptible sleeper, with a few ticks of
    /// hysteresis so fresh images are not bounced straight back out.
    pub fn sched(&mut self) {
        loop {
            if self.halted {
                return;
            }
            let mut outage = -1i32;
            let mut swapin = None;
            for i in 0..NPROC {
                let rp = &self.procs[i];
                if rp.stat == PStat::Run
                    && !rp.flag.contains(PFlag::LOAD)
                    && rp.time as i32 > outage
                {
                    outage = rp.time as i32;
                    swapin = Some(i);
                }
            }
            let rp = match swapin {
                None => {
                    self.runout = true;
                    let _ = self.sleep(Chan::Runout, PSWP);
                    continue;
                }
                Some(i) => i,
            };

            let mut needed = self.procs[rp].size;
            if let Some(t) = self.procs[rp].textp {
                if self.texts[t].ccount == 0 {
                    needed += self.texts[t].size;
                }
            }
            if let Some(a) = self.coremap.alloc(needed) {
                let mut a = a;
                if let Some(t) = self.procs[rp].textp {
                    if self.texts[t].ccount == 0 {
                        let (daddr, size) = (self.texts[t].daddr, self.texts[t].size);
                        if !self.swap(daddr, a, size, true) {
                            panic!("swap error");
                        }
                        self.texts[t].caddr = a;
                        a += size;
                    }
                    self.texts[t].ccount += 1;
                }
                let (oswap, size) = (self.procs[rp].addr, self.procs[rp].size);
                if !self.swap(oswap, a, size, true) {
                    panic!("swap error");
                }
                self.swapmap.free((size + CLPB - 1) / CLPB, oswap);
                {
                    let rpp = &mut self.procs[rp];
                    rpp.addr = a;
                    rpp.flag.insert(PFlag::LOAD);
                    rpp.time = 0;
                }
                debug!("pid {} swapped in, {} clicks", self.procs[rp].pid, size);
                continue;
            }

            // short of core: someone resident has to go
            let mut victim = (0..NPROC).find(|&i| {
                let rp = &self.procs[i];
                rp.flag & (PFlag::SYS | PFlag::LOCK | PFlag::LOAD) == PFlag::LOAD
                    && rp.stat == PStat::Wait
            });
            if victim.is_none() {
                if outage < 3 {
                    self.runin = true;
                    let _ = self.sleep(Chan::Runin, PSWP);
                    continue;
                }
                let mut oldest = -1i32;
                for i in 0..NPROC {
                    let rp = &self.procs[i];
                    if rp.flag & (PFlag::SYS | PFlag::LOCK | PFlag::LOAD) == PFlag::LOAD
                        && (rp.stat == PStat::Run || rp.stat == PStat::Sleep)
                        && rp.time as i32 > oldest
                    {
                        oldest = rp.time as i32;
                        victim = Some(i);
                    }
                }
                if victim.is_none() || (oldest < 2 && outage < 5) {
                    self.runin = true;
                    let _ = self.sleep(Chan::Runin, PSWP);
                    continue;
                }
            }
            let v = victim.unwrap();
            self.procs[v].flag.remove(PFlag::LOAD);
            self.xswap(v, true, 0);
        }
    }

    /// Reap one exited child, or sleep until one exits.
    pub fn waitc(&mut self) -> Result<i32> {
        loop {
            let mypid = self.procs[self.p].pid;
            let mut kids = false;
            for i in 0..NPROC {
                if i == self.p {
                    continue;
                }
                if self.procs[i].stat != PStat::Unused && self.procs[i].ppid == mypid {
                    kids = true;
                    if self.procs[i].stat == PStat::Zomb {
                        let pid = self.procs[i].pid;
                        self.procs[i] = Proc::new();
                        return Ok(pid);
                    }
                }
            }
            if !kids {
                return Err(KError::Child);
            }
            self.sleep(Chan::Proc(self.p), PWAIT)?;
        }
    }

    /// Tear the current process down: close its descriptors, release
    /// its directory and text, free the image, and leave a zombie for
    /// the parent. Consumes the processor; the thread behind the
    /// process ends here.
    pub(crate) fn exit_proc(mut self) {
        let p = self.p;
        for fd in 0..NOFILE {
            if let Some(f) = self.procs[p].u.ofile[fd].take() {
                let _ = self.closef(f);
            }
        }
        if let Some(ip) = self.procs[p].u.cdir.take() {
            let _ = self.iput(ip);
        }
        if let Some(t) = self.procs[p].textp.take() {
            self.xfree(t);
        }
        let (addr, size, loaded) = {
            let rp = &self.procs[p];
            (rp.addr, rp.size, rp.flag.contains(PFlag::LOAD))
        };
        if loaded {
            self.coremap.free(size, addr);
        } else {
            self.swapmap.free((size + CLPB - 1) / CLPB, addr);
        }
        self.procs[p].flag.remove(PFlag::LOAD);
        self.procs[p].wchan = None;
        self.procs[p].stat = PStat::Zomb;
        let ppid = self.procs[p].ppid;
        let parent = (0..NPROC)
            .find(|&i| i != p && self.procs[i].stat != PStat::Unused && self.procs[i].pid == ppid);
        if let Some(parent) = parent {
            self.wakeup(Chan::Proc(parent));
        }
        self.retire();
    }
}
