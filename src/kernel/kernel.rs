// The kernel context object.
//
// All mutable kernel state lives in one KernelState behind one mutex;
// holding the lock is running with interrupts masked on the single
// processor. Processes are host threads, but only the thread named by
// curproc may execute kernel code: everyone else is parked in
// acquire(), and the condvar handoff in reschedule() is the context
// switch. Code that takes the lock without being a process (the clock,
// signal posting, state inspection) is interrupt context: it may
// wake processes up but never sleeps.
//
// A Task is a process's handle onto the kernel: its methods are the
// entry points a process traps in through, each one claiming the
// processor for the duration of the call or until it sleeps inside.

use crate::bio::Buf;
use crate::defs::{KError, Result};
use crate::file::{BlockDev, BlockEntry, CharDev, CharEntry, DevTab, FFlag, File};
use crate::fs::Mount;
use crate::inode::Inode;
use crate::kalloc::RMap;
use crate::param::{
    Dev, CLICK, MAXMEM, NBUF, NFILE, NINODE, NMOUNT, NPROC, NTEXT, ROOTINO, USIZE,
};
use crate::proc::{Chan, PFlag, PStat, Proc, Text};

use array_macro::array;
use log::{error, info};
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Machine configuration fixed at construction.
pub struct Config {
    /// Buffers in the block cache.
    pub nbuf: usize,
    /// Physical core in clicks.
    pub maxmem: usize,
    pub rootdev: Dev,
    pub swapdev: Dev,
    /// First block of swap space on swapdev.
    pub swplo: usize,
    /// Swap space in blocks.
    pub nswap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            maxmem: MAXMEM,
            rootdev: Dev::new(0, 0),
            swapdev: Dev::new(1, 0),
            swplo: 0,
            nswap: 4096,
        }
    }
}

pub struct KernelState {
    pub procs: [Proc; NPROC],
    pub texts: [Text; NTEXT],
    /// The process owning the processor, if any.
    pub curproc: Option<usize>,
    /// Last dispatch, where the round-robin scan resumes.
    pub(crate) runq_hint: usize,
    /// Swapper parked waiting for a reason to swap someone out.
    pub runin: bool,
    /// Swapper parked waiting for a swapped-out runnable.
    pub runout: bool,
    /// A wakeup has made rescheduling worthwhile.
    pub runrun: bool,
    pub(crate) mpid: i32,
    pub bufs: Vec<Buf>,
    pub bdevsw: Vec<BlockEntry>,
    pub cdevsw: Vec<CharEntry>,
    pub mounts: [Option<Mount>; NMOUNT],
    pub inodes: [Inode; NINODE],
    pub files: [File; NFILE],
    /// Free physical core, in clicks.
    pub coremap: RMap,
    /// Free swap space, in blocks.
    pub swapmap: RMap,
    /// Simulated physical core.
    pub core: Vec<u8>,
    pub maxmem: usize,
    pub rootdev: Dev,
    pub swapdev: Dev,
    pub swplo: usize,
    pub nswap: usize,
    /// In-core inode of the root directory.
    pub rootdir: Option<usize>,
    pub time: u32,
    pub lbolt: u32,
    /// Update (sync) in progress.
    pub updlock: bool,
    pub halted: bool,
}

pub struct Kernel {
    pub(crate) state: Mutex<KernelState>,
    pub(crate) dispatch: Condvar,
}

impl Kernel {
    /// Build a kernel around a device complement. Block device table
    /// order defines major numbers; the same goes for character
    /// devices.
    pub fn new(
        cfg: Config,
        bdevs: Vec<Box<dyn BlockDev>>,
        cdevs: Vec<Box<dyn CharDev>>,
    ) -> Arc<Kernel> {
        let mut st = KernelState {
            procs: array![_ => Proc::new(); NPROC],
            texts: array![_ => Text::new(); NTEXT],
            curproc: None,
            runq_hint: 0,
            runin: false,
            runout: false,
            runrun: false,
            mpid: 0,
            bufs: Vec::new(),
            bdevsw: bdevs
                .into_iter()
                .map(|dev| BlockEntry {
                    dev,
                    tab: DevTab::new(),
                })
                .collect(),
            cdevsw: cdevs.into_iter().map(|dev| CharEntry { dev }).collect(),
            mounts: array![_ => None; NMOUNT],
            inodes: array![_ => Inode::new(); NINODE],
            files: array![_ => File::new(); NFILE],
            coremap: RMap::new(),
            swapmap: RMap::new(),
            core: vec![0; cfg.maxmem * CLICK],
            maxmem: cfg.maxmem,
            rootdev: cfg.rootdev,
            swapdev: cfg.swapdev,
            swplo: cfg.swplo,
            nswap: cfg.nswap,
            rootdir: None,
            time: 1,
            lbolt: 0,
            updlock: false,
            halted: false,
        };
        st.binit(cfg.nbuf);
        Arc::new(Kernel {
            state: Mutex::new(st),
            dispatch: Condvar::new(),
        })
    }

    /// Bring the machine up: seed the resource maps, set up process 0,
    /// read the root superblock, and take a reference to the root
    /// directory. Returns the Task for process 0, which owns the
    /// processor.
    pub fn boot(kern: &Arc<Kernel>) -> Result<Task> {
        let mut g = kern.lock();
        let maxmem = g.maxmem;
        // clicks below the first u-area belong to process 0
        g.coremap.free(maxmem - USIZE, USIZE);
        let (nswap, swplo) = (g.nswap, g.swplo);
        g.swapmap.free(nswap, swplo);
        {
            let p0 = &mut g.procs[0];
            p0.stat = PStat::Run;
            p0.flag = PFlag::LOAD | PFlag::SYS;
            p0.addr = 0;
            p0.size = USIZE;
            p0.pid = 0;
        }
        g.curproc = Some(0);
        info!("mem = {}K", maxmem * CLICK / 1024);
        let mut cpu = Cpu {
            kern,
            st: Some(g),
            p: 0,
        };
        cpu.iinit()?;
        let rootdev = cpu.rootdev;
        let root = cpu.iget(rootdev, ROOTINO)?;
        cpu.prele(root);
        cpu.rootdir = Some(root);
        let cdir = cpu.iget(rootdev, ROOTINO)?;
        cpu.prele(cdir);
        cpu.procs[0].u.cdir = Some(cdir);
        drop(cpu);
        Ok(Task {
            kern: Arc::clone(kern),
            p: 0,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interrupt-context access to the kernel state, for clocks, tests
    /// and debuggers. Runs with the processor lock held and pokes the
    /// dispatcher afterwards in case it made someone runnable.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut g = self.lock();
        let r = f(&mut g);
        drop(g);
        self.dispatch.notify_all();
        r
    }

    /// Give the processor away and wait to be chosen again.
    pub(crate) fn reschedule<'a>(
        &'a self,
        mut g: MutexGuard<'a, KernelState>,
        p: usize,
    ) -> MutexGuard<'a, KernelState> {
        g.curproc = None;
        self.dispatch.notify_all();
        self.acquire(g, p)
    }

    /// Park until the scheduler's choice is `p`, then own the
    /// processor.
    pub(crate) fn acquire<'a>(
        &'a self,
        mut g: MutexGuard<'a, KernelState>,
        p: usize,
    ) -> MutexGuard<'a, KernelState> {
        loop {
            if g.try_dispatch(p) {
                return g;
            }
            g = self
                .dispatch
                .wait(g)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// The clock interrupt: advance time, age every process's
    /// residence counter, and re-arm a parked swapper when a
    /// swapped-out runnable is waiting.
    pub fn clock(&self) {
        let mut g = self.lock();
        g.lbolt += 1;
        g.time += 1;
        for p in g.procs.iter_mut() {
            if p.stat != PStat::Unused && p.time < 127 {
                p.time += 1;
            }
        }
        if g.runout
            && g.procs
                .iter()
                .any(|p| p.stat == PStat::Run && !p.flag.contains(PFlag::LOAD))
        {
            g.runout = false;
            g.wakeup(Chan::Runout);
        }
        drop(g);
        self.dispatch.notify_all();
    }

    /// Post a signal to a process. The lowest pending number wins, and
    /// an interruptible sleeper is made runnable so it can notice.
    pub fn post_signal(&self, pid: i32, sig: u8) -> Result<()> {
        let mut g = self.lock();
        let mut found = false;
        for p in g.procs.iter_mut() {
            if p.stat != PStat::Unused && p.pid == pid {
                found = true;
                if p.sig == 0 || sig < p.sig {
                    p.sig = sig;
                }
                if p.stat == PStat::Sleep {
                    p.wchan = None;
                    p.stat = PStat::Run;
                }
            }
        }
        drop(g);
        self.dispatch.notify_all();
        if found {
            Ok(())
        } else {
            Err(KError::Srch)
        }
    }

    /// Ask the swapper loop to come home. Meant for embedders shutting
    /// the machine down.
    pub fn halt(&self) {
        let mut g = self.lock();
        g.halted = true;
        g.wakeup(Chan::Runin);
        g.wakeup(Chan::Runout);
        drop(g);
        self.dispatch.notify_all();
    }
}

/// The processor, executing kernel code on behalf of process `p` with
/// the state lock held. Created by Task entry points; sleeping hands
/// the lock back through the dispatcher.
pub struct Cpu<'a> {
    pub(crate) kern: &'a Arc<Kernel>,
    pub(crate) st: Option<MutexGuard<'a, KernelState>>,
    pub p: usize,
}

impl<'a> Deref for Cpu<'a> {
    type Target = KernelState;
    fn deref(&self) -> &KernelState {
        self.st.as_ref().expect("lost cpu context")
    }
}

impl<'a> DerefMut for Cpu<'a> {
    fn deref_mut(&mut self) -> &mut KernelState {
        self.st.as_mut().expect("lost cpu context")
    }
}

impl<'a> Cpu<'a> {
    /// Release the processor for good; the caller's thread is done.
    pub(crate) fn retire(mut self) {
        let mut g = self.st.take().expect("lost cpu context");
        g.curproc = None;
        drop(g);
        self.kern.dispatch.notify_all();
    }
}

/// A process's handle onto the kernel.
pub struct Task {
    kern: Arc<Kernel>,
    p: usize,
}

/// Thread body of every process but process 0: wait to be dispatched
/// the first time, run the process body, then exit.
pub(crate) fn proc_entry(kern: Arc<Kernel>, p: usize, body: Box<dyn FnOnce(&mut Task) + Send>) {
    {
        let g = kern.lock();
        let _g = kern.acquire(g, p);
    }
    let mut task = Task {
        kern: Arc::clone(&kern),
        p,
    };
    if catch_unwind(AssertUnwindSafe(|| body(&mut task))).is_err() {
        error!("process slot {} aborted in the kernel", p);
    }
    task.exit();
}

impl Task {
    /// Claim the processor for one kernel entry.
    fn enter(&mut self) -> Cpu<'_> {
        let g = self.kern.lock();
        let g = if g.curproc == Some(self.p) {
            g
        } else {
            self.kern.acquire(g, self.p)
        };
        Cpu {
            kern: &self.kern,
            st: Some(g),
            p: self.p,
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kern
    }

    /// Process table slot of this task.
    pub fn slot(&self) -> usize {
        self.p
    }

    pub fn pid(&self) -> i32 {
        self.kern.lock().procs[self.p].pid
    }

    pub(crate) fn exit(&mut self) {
        self.enter().exit_proc();
    }

    // Buffer cache.

    pub fn bread(&mut self, dev: Dev, blkno: u32) -> Result<usize> {
        self.enter().bread(dev, blkno)
    }

    pub fn getblk(&mut self, dev: Dev, blkno: u32) -> Result<usize> {
        self.enter().getblk(dev, blkno)
    }

    pub fn brelse(&mut self, b: usize) {
        self.enter().brelse(b)
    }

    pub fn bwrite(&mut self, b: usize) -> Result<()> {
        self.enter().bwrite(b)
    }

    pub fn bdwrite(&mut self, b: usize) {
        self.enter().bdwrite(b)
    }

    pub fn bawrite(&mut self, b: usize) {
        self.enter().bawrite(b)
    }

    pub fn bflush(&mut self, dev: Dev) {
        self.enter().bflush(dev)
    }

    pub fn clrbuf(&mut self, b: usize) {
        self.enter().clrbuf(b)
    }

    pub fn incore(&mut self, dev: Dev, blkno: u32) -> Option<usize> {
        self.enter().incore(dev, blkno)
    }

    // Block and inode allocation.

    pub fn alloc(&mut self, dev: Dev) -> Result<usize> {
        self.enter().alloc(dev)
    }

    pub fn bfree(&mut self, dev: Dev, bno: u16) -> Result<()> {
        self.enter().bfree(dev, bno)
    }

    pub fn ialloc(&mut self, dev: Dev) -> Result<usize> {
        self.enter().ialloc(dev)
    }

    pub fn ifree(&mut self, dev: Dev, ino: u32) {
        self.enter().ifree(dev, ino)
    }

    pub fn update(&mut self) -> Result<()> {
        self.enter().update()
    }

    // Inodes.

    pub fn iget(&mut self, dev: Dev, ino: u32) -> Result<usize> {
        self.enter().iget(dev, ino)
    }

    pub fn iput(&mut self, ip: usize) -> Result<()> {
        self.enter().iput(ip)
    }

    pub fn prele(&mut self, ip: usize) {
        self.enter().prele(ip)
    }

    pub fn readi(&mut self, ip: usize, buf: &mut [u8], off: u32) -> Result<usize> {
        self.enter().readi(ip, buf, off)
    }

    pub fn writei(&mut self, ip: usize, buf: &[u8], off: u32) -> Result<usize> {
        self.enter().writei(ip, buf, off)
    }

    pub fn access(&mut self, ip: usize, mode: u16) -> Result<()> {
        self.enter().access(ip, mode)
    }

    // Files and descriptors.

    pub fn open1(&mut self, ip: usize, flag: FFlag) -> Result<usize> {
        self.enter().open1(ip, flag)
    }

    pub fn dup(&mut self, fd: usize) -> Result<usize> {
        self.enter().dup(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        self.enter().close(fd)
    }

    pub fn fread(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        self.enter().fread(fd, buf)
    }

    pub fn fwrite(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
        self.enter().fwrite(fd, buf)
    }

    // Processes.

    pub fn newproc<F>(&mut self, body: F) -> Result<i32>
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        self.enter().newproc(Box::new(body))
    }

    pub fn expand(&mut self, newsize: usize) -> Result<()> {
        self.enter().expand(newsize)
    }

    pub fn estabur(&mut self, nt: usize, nd: usize, ns: usize) -> Result<()> {
        self.enter().estabur(nt, nd, ns)
    }

    pub fn sleep(&mut self, chan: Chan, pri: i16) -> Result<()> {
        self.enter().sleep(chan, pri)
    }

    pub fn wakeup(&mut self, chan: Chan) {
        let mut cpu = self.enter();
        cpu.wakeup(chan);
    }

    pub fn yielding(&mut self) {
        self.enter().yielding()
    }

    pub fn waitc(&mut self) -> Result<i32> {
        self.enter().waitc()
    }

    /// Run the swapper. Process 0's vocation; returns only after
    /// Kernel::halt.
    pub fn sched(&mut self) {
        self.enter().sched()
    }
}
