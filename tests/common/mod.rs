// Shared harness: a kernel booted on a freshly built RAM-disk file
// system, with a second RAM disk for swap.

use kernel::mkfs::mkfs;
use kernel::proc::PStat;
use kernel::{Config, Dev, Kernel, RamDisk, Task};
use std::sync::Arc;

pub const ROOT: Dev = Dev::new(0, 0);
pub const ISIZE: u16 = 10;
pub const FSIZE: u16 = 200;

pub fn boot(nbuf: usize, maxmem: usize) -> (Arc<Kernel>, Task) {
    let mut disk = RamDisk::new(FSIZE as usize);
    mkfs(&mut disk, ISIZE, FSIZE);
    let swap = RamDisk::new(300);
    let cfg = Config {
        nbuf,
        maxmem,
        rootdev: ROOT,
        swapdev: Dev::new(1, 0),
        swplo: 1,
        nswap: 299,
    };
    let kern = Kernel::new(cfg, vec![Box::new(disk), Box::new(swap)], Vec::new());
    let t0 = Kernel::boot(&kern).expect("boot");
    (kern, t0)
}

/// Process table slot currently holding `pid`.
pub fn find_slot(kern: &Arc<Kernel>, pid: i32) -> usize {
    kern.with_state(|st| {
        st.procs
            .iter()
            .position(|p| p.stat != PStat::Unused && p.pid == pid)
            .expect("pid not in the process table")
    })
}
