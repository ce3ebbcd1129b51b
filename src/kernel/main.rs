// Boot a kernel on a pair of RAM disks and run a little traffic
// through it: two processes sharing a file, then the swapper.

use kernel::fs::NICFREE;
use kernel::inode::{IALLOC, IREAD, IWRITE};
use kernel::mkfs::mkfs;
use kernel::param::PRIBIO;
use kernel::{Chan, Config, Dev, FFlag, Kernel, RamDisk};

fn main() {
    pretty_env_logger::init();

    let mut disk = RamDisk::new(400);
    mkfs(&mut disk, 10, 400);
    let swap = RamDisk::new(400);

    let cfg = Config {
        rootdev: Dev::new(0, 0),
        swapdev: Dev::new(1, 0),
        nswap: 400,
        ..Config::default()
    };
    let kern = Kernel::new(cfg, vec![Box::new(disk), Box::new(swap)], Vec::new());
    let mut p0 = Kernel::boot(&kern).expect("boot");

    let rootdev = kern.with_state(|st| st.rootdev);
    let pid = p0
        .newproc(move |t| {
            let dev = rootdev;
            let ip = t.ialloc(dev).expect("ialloc");
            t.kernel().with_state(|st| {
                st.inodes[ip].mode = IALLOC | IREAD | IWRITE | 0o644;
                st.inodes[ip].nlink = 1;
            });
            let fd = t.open1(ip, FFlag::READ | FFlag::WRITE).expect("open");
            t.fwrite(fd, b"hello, file system\n").expect("write");

            // a child inherits the descriptor and the offset moves for both
            let child = t
                .newproc(move |c| {
                    c.fwrite(fd, b"and hello from the child\n").expect("write");
                    c.wakeup(Chan::User(1));
                })
                .expect("fork");
            let _ = t.sleep(Chan::User(1), PRIBIO);
            println!("child pid {} wrote through the shared offset", child);

            let mut back = [0u8; 64];
            let n = t.fread(fd, &mut back).expect("read");
            assert_eq!(n, 0); // offset sits at end of file
            let n = t.readi(ip, &mut back, 0).expect("readi");
            print!("{}", String::from_utf8_lossy(&back[..n]));

            let free = t
                .kernel()
                .with_state(|st| st.mounts[0].as_ref().map(|m| m.sb.nfree).unwrap_or(0));
            println!("{} of {} cached free blocks left", free, NICFREE);
            t.waitc().expect("waitc");
            t.update().expect("update");
            t.kernel().halt();
        })
        .expect("newproc");

    // process 0 becomes the swapper until the worker halts the machine
    p0.sched();
    let reaped = p0.waitc().expect("waitc");
    assert_eq!(reaped, pid);
    println!("pid {} done, machine halted", pid);
}
