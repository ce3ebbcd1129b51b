//! A small time-sharing kernel: processes, a swapper, a write-back
//! buffer cache, and a classical block file system, simulated on the
//! host.
//!
//! The machine model is one processor, cooperative in kernel mode:
//! kernel code runs until it sleeps, switches, or exits, and everything
//! between two suspension points is atomic. See [`kernel::Kernel`] for
//! the context object and [`kernel::Task`] for the per-process entry
//! points.

pub mod bio;
pub mod defs;
pub mod file;
pub mod fs;
pub mod inode;
pub mod kalloc;
pub mod kernel;
pub mod mkfs;
pub mod param;
pub mod proc;
pub mod vm;

pub use crate::defs::{KError, Result};
pub use crate::file::{BlockDev, CharDev, FFlag, RamDisk};
pub use crate::kernel::{Config, Kernel, Task};
pub use crate::param::{Dev, BSIZE, CLICK, NODEV, USIZE};
pub use crate::proc::{Chan, PFlag, PStat};
