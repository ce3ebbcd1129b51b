// Kernel error namespace.
//
// Every code is a fixed small integer; user-visible failures travel as
// these values and nothing else. Conditions the design promises can
// never arise (a missing mount entry, a swap I/O failure) are not
// errors and panic instead.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KError {
    #[error("not super-user")]
    Perm = 1,
    #[error("no such file or directory")]
    NoEnt = 2,
    #[error("no such process")]
    Srch = 3,
    #[error("interrupted by signal")]
    Intr = 4,
    #[error("I/O error")]
    Io = 5,
    #[error("no such device or address")]
    NxIo = 6,
    #[error("arg list too long")]
    TooBig = 7,
    #[error("exec format error")]
    NoExec = 8,
    #[error("bad file number")]
    BadF = 9,
    #[error("no children")]
    Child = 10,
    #[error("no more processes")]
    Again = 11,
    #[error("not enough core")]
    NoMem = 12,
    #[error("permission denied")]
    Acces = 13,
    #[error("block device required")]
    NotBlk = 15,
    #[error("mount device busy")]
    Busy = 16,
    #[error("file exists")]
    Exist = 17,
    #[error("cross-device link")]
    XDev = 18,
    #[error("no such device")]
    NoDev = 19,
    #[error("not a directory")]
    NotDir = 20,
    #[error("is a directory")]
    IsDir = 21,
    #[error("invalid argument")]
    Inval = 22,
    #[error("file table overflow")]
    NFile = 23,
    #[error("too many open files")]
    MFile = 24,
    #[error("not a typewriter")]
    NoTty = 25,
    #[error("text file busy")]
    TxtBsy = 26,
    #[error("file too large")]
    FBig = 27,
    #[error("no space left on device")]
    NoSpc = 28,
    #[error("illegal seek")]
    SPipe = 29,
    #[error("read-only file system")]
    RoFs = 30,
    #[error("too many links")]
    MLink = 31,
    #[error("bad address")]
    Fault = 106,
}

impl KError {
    /// The numeric code handed back to user mode.
    pub fn code(self) -> i32 {
        self as i32
    }
}

pub type Result<T> = core::result::Result<T, KError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_fixed() {
        assert_eq!(KError::Perm.code(), 1);
        assert_eq!(KError::NoSpc.code(), 28);
        assert_eq!(KError::MLink.code(), 31);
        assert_eq!(KError::Fault.code(), 106);
    }
}
