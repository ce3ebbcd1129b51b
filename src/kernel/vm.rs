// Address spaces.
//
// A process image is measured in 64-byte clicks and described to the
// relocation hardware by eight segmentation register pairs: an address
// register holding the base click and a descriptor holding the length
// and access bits. estabur lays a (text, data, stack) triple out over
// the eight pairs and sureg relocates them against the image's current
// core address, so a moved or freshly swapped-in process only needs a
// new sureg.

use crate::defs::{KError, Result};
use crate::kernel::{Cpu, KernelState};
use crate::param::{CLICK, USIZE};

/// Descriptor access bits.
pub const RO: u16 = 0o2;
pub const RW: u16 = 0o6;
/// Extend-down: the segment grows toward lower addresses (stacks).
pub const ED: u16 = 0o10;

/// Clicks covered by one segmentation register.
pub const SEGCLICKS: usize = 128;

/// Effective (relocated) segmentation registers of a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegRegs {
    pub addr: [usize; 8],
    pub desc: [u16; 8],
}

/// Number of segmentation registers needed for `n` clicks.
pub fn nseg(n: usize) -> usize {
    (n + SEGCLICKS - 1) >> 7
}

impl KernelState {
    /// Copy one click of core.
    pub fn copyseg(&mut self, from: usize, to: usize) {
        let (f, t) = (from * CLICK, to * CLICK);
        self.core.copy_within(f..f + CLICK, t);
    }

    /// Zero one click of core.
    pub fn clearseg(&mut self, click: usize) {
        for b in self.core[click * CLICK..(click + 1) * CLICK].iter_mut() {
            *b = 0;
        }
    }

    /// Load the effective segmentation registers for a process from its
    /// per-process register arrays, relocating by the image base. Text
    /// segments relocate against the shared text's own core address.
    pub fn sureg(&mut self, p: usize) {
        let base = self.procs[p].addr;
        let uisa = self.procs[p].u.uisa;
        let uisd = self.procs[p].u.uisd;
        let tsize = self.procs[p].u.tsize;
        let tadj = match self.procs[p].textp {
            Some(t) => base.wrapping_sub(self.texts[t].caddr),
            None => 0,
        };
        let mut segs = SegRegs::default();
        for i in 0..8 {
            segs.addr[i] = uisa[i] as usize + base;
            segs.desc[i] = uisd[i];
            if uisd[i] & RW == RO
                && self.procs[p].textp.is_some()
                && tsize > 0
                && (uisa[i] as usize) < tsize
            {
                segs.addr[i] = segs.addr[i].wrapping_sub(tadj);
            }
        }
        self.procs[p].segs = segs;
    }
}

impl<'a> Cpu<'a> {
    /// Lay out an address space of `nt` text, `nd` data and `ns` stack
    /// clicks over the eight register pairs: text read-only from
    /// virtual 0, data read-write above the u-area, stack read-write
    /// extend-down packed from the top of the virtual space.
    pub fn estabur(&mut self, nt: usize, nd: usize, ns: usize) -> Result<()> {
        if nseg(nt) + nseg(nd) + nseg(ns) > 8 || nt + nd + ns + USIZE > self.maxmem {
            return Err(KError::NoMem);
        }
        let mut uisa = [0u16; 8];
        let mut uisd = [0u16; 8];
        let mut seg = 0usize;

        let mut va = 0usize;
        let mut nt = nt;
        while nt > 0 {
            let sz = nt.min(SEGCLICKS);
            uisd[seg] = (((sz - 1) as u16) << 8) | RO;
            uisa[seg] = va as u16;
            va += sz;
            nt -= sz;
            seg += 1;
        }

        let mut va = USIZE;
        let mut nd = nd;
        while nd > 0 {
            let sz = nd.min(SEGCLICKS);
            uisd[seg] = (((sz - 1) as u16) << 8) | RW;
            uisa[seg] = va as u16;
            va += sz;
            nd -= sz;
            seg += 1;
        }

        let mut stk = 7i32;
        let mut va = 8 * SEGCLICKS;
        let mut ns = ns;
        while ns > 0 {
            let sz = ns.min(SEGCLICKS);
            va -= sz;
            uisd[stk as usize] = (((SEGCLICKS - sz) as u16) << 8) | RW | ED;
            uisa[stk as usize] = va as u16;
            ns -= sz;
            stk -= 1;
        }

        let mut i = seg;
        while (i as i32) <= stk {
            uisd[i] = 0;
            uisa[i] = 0;
            i += 1;
        }

        let p = self.p;
        self.procs[p].u.uisa = uisa;
        self.procs[p].u.uisd = uisd;
        self.sureg(p);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nseg_rounds_up() {
        assert_eq!(nseg(0), 0);
        assert_eq!(nseg(1), 1);
        assert_eq!(nseg(128), 1);
        assert_eq!(nseg(129), 2);
        assert_eq!(nseg(8 * 128), 8);
        assert_eq!(nseg(8 * 128 + 1), 9);
    }
}
