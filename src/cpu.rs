//! CPU mode bring-up.
//!
//! Produces the register state that puts a freshly created vCPU directly
//! into 16-bit real, 32-bit protected, or 64-bit long mode, skipping the
//! usual firmware dance. The functions here are pure transformations of the
//! two KVM register banks: fetch the banks, apply a mode, push them back in
//! one step. No ioctls happen in this module.
//!
//! Protected and long mode use two implied flat descriptors (code selector
//! 8, data selector 16). No GDT is written to guest memory; KVM synthesizes
//! the descriptor caches from the segment fields we program.

use std::fmt;

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

use crate::error::{Error, Result};

/// CR0.PE - protection enable.
const CR0_PE: u64 = 1 << 0;
/// CR0.PG - paging enable.
const CR0_PG: u64 = 1 << 31;
/// CR4.PAE - physical address extension, required for 4-level paging.
const CR4_PAE: u64 = 1 << 5;
/// EFER.LME - long mode enable.
const EFER_LME: u64 = 1 << 8;
/// EFER.LMA - long mode active.
const EFER_LMA: u64 = 1 << 10;

/// Segment type: code, execute/read, accessed.
const SEG_TYPE_CODE: u8 = 0x0B;
/// Segment type: data, read/write, accessed.
const SEG_TYPE_DATA: u8 = 0x03;

const CODE_SELECTOR: u16 = 8;
const DATA_SELECTOR: u16 = 16;

/// Highest entry point addressable from real mode with a zero segment base.
const REAL_MODE_LIMIT: u64 = 0x10000;

/// The CPU operating mode the guest starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit real mode.
    Real,
    /// 32-bit protected mode, flat segmentation, no paging.
    Protected,
    /// 64-bit long mode, identity-mapped paging.
    Long,
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuMode::Real => write!(f, "real"),
            CpuMode::Protected => write!(f, "protected"),
            CpuMode::Long => write!(f, "long"),
        }
    }
}

/// Check that an entry point is reachable in the given mode.
///
/// Real mode addressing tops out at 64 KiB with the flat zero-base segments
/// programmed here; protected mode is limited to 32-bit addresses. Long
/// mode takes any 64-bit address.
pub fn check_entry_point(mode: CpuMode, entry: u64) -> Result<()> {
    let in_range = match mode {
        CpuMode::Real => entry < REAL_MODE_LIMIT,
        CpuMode::Protected => entry <= u32::MAX as u64,
        CpuMode::Long => true,
    };

    if in_range {
        Ok(())
    } else {
        Err(Error::EntryPointOutOfRange { mode, entry })
    }
}

/// Program one segment register for the given mode.
///
/// Applied identically to CS and the five data segments; only the selector
/// and descriptor type differ between code and data. Fields not listed in
/// the match (present, dpl, s, avl) keep whatever the kernel's initial vCPU
/// state holds.
fn setup_segment(seg: &mut kvm_segment, mode: CpuMode, is_code: bool) {
    seg.base = 0;
    seg.selector = match (mode, is_code) {
        (CpuMode::Real, _) => 0,
        (_, true) => CODE_SELECTOR,
        (_, false) => DATA_SELECTOR,
    };
    seg.limit = if mode == CpuMode::Real { 0xFFFF } else { 0xFFFF_FFFF };
    seg.type_ = if is_code { SEG_TYPE_CODE } else { SEG_TYPE_DATA };
    seg.db = (mode == CpuMode::Protected) as u8;
    seg.l = (mode == CpuMode::Long) as u8;
    seg.g = (mode != CpuMode::Real) as u8;
}

/// Transform fetched register banks into the desired boot state.
///
/// `regs` and `sregs` must hold the kernel's initial vCPU state; control
/// registers and EFER are modified additively on top of it. `cr3` is the
/// page-table root loaded in long mode (either the constructed identity map
/// or a preloaded table supplied by the guest image); the other modes
/// ignore it.
pub fn configure_boot_state(
    mode: CpuMode,
    entry: u64,
    cr3: u64,
    regs: &mut kvm_regs,
    sregs: &mut kvm_sregs,
) -> Result<()> {
    check_entry_point(mode, entry)?;

    match mode {
        CpuMode::Real => {}
        CpuMode::Protected => {
            sregs.cr0 |= CR0_PE;
        }
        CpuMode::Long => {
            sregs.cr3 = cr3;
            sregs.cr0 |= CR0_PE | CR0_PG;
            sregs.cr4 |= CR4_PAE;
            sregs.efer |= EFER_LME | EFER_LMA;
        }
    }

    regs.rip = entry;

    setup_segment(&mut sregs.cs, mode, true);
    setup_segment(&mut sregs.ds, mode, false);
    setup_segment(&mut sregs.es, mode, false);
    setup_segment(&mut sregs.fs, mode, false);
    setup_segment(&mut sregs.gs, mode, false);
    setup_segment(&mut sregs.ss, mode, false);

    Ok(())
}
