//! Diagnostic state dump for fatal VM exits.
//!
//! When the guest stops for anything the serial port cannot service, the
//! full machine state goes to stderr: the exit reason and its decoded
//! payload, both register banks, the segment descriptors, and the control
//! registers. The dump is best-effort; a register bank that cannot be read
//! back is noted and the rest still prints.

use std::io::Write;

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

use crate::kvm::{Vcpu, VmExitRecord};

/// Exit reason names from the kernel's KVM header, indexed by reason code.
const EXIT_REASON_NAMES: [&str; 28] = [
    "KVM_EXIT_UNKNOWN",
    "KVM_EXIT_EXCEPTION",
    "KVM_EXIT_IO",
    "KVM_EXIT_HYPERCALL",
    "KVM_EXIT_DEBUG",
    "KVM_EXIT_HLT",
    "KVM_EXIT_MMIO",
    "KVM_EXIT_IRQ_WINDOW_OPEN",
    "KVM_EXIT_SHUTDOWN",
    "KVM_EXIT_FAIL_ENTRY",
    "KVM_EXIT_INTR",
    "KVM_EXIT_SET_TPR",
    "KVM_EXIT_TPR_ACCESS",
    "KVM_EXIT_S390_SIEIC",
    "KVM_EXIT_S390_RESET",
    "KVM_EXIT_DCR",
    "KVM_EXIT_NMI",
    "KVM_EXIT_INTERNAL_ERROR",
    "KVM_EXIT_OSI",
    "KVM_EXIT_PAPR_HCALL",
    "KVM_EXIT_S390_UCONTROL",
    "KVM_EXIT_WATCHDOG",
    "KVM_EXIT_S390_TSCH",
    "KVM_EXIT_EPR",
    "KVM_EXIT_SYSTEM_EVENT",
    "KVM_EXIT_S390_STSI",
    "KVM_EXIT_IOAPIC_EOI",
    "KVM_EXIT_HYPERV",
];

/// Look up the name for a reason code; "UNKNOWN" when out of range.
pub fn exit_reason_name(code: u32) -> &'static str {
    EXIT_REASON_NAMES
        .get(code as usize)
        .copied()
        .unwrap_or("UNKNOWN")
}

/// Dump the exit and full vCPU state to `w`, best-effort.
pub fn dump_vm_state(vcpu: &Vcpu, exit: &VmExitRecord, w: &mut dyn Write) {
    let _ = writeln!(w, "===== BEGIN VM STATE =====");
    let _ = write_exit(w, exit);

    match vcpu.get_regs() {
        Ok(regs) => {
            let _ = write_regs(w, &regs);
        }
        Err(e) => {
            let _ = writeln!(w, "failed to read registers: {e}");
        }
    }

    match vcpu.get_sregs() {
        Ok(sregs) => {
            let _ = write_sregs(w, &sregs);
        }
        Err(e) => {
            let _ = writeln!(w, "failed to read special registers: {e}");
        }
    }

    let _ = writeln!(w, "===== END VM STATE =====");
    let _ = writeln!(w);
}

fn write_exit(w: &mut dyn Write, exit: &VmExitRecord) -> std::io::Result<()> {
    match exit.reason_code() {
        Some(code) => writeln!(w, "Exit reason: {} ({})", code, exit_reason_name(code))?,
        None => writeln!(w, "Exit reason: {}", exit.describe())?,
    }
    writeln!(w)?;

    match exit {
        VmExitRecord::Io {
            write: true,
            port,
            len,
            data,
        } => {
            write!(w, "Write {len} bytes at port {port:04x}: ")?;
            write_hex(w, data)?;
            writeln!(w, "\n")?;
        }
        VmExitRecord::Io {
            write: false,
            port,
            len,
            ..
        } => {
            writeln!(w, "Read {len} bytes at port {port:04x}\n")?;
        }
        VmExitRecord::Mmio {
            write: true,
            addr,
            len,
            data,
        } => {
            write!(w, "Write {len} bytes at {addr:016x}: ")?;
            write_hex(w, data)?;
            writeln!(w, "\n")?;
        }
        VmExitRecord::Mmio {
            write: false,
            addr,
            len,
            ..
        } => {
            writeln!(w, "Read {len} bytes at {addr:016x}\n")?;
        }
        VmExitRecord::FailEntry { reason } => {
            writeln!(w, "Hardware entry failure reason: {reason:#x}\n")?;
        }
        VmExitRecord::SystemEvent { kind } => {
            writeln!(w, "System event type: {kind}\n")?;
        }
        _ => {}
    }

    Ok(())
}

fn write_hex(w: &mut dyn Write, data: &[u8]) -> std::io::Result<()> {
    for byte in data {
        write!(w, "{byte:02x} ")?;
    }
    Ok(())
}

fn write_regs(w: &mut dyn Write, r: &kvm_regs) -> std::io::Result<()> {
    writeln!(
        w,
        "RAX={:016x} RBX={:016x} RCX={:016x} RDX={:016x}",
        r.rax, r.rbx, r.rcx, r.rdx
    )?;
    writeln!(
        w,
        "RSI={:016x} RDI={:016x} RSP={:016x} RBP={:016x}",
        r.rsi, r.rdi, r.rsp, r.rbp
    )?;
    writeln!(
        w,
        "R8 ={:016x} R9 ={:016x} R10={:016x} R11={:016x}",
        r.r8, r.r9, r.r10, r.r11
    )?;
    writeln!(
        w,
        "R12={:016x} R13={:016x} R14={:016x} R15={:016x}",
        r.r12, r.r13, r.r14, r.r15
    )?;
    writeln!(w, "RIP={:016x} RFL={:016x}\n", r.rip, r.rflags)
}

fn write_segment(w: &mut dyn Write, name: &str, s: &kvm_segment) -> std::io::Result<()> {
    write!(
        w,
        "{name} BASE={:016x} LIM={:08x} SEL={:04x} ",
        s.base, s.limit, s.selector
    )?;
    writeln!(
        w,
        "TP={:x} P={:x} DPL={:x} DB={:x} S={:x} L={:x} G={:x} A={:x}",
        s.type_, s.present, s.dpl, s.db, s.s, s.l, s.g, s.avl
    )
}

fn write_sregs(w: &mut dyn Write, s: &kvm_sregs) -> std::io::Result<()> {
    write_segment(w, "CS ", &s.cs)?;
    write_segment(w, "DS ", &s.ds)?;
    write_segment(w, "ES ", &s.es)?;
    write_segment(w, "FS ", &s.fs)?;
    write_segment(w, "GS ", &s.gs)?;
    write_segment(w, "SS ", &s.ss)?;
    write_segment(w, "TR ", &s.tr)?;
    write_segment(w, "LDT", &s.ldt)?;
    write!(w, "GDT BASE={:016x} LIM={:04x}        ", s.gdt.base, s.gdt.limit)?;
    writeln!(w, "IDT BASE={:016x} LIM={:04x}\n", s.idt.base, s.idt.limit)?;

    writeln!(
        w,
        "CR0={:016x} CR2={:016x} CR3={:016x} CR4={:016x}",
        s.cr0, s.cr2, s.cr3, s.cr4
    )?;
    writeln!(
        w,
        "CR8={:016x} EFER={:016x} APIC={:016x}",
        s.cr8, s.efer, s.apic_base
    )?;
    writeln!(
        w,
        "INT BITMAP {:016x} {:016x} {:016x} {:016x}",
        s.interrupt_bitmap[0],
        s.interrupt_bitmap[1],
        s.interrupt_bitmap[2],
        s.interrupt_bitmap[3]
    )
}
