//! Virtual CPU management and exit dispatch.
//!
//! The vCPU runs in a loop: enter guest context with the run ioctl, come
//! back on the next VM exit, service it or give up. The only exits this
//! hypervisor services are single-byte reads and writes on the serial port;
//! everything else is captured as an owned [`VmExitRecord`] so diagnostics
//! can read back the register banks after the run-state borrow ends.
//!
//! The shared run-state region (exit reason plus exit-specific payload) is
//! mapped and owned by the underlying `VcpuFd`; kvm-ioctls surfaces it as
//! the tagged `VcpuExit` variant, with I/O payload slices pointing into the
//! mapping. Host code only touches the region between run invocations,
//! which is the rendezvous KVM requires.

use kvm_bindings::{
    kvm_regs, kvm_sregs, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO,
    KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN, KVM_EXIT_SYSTEM_EVENT,
};
use kvm_ioctls::{VcpuExit, VcpuFd};

use crate::debug_exit;
use crate::diag;
use crate::error::{Error, Result};
use crate::serial::{SerialConsole, SERIAL_PORT};

/// Outcome of one run-and-dispatch round.
#[derive(Debug)]
pub enum Step {
    /// A serial byte was serviced; run again.
    Continue,
    /// Host input reached end of file; the run is complete.
    Eof,
    /// An exit the serial port cannot service; fatal.
    Fatal(VmExitRecord),
}

/// An exit captured for diagnostics, decoupled from the run-state mapping.
#[derive(Debug)]
pub enum VmExitRecord {
    /// Port I/O that is not a single-byte serial access. Payload bytes are
    /// only present for writes; on a read the guest is still waiting for
    /// the data.
    Io {
        write: bool,
        port: u16,
        len: usize,
        data: Vec<u8>,
    },
    /// Memory-mapped I/O; always fatal here, no devices are emulated.
    Mmio {
        write: bool,
        addr: u64,
        len: usize,
        data: Vec<u8>,
    },
    /// Guest executed HLT.
    Hlt,
    /// Triple fault or explicit shutdown request.
    Shutdown,
    /// Hardware refused to enter guest mode.
    FailEntry { reason: u64 },
    /// KVM internal error.
    InternalError,
    /// System event (reset, panic, ...).
    SystemEvent { kind: u32 },
    /// Any exit this hypervisor does not model; keeps the library's
    /// rendering of the reason.
    Unclassified { summary: String },
}

impl VmExitRecord {
    /// The KVM_EXIT_* reason code, where one exit reason maps cleanly.
    pub fn reason_code(&self) -> Option<u32> {
        match self {
            VmExitRecord::Io { .. } => Some(KVM_EXIT_IO),
            VmExitRecord::Mmio { .. } => Some(KVM_EXIT_MMIO),
            VmExitRecord::Hlt => Some(KVM_EXIT_HLT),
            VmExitRecord::Shutdown => Some(KVM_EXIT_SHUTDOWN),
            VmExitRecord::FailEntry { .. } => Some(KVM_EXIT_FAIL_ENTRY),
            VmExitRecord::InternalError => Some(KVM_EXIT_INTERNAL_ERROR),
            VmExitRecord::SystemEvent { .. } => Some(KVM_EXIT_SYSTEM_EVENT),
            VmExitRecord::Unclassified { .. } => None,
        }
    }

    /// Short form for error messages, e.g. `5 (KVM_EXIT_HLT)`.
    pub fn describe(&self) -> String {
        if let VmExitRecord::Unclassified { summary } = self {
            summary.clone()
        } else {
            let code = self.reason_code().unwrap_or_default();
            format!("{} ({})", code, diag::exit_reason_name(code))
        }
    }
}

/// The VM's single virtual CPU.
pub struct Vcpu {
    fd: VcpuFd,
}

impl Vcpu {
    pub(crate) fn new(fd: VcpuFd) -> Self {
        Self { fd }
    }

    /// Get the general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs> {
        self.fd.get_regs().map_err(|source| Error::Kvm {
            op: "KVM_GET_REGS",
            source,
        })
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.fd.set_regs(regs).map_err(|source| Error::Kvm {
            op: "KVM_SET_REGS",
            source,
        })
    }

    /// Get the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        self.fd.get_sregs().map_err(|source| Error::Kvm {
            op: "KVM_GET_SREGS",
            source,
        })
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        self.fd.set_sregs(sregs).map_err(|source| Error::Kvm {
            op: "KVM_SET_SREGS",
            source,
        })
    }

    /// Run the guest until the next VM exit and dispatch it.
    ///
    /// Single-byte accesses to the serial port are serviced against
    /// `console` in place: an OUT byte goes to the console, an IN byte is
    /// pulled from it into the run-state payload before the next entry. A
    /// failing run ioctl (including EINTR from a host signal) is a
    /// kernel-level error.
    pub fn run_once(&mut self, console: &mut SerialConsole) -> Result<Step> {
        match self.fd.run().map_err(|source| Error::Kvm {
            op: "KVM_RUN",
            source,
        })? {
            VcpuExit::IoOut(port, data) if port == SERIAL_PORT && data.len() == 1 => {
                console.transmit(data[0]).map_err(Error::Console)?;
                Ok(Step::Continue)
            }
            VcpuExit::IoIn(port, data) if port == SERIAL_PORT && data.len() == 1 => {
                match console.receive().map_err(Error::Console)? {
                    Some(byte) => {
                        data[0] = byte;
                        Ok(Step::Continue)
                    }
                    None => {
                        debug_exit!("serial input EOF, shutting down");
                        Ok(Step::Eof)
                    }
                }
            }
            VcpuExit::IoOut(port, data) => Ok(Step::Fatal(VmExitRecord::Io {
                write: true,
                port,
                len: data.len(),
                data: data.to_vec(),
            })),
            VcpuExit::IoIn(port, data) => Ok(Step::Fatal(VmExitRecord::Io {
                write: false,
                port,
                len: data.len(),
                data: Vec::new(),
            })),
            VcpuExit::MmioWrite(addr, data) => Ok(Step::Fatal(VmExitRecord::Mmio {
                write: true,
                addr,
                len: data.len(),
                data: data.to_vec(),
            })),
            VcpuExit::MmioRead(addr, data) => Ok(Step::Fatal(VmExitRecord::Mmio {
                write: false,
                addr,
                len: data.len(),
                data: Vec::new(),
            })),
            VcpuExit::Hlt => Ok(Step::Fatal(VmExitRecord::Hlt)),
            VcpuExit::Shutdown => Ok(Step::Fatal(VmExitRecord::Shutdown)),
            VcpuExit::FailEntry(reason, _) => {
                Ok(Step::Fatal(VmExitRecord::FailEntry { reason }))
            }
            VcpuExit::InternalError => Ok(Step::Fatal(VmExitRecord::InternalError)),
            VcpuExit::SystemEvent(kind, _) => {
                Ok(Step::Fatal(VmExitRecord::SystemEvent { kind }))
            }
            other => Ok(Step::Fatal(VmExitRecord::Unclassified {
                summary: format!("{other:?}"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_match_kvm_header() {
        let hlt = VmExitRecord::Hlt;
        assert_eq!(hlt.reason_code(), Some(5));
        assert_eq!(hlt.describe(), "5 (KVM_EXIT_HLT)");

        let io = VmExitRecord::Io {
            write: true,
            port: 0x80,
            len: 1,
            data: vec![0xAA],
        };
        assert_eq!(io.reason_code(), Some(2));

        let odd = VmExitRecord::Unclassified {
            summary: "IrqWindowOpen".to_string(),
        };
        assert_eq!(odd.reason_code(), None);
        assert_eq!(odd.describe(), "IrqWindowOpen");
    }
}
