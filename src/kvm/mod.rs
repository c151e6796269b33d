//! Linux KVM access layer.
//!
//! Thin owned wrappers over the rust-vmm kvm-ioctls handles, one per kernel
//! object: [`Hypervisor`] for /dev/kvm, [`Vm`] for the VM file descriptor,
//! [`Vcpu`] for the vCPU and its shared run-state mapping. Each wrapper
//! releases its kernel object on drop, so teardown order is simply drop
//! order.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Access to /dev/kvm
//! - CPU with VT-x (Intel) or AMD-V (AMD)

mod vcpu;
mod vm;

pub use vcpu::{Step, Vcpu, VmExitRecord};
pub use vm::Vm;

use kvm_ioctls::Kvm;

use crate::error::{Error, Result};

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    std::path::Path::new("/dev/kvm").exists()
}

/// Handle on the kernel virtualization device.
pub struct Hypervisor {
    kvm: Kvm,
}

impl Hypervisor {
    /// Open /dev/kvm read-write.
    ///
    /// Fails when the module is missing or the device is not accessible to
    /// this process.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmUnavailable)?;
        Ok(Self { kvm })
    }

    /// Size of the shared vCPU run-state region, as reported by the kernel.
    pub fn run_state_size(&self) -> Result<usize> {
        self.kvm.get_vcpu_mmap_size().map_err(|source| Error::Kvm {
            op: "KVM_GET_VCPU_MMAP_SIZE",
            source,
        })
    }

    /// Create a VM within this handle.
    pub fn create_vm(&self) -> Result<Vm> {
        let fd = self.kvm.create_vm().map_err(|source| Error::Kvm {
            op: "KVM_CREATE_VM",
            source,
        })?;
        Ok(Vm::new(fd))
    }
}
