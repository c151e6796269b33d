//! KVM virtual machine wrapper.

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;

use super::Vcpu;
use crate::error::{Error, Result};
use crate::memory::GuestMemory;

/// A KVM virtual machine: the guest physical address space plus its vCPU.
pub struct Vm {
    fd: VmFd,
}

impl Vm {
    pub(crate) fn new(fd: VmFd) -> Self {
        Self { fd }
    }

    /// Register a host mapping as a slot of guest physical memory.
    ///
    /// Guest accesses to `[guest_base, guest_base + memory.size())` then hit
    /// the host mapping directly.
    ///
    /// # Safety
    ///
    /// The caller must keep `memory` mapped for as long as the slot is
    /// registered; the kernel keeps using the host range after this call
    /// returns.
    pub unsafe fn register_memory(
        &self,
        slot: u32,
        guest_base: u64,
        memory: &GuestMemory,
    ) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_base,
            memory_size: memory.size() as u64,
            userspace_addr: memory.as_ptr() as u64,
            flags: 0,
        };

        unsafe { self.fd.set_user_memory_region(region) }.map_err(|source| Error::Kvm {
            op: "KVM_SET_USER_MEMORY_REGION",
            source,
        })
    }

    /// Create the VM's single vCPU.
    ///
    /// The returned wrapper owns the vCPU file descriptor and the shared
    /// run-state mapping the kernel sizes via KVM_GET_VCPU_MMAP_SIZE.
    pub fn create_vcpu(&self) -> Result<Vcpu> {
        let fd = self.fd.create_vcpu(0).map_err(|source| Error::Kvm {
            op: "KVM_CREATE_VCPU",
            source,
        })?;
        Ok(Vcpu::new(fd))
    }
}
