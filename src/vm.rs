//! VM lifecycle orchestration.
//!
//! [`BlankVm`] owns every resource a run needs and acquires them in a fixed
//! order: hypervisor handle, VM, guest RAM, vCPU, and (for long mode
//! without a preloaded table) the page-table region. Struct field order
//! encodes the reverse teardown: the vCPU and its run-state mapping are
//! released first, then the VM and hypervisor handles, then the host
//! mappings, on every exit path alike.

use std::io;

use crate::config::VmConfig;
use crate::cpu::{self, CpuMode};
use crate::debug_boot;
use crate::diag;
use crate::error::{Error, Result};
use crate::kvm::{self, Hypervisor, Step, Vcpu};
use crate::memory::GuestMemory;
use crate::paging::{self, IdentityMapLayout};
use crate::serial::SerialConsole;

/// Memory slot holding guest RAM at guest physical 0.
const RAM_SLOT: u32 = 0;
/// Memory slot holding the constructed page tables, directly above RAM.
const PAGE_TABLE_SLOT: u32 = 1;

/// A fully assembled virtual machine, ready to load and boot one image.
pub struct BlankVm {
    // Field order is teardown order.
    vcpu: Vcpu,
    vm: kvm::Vm,
    // Held so the device handle outlives every kernel object created from it.
    #[allow(dead_code)]
    hypervisor: Hypervisor,
    memory: GuestMemory,
    page_table: Option<GuestMemory>,
    config: VmConfig,
}

impl BlankVm {
    /// Validate `config` and assemble the VM: open KVM, register guest RAM
    /// as slot 0, create the single vCPU.
    ///
    /// Validation happens before the first KVM call, so a bad configuration
    /// never touches the kernel.
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate()?;

        let hypervisor = Hypervisor::new()?;
        let vm = hypervisor.create_vm()?;

        let memory = GuestMemory::new(config.memory_size as usize)?;
        // Safety: `memory` is held by this struct and outlives `vm`.
        unsafe { vm.register_memory(RAM_SLOT, 0, &memory)? };

        let run_state_size = hypervisor.run_state_size()?;
        let vcpu = vm.create_vcpu()?;
        debug_boot!(
            "vm created: {:#x} bytes RAM, run state {} bytes",
            config.memory_size,
            run_state_size
        );

        Ok(Self {
            vcpu,
            vm,
            hypervisor,
            memory,
            page_table: None,
            config,
        })
    }

    /// Load the configured image at guest physical 0. Returns the number of
    /// bytes loaded.
    pub fn load_image(&mut self) -> Result<usize> {
        let loaded = self.memory.load_image(&self.config.image)?;
        debug_boot!(
            "loaded {} bytes from {}",
            loaded,
            self.config.image.display()
        );
        Ok(loaded)
    }

    /// Program the vCPU for the configured mode and entry point.
    ///
    /// Fetches the kernel's initial register banks, applies the mode
    /// transformation, and pushes both banks back in one step. Long mode
    /// without a preloaded table gets its identity map built and registered
    /// here.
    pub fn prepare_boot(&mut self) -> Result<()> {
        let mut regs = self.vcpu.get_regs()?;
        let mut sregs = self.vcpu.get_sregs()?;

        let cr3 = match (self.config.mode, self.config.page_table) {
            (CpuMode::Long, Some(base)) => base,
            (CpuMode::Long, None) => self.build_page_table()?,
            _ => 0,
        };

        cpu::configure_boot_state(
            self.config.mode,
            self.config.entry_point,
            cr3,
            &mut regs,
            &mut sregs,
        )?;

        self.vcpu.set_regs(&regs)?;
        self.vcpu.set_sregs(&sregs)?;

        debug_boot!(
            "{} mode, entry point {:#x}",
            self.config.mode,
            self.config.entry_point
        );
        Ok(())
    }

    /// Build the identity map for all of RAM and expose it as slot 1 at
    /// guest physical `memory_size`. Returns the CR3 to load.
    fn build_page_table(&mut self) -> Result<u64> {
        let layout = IdentityMapLayout::for_memory(self.config.memory_size);
        let mut region = GuestMemory::new(layout.size_bytes() as usize)?;

        let guest_base = self.config.memory_size;
        let cr3 = paging::write_identity_map(
            &layout,
            self.config.memory_size,
            guest_base,
            region.as_mut_slice(),
        );

        // Safety: the region is held in `self.page_table` and outlives `vm`.
        unsafe { self.vm.register_memory(PAGE_TABLE_SLOT, guest_base, &region)? };
        self.page_table = Some(region);

        debug_boot!(
            "identity map: {} frames at {:#x}, cr3 {:#x}",
            layout.total_frames(),
            guest_base,
            cr3
        );
        Ok(cr3)
    }

    /// Run the guest until serial-input EOF (success) or a fatal exit.
    ///
    /// A fatal exit dumps full diagnostics to stderr before returning the
    /// error.
    pub fn run(&mut self, console: &mut SerialConsole) -> Result<()> {
        loop {
            match self.vcpu.run_once(console)? {
                Step::Continue => {}
                Step::Eof => return Ok(()),
                Step::Fatal(exit) => {
                    diag::dump_vm_state(&self.vcpu, &exit, &mut io::stderr().lock());
                    return Err(Error::UnhandledExit(exit.describe()));
                }
            }
        }
    }

    /// Access the vCPU, e.g. to inspect registers after a run.
    pub fn vcpu(&self) -> &Vcpu {
        &self.vcpu
    }

    /// Access guest RAM.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// The constructed page-table region, present only after a long-mode
    /// boot without a preloaded table.
    pub fn page_table_region(&self) -> Option<&GuestMemory> {
        self.page_table.as_ref()
    }
}

/// Build, load, and run a VM in one call: the whole lifecycle of the CLI.
pub fn execute_image(config: VmConfig, console: &mut SerialConsole) -> Result<()> {
    let mut vm = BlankVm::new(config)?;
    vm.load_image()?;
    vm.prepare_boot()?;
    vm.run(console)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// True when this host can actually create VMs, not merely when
    /// /dev/kvm exists. Tests touching the kernel skip themselves
    /// otherwise.
    fn kvm_usable() -> bool {
        kvm::is_available() && Hypervisor::new().and_then(|h| h.create_vm()).is_ok()
    }

    fn write_temp_image(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "blankvm-test-{}-{}.img",
            std::process::id(),
            name
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    struct SharedWriter {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl io::Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn console_with(input: &[u8]) -> (SerialConsole, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let console = SerialConsole::with_streams(
            Box::new(Cursor::new(input.to_vec())),
            Box::new(SharedWriter {
                data: output.clone(),
            }),
        );
        (console, output)
    }

    fn run_image(config: VmConfig, input: &[u8]) -> (Result<()>, Vec<u8>) {
        let (mut console, output) = console_with(input);
        let result = execute_image(config, &mut console);
        let bytes = output.lock().unwrap().clone();
        (result, bytes)
    }

    #[test]
    fn test_bad_entry_point_never_reaches_kvm() {
        // Runs everywhere: validation rejects the config before any KVM
        // interaction, so no /dev/kvm is needed.
        let mut config = VmConfig::new("/nonexistent/guest.img");
        config.entry_point = 0x2_0000;
        assert!(matches!(
            BlankVm::new(config),
            Err(Error::EntryPointOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unaligned_memory_size_rejected() {
        let mut config = VmConfig::new("/nonexistent/guest.img");
        config.memory_size = 12345;
        assert!(matches!(
            BlankVm::new(config),
            Err(Error::InvalidMemorySize(_))
        ));
    }

    #[test]
    fn test_real_mode_hello() {
        if !kvm_usable() {
            return;
        }

        // mov dx, 0x3f8; mov al, 'H'; out; mov al, 'i'; out; in al, dx
        let image = write_temp_image(
            "real-hello",
            &[0xBA, 0xF8, 0x03, 0xB0, b'H', 0xEE, 0xB0, b'i', 0xEE, 0xEC],
        );
        let config = VmConfig::new(&image);

        let (result, output) = run_image(config, b"");
        std::fs::remove_file(&image).ok();

        result.unwrap();
        assert_eq!(output, b"Hi");
    }

    #[test]
    fn test_real_mode_echo() {
        if !kvm_usable() {
            return;
        }

        // mov dx, 0x3f8; loop: in al, dx; out dx, al; jmp loop
        let image = write_temp_image("real-echo", &[0xBA, 0xF8, 0x03, 0xEC, 0xEE, 0xEB, 0xFC]);
        let config = VmConfig::new(&image);

        let (result, output) = run_image(config, b"abc");
        std::fs::remove_file(&image).ok();

        result.unwrap();
        assert_eq!(output, b"abc");
    }

    #[test]
    fn test_protected_mode_hello() {
        if !kvm_usable() {
            return;
        }

        // mov edx, 0x3f8; mov al, 'A'; out; in al, dx
        let image = write_temp_image(
            "prot-hello",
            &[0xBA, 0xF8, 0x03, 0x00, 0x00, 0xB0, b'A', 0xEE, 0xEC],
        );
        let mut config = VmConfig::new(&image);
        config.mode = CpuMode::Protected;

        let (result, output) = run_image(config, b"");
        std::fs::remove_file(&image).ok();

        result.unwrap();
        assert_eq!(output, b"A");
    }

    #[test]
    fn test_long_mode_hello_with_built_tables() {
        if !kvm_usable() {
            return;
        }

        // Same encoding is valid 64-bit code.
        let image = write_temp_image(
            "long-hello",
            &[0xBA, 0xF8, 0x03, 0x00, 0x00, 0xB0, b'L', 0xEE, 0xEC],
        );
        let mut config = VmConfig::new(&image);
        config.mode = CpuMode::Long;

        let (result, output) = run_image(config, b"");
        std::fs::remove_file(&image).ok();

        result.unwrap();
        assert_eq!(output, b"L");
    }

    #[test]
    fn test_long_mode_with_preloaded_tables() {
        if !kvm_usable() {
            return;
        }

        // The image carries its own identity map for the first megabyte:
        // PML4 at 0x1000, PDPT at 0x2000, PD at 0x3000, PT at 0x4000,
        // code at 0x5000.
        let mut image = vec![0u8; 0x5000 + 16];
        image[0x1000..0x1008].copy_from_slice(&0x2003u64.to_le_bytes());
        image[0x2000..0x2008].copy_from_slice(&0x3003u64.to_le_bytes());
        image[0x3000..0x3008].copy_from_slice(&0x4003u64.to_le_bytes());
        for i in 0u64..256 {
            let off = 0x4000 + (i as usize) * 8;
            image[off..off + 8].copy_from_slice(&(i * 4096 + 3).to_le_bytes());
        }
        image[0x5000..0x5009]
            .copy_from_slice(&[0xBA, 0xF8, 0x03, 0x00, 0x00, 0xB0, b'P', 0xEE, 0xEC]);

        let path = write_temp_image("long-preloaded", &image);
        let mut config = VmConfig::new(&path);
        config.mode = CpuMode::Long;
        config.page_table = Some(0x1000);
        config.entry_point = 0x5000;

        let (result, output) = run_image(config, b"");
        std::fs::remove_file(&path).ok();

        result.unwrap();
        assert_eq!(output, b"P");
    }

    #[test]
    fn test_lifecycle_step_by_step() {
        if !kvm_usable() {
            return;
        }

        let code = [0xBA, 0xF8, 0x03, 0x00, 0x00, 0xB0, b'S', 0xEE, 0xEC];
        let image = write_temp_image("lifecycle", &code);
        let mut config = VmConfig::new(&image);
        config.mode = CpuMode::Long;
        let memory_size = config.memory_size;

        let mut vm = BlankVm::new(config).unwrap();
        let loaded = vm.load_image().unwrap();
        std::fs::remove_file(&image).ok();

        assert_eq!(loaded, code.len());
        assert_eq!(&vm.memory().as_slice()[..loaded], &code);
        assert!(vm.memory().as_slice()[loaded..].iter().all(|&b| b == 0));

        vm.prepare_boot().unwrap();

        // The identity map sits directly above RAM; CR3 names its last frame.
        let layout = IdentityMapLayout::for_memory(memory_size);
        let region = vm.page_table_region().unwrap();
        assert_eq!(region.size() as u64, layout.size_bytes());
        let sregs = vm.vcpu().get_sregs().unwrap();
        assert_eq!(sregs.cr3, memory_size + layout.root_offset());

        let (mut console, output) = console_with(b"");
        vm.run(&mut console).unwrap();
        assert_eq!(&*output.lock().unwrap(), b"S");
    }

    #[test]
    fn test_halt_is_fatal() {
        if !kvm_usable() {
            return;
        }

        let image = write_temp_image("halt", &[0xF4]);
        let config = VmConfig::new(&image);

        let (result, output) = run_image(config, b"");
        std::fs::remove_file(&image).ok();

        match result {
            Err(Error::UnhandledExit(reason)) => assert!(reason.contains("KVM_EXIT_HLT")),
            other => panic!("expected unhandled-exit error, got {other:?}"),
        }
        assert!(output.is_empty());
    }

    #[test]
    fn test_stray_port_is_fatal() {
        if !kvm_usable() {
            return;
        }

        // mov dx, 0x80; mov al, 1; out dx, al
        let image = write_temp_image("stray-port", &[0xBA, 0x80, 0x00, 0xB0, 0x01, 0xEE]);
        let config = VmConfig::new(&image);

        let (result, _) = run_image(config, b"");
        std::fs::remove_file(&image).ok();

        match result {
            Err(Error::UnhandledExit(reason)) => assert!(reason.contains("KVM_EXIT_IO")),
            other => panic!("expected unhandled-exit error, got {other:?}"),
        }
    }
}
