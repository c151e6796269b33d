//! # blankvm
//!
//! A minimal KVM-based hypervisor for flat binary guests.
//!
//! blankvm loads a raw image at guest physical address 0, starts a single
//! vCPU in 16-bit real, 32-bit protected, or 64-bit long mode, and runs it
//! until the guest finishes or triggers an exit nothing can service. The
//! guest's only device is a byte-wide serial port at 0x3F8, bridged to the
//! host's standard streams.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blankvm::{execute_image, Result, SerialConsole, VmConfig};
//!
//! fn main() -> Result<()> {
//!     let config = VmConfig::new("guest.img");
//!     let mut console = SerialConsole::new();
//!     execute_image(config, &mut console)
//! }
//! ```
//!
//! ## Platform Support
//!
//! Linux with KVM only; the guest architecture is x86_64 (which subsumes
//! the 16- and 32-bit modes).

mod config;
mod cpu;
pub mod debug;
mod error;
mod vm;

pub mod diag;
pub mod kvm;
pub mod memory;
pub mod paging;
pub mod serial;

// Re-exports
pub use config::{parse_num, VmConfig, DEFAULT_MEMORY_SIZE};
pub use cpu::CpuMode;
pub use error::{Error, Result};
pub use serial::SerialConsole;
pub use vm::{execute_image, BlankVm};

/// Check if the host supports running guests.
///
/// Returns `true` if /dev/kvm is present.
pub fn is_supported() -> bool {
    kvm::is_available()
}
