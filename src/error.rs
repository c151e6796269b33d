//! Error types for blankvm.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::cpu::CpuMode;

/// Result type alias using blankvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running a VM.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors. These are rejected before any KVM interaction.
    #[error("invalid memory size {0:#x}: must be a positive multiple of 4096")]
    InvalidMemorySize(u64),

    #[error("entry point {entry:#x} is out of range for {mode} mode")]
    EntryPointOutOfRange { mode: CpuMode, entry: u64 },

    // Kernel/host errors.
    #[error("KVM is not available: {0}")]
    KvmUnavailable(#[source] kvm_ioctls::Error),

    #[error("{op} failed: {source}")]
    Kvm {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to allocate {size} bytes of guest memory: {source}")]
    MemoryAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to load image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // Host-side serial stream errors.
    #[error("serial console I/O failed: {0}")]
    Console(#[source] io::Error),

    // Guest-caused fatal exits. Full diagnostics have already been written
    // to stderr by the time this is returned.
    #[error("unhandled VM exit: {0}")]
    UnhandledExit(String),
}
