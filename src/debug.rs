//! Debug logging utilities for blankvm.
//!
//! Set the `BLANKVM_DEBUG` environment variable to enable verbose logging:
//! - `BLANKVM_DEBUG=1` - Enable all debug output
//! - `BLANKVM_DEBUG=boot` - Enable only boot-related logs
//! - `BLANKVM_DEBUG=exit` - Enable only VM-exit dispatch logs
//! - `BLANKVM_DEBUG=boot,exit` - Enable multiple categories
//!
//! Debug output goes to stderr so it never mixes with the guest's serial
//! stream on stdout.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Boot,
    Exit,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    boot: bool,
    exit: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        match std::env::var("BLANKVM_DEBUG") {
            Ok(val) if val == "1" || val.to_lowercase() == "all" => Self {
                enabled: true,
                boot: true,
                exit: true,
            },
            Ok(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    enabled: true,
                    boot: val_lower.contains("boot"),
                    exit: val_lower.contains("exit"),
                }
            }
            Err(_) => Self::default(),
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    let config = get_config();
    if !config.enabled {
        return false;
    }
    match category {
        DebugCategory::All => config.boot || config.exit,
        DebugCategory::Boot => config.boot,
        DebugCategory::Exit => config.exit,
    }
}

/// Debug print macro for boot-related logs
#[macro_export]
macro_rules! debug_boot {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Boot) {
            eprintln!($($arg)*);
        }
    };
}

/// Debug print macro for VM-exit dispatch logs
#[macro_export]
macro_rules! debug_exit {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Exit) {
            eprintln!($($arg)*);
        }
    };
}
