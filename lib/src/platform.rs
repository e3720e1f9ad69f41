/*! State shared between the loader and the rest of the boot loader.

Everything the loader reads from, or writes to, outside of the kernel image
itself lives in a [`BootContext`]. A context is created once per boot
attempt and discarded when control is transferred to the kernel.
*/
use serde::{Deserialize, Serialize};

use crate::memory::PhysicalMemory;

/// CPU type for 32-bits Intel processors.
pub const CPU_TYPE_X86: u32 = 0x00000007;
/// CPU type for 64-bits Intel processors.
pub const CPU_TYPE_X86_64: u32 = 0x01000007;

/// Version of the loaded kernel, as found in its `_version_major`,
/// `_version_minor` and `_version_revision` symbols.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct KernelVersion {
    /// Major version (Darwin version, e.g. 14 for OS X 10.10).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Revision.
    pub revision: u8,
}

/// CPU features that affect kernel patching.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CpuState {
    /// `MSR_PKG_CST_CONFIG_CONTROL` is locked by the firmware.
    pub cst_config_msr_locked: bool,
}

/// Description of the platform being booted.
#[derive(Debug, Clone)]
pub struct Platform {
    /// CPU type the kernel must be loaded for.
    pub arch_cpu_type: u32,
    /// CPU lock state.
    pub cpu: CpuState,
    /// Filled by the loader when it finds the kernel's version symbols.
    pub kernel: KernelVersion,
}

impl Platform {
    /// Creates a platform for the given CPU type.
    pub fn new(arch_cpu_type: u32) -> Self {
        Self {
            arch_cpu_type,
            cpu: CpuState::default(),
            kernel: KernelVersion::default(),
        }
    }
}

/// Mutable state for one boot attempt.
pub struct BootContext {
    /// The platform the kernel is loaded for.
    pub platform: Platform,
    /// Physical memory where segments are placed.
    pub memory: PhysicalMemory,
    /// Whether the boot loader should load kernel extensions on its own.
    /// It starts as `true` and is set to `false` when the kernel turns out
    /// to be a prelinked one. It never goes back to `true`.
    pub load_kernel_drivers: bool,
}

impl BootContext {
    /// Creates a new context.
    pub fn new(platform: Platform, memory: PhysicalMemory) -> Self {
        Self { platform, memory, load_kernel_drivers: true }
    }
}
