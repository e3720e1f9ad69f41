use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::macho::{SECT_DATA_DATA, SECT_KLD_TEXT, SECT_TEXT_TEXT};
use crate::memory::{AddressWindow, PhysicalMemory};

/// Configuration for [`crate::Loader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoaderConfig {
    /// Physical range where the kernel and its data are loaded.
    pub kernel_window: AddressWindow,
    /// Physical range reserved for the hibernation area.
    pub hibernation_window: AddressWindow,
    /// Copy the kernel's symbol table to kernel memory after loading it.
    pub preserve_symbol_table: bool,
    /// Patches applied to the kernel code, in priority order. Ignored unless
    /// the `patching` feature is enabled.
    pub patch_sites: Vec<PatchSite>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            kernel_window: AddressWindow::KERNEL,
            hibernation_window: AddressWindow::HIBERNATION,
            preserve_symbol_table: true,
            patch_sites: Vec::new(),
        }
    }
}

impl LoaderConfig {
    /// Creates a zero-filled [`PhysicalMemory`] that backs the windows in
    /// this configuration. See [`PhysicalMemory::new`].
    pub fn physical_memory(&self) -> Result<PhysicalMemory, Error> {
        PhysicalMemory::new(self.kernel_window, self.hibernation_window)
    }
}

/// A patch applied to the code of some kernel function.
///
/// The patcher looks for a symbol named `symbol` in section `section`, and
/// scans the `window` bytes that follow the symbol's address looking for the
/// first occurrence of `target`. That occurrence is replaced with
/// `replacement`, and the 8-byte words at each of the `zero_offsets` past the
/// occurrence are set to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchSite {
    /// Mangled name of the function to patch.
    pub symbol: String,
    /// Section number the symbol must belong to.
    pub section: u8,
    /// Number of bytes scanned after the symbol's address.
    pub window: u64,
    /// 8-byte pattern to look for.
    #[serde(with = "hex")]
    pub target: u64,
    /// Value that replaces the pattern.
    #[serde(with = "hex")]
    pub replacement: u64,
    /// Offsets, relative to the pattern, of additional words that are zeroed.
    #[serde(default)]
    pub zero_offsets: Vec<u64>,
    /// Apply the patch only if the CPU's C-state configuration MSR is
    /// locked.
    #[serde(default)]
    pub requires_msr_lock: bool,
    /// Disabled sites are ignored.
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl PatchSite {
    /// Patch for `OSKext::loadExecutable()`, used for enabling the loading
    /// of unsigned kernel extensions.
    pub fn load_executable(target: u64, replacement: u64) -> Self {
        Self {
            symbol: "__ZN6OSKext14loadExecutableEv".to_string(),
            section: SECT_TEXT_TEXT,
            window: 0x300,
            target,
            replacement,
            zero_offsets: Vec::new(),
            requires_msr_lock: false,
            enabled: true,
        }
    }

    /// Patch for the `xcpm_core_scope_msrs` table, it removes the entries
    /// that write to a locked `MSR_PKG_CST_CONFIG_CONTROL`.
    pub fn xcpm_core_scope_msrs(target: u64) -> Self {
        Self {
            symbol: "_xcpm_core_scope_msrs".to_string(),
            section: SECT_DATA_DATA,
            window: 0x3f,
            target,
            replacement: 0,
            zero_offsets: vec![0x30, 0x60],
            requires_msr_lock: true,
            enabled: true,
        }
    }

    /// Patch for `KLDBootstrap::readStartupExtensions()`, used for loading
    /// extra kernel extensions with prelinked kernels.
    pub fn read_startup_extensions(target: u64, replacement: u64) -> Self {
        Self {
            symbol: "__ZN12KLDBootstrap21readStartupExtensionsEv".to_string(),
            section: SECT_KLD_TEXT,
            window: 0x3f,
            target,
            replacement,
            zero_offsets: Vec::new(),
            requires_msr_lock: false,
            enabled: true,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Patterns are written as hex strings in configuration files, TOML
/// integers can't hold values above `i64::MAX`.
mod hex {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &u64,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#018x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.trim_start_matches("0x").replace('_', "");
        u64::from_str_radix(&digits, 16).map_err(D::Error::custom)
    }
}
