pub const CONFIG_FILE: &str = r#"Config file for mload

Specifies a config file which controls the behavior of the loader. If config file is not
specified, ${HOME}/.machload.toml is used. If it does not exist the default options are
applied.

Example:

[loader]
preserve_symbol_table = true

[loader.kernel_window]
base = 0x100000
len = 0x8000000

[[loader.patch_sites]]
symbol = "__ZN6OSKext14loadExecutableEv"
section = 1
window = 0x300
target = "0x..."
replacement = "0x..."

[cpu]
cst_config_msr_locked = false"#;

pub const LOAD_LONG_HELP: &str = r#"Load a kernel image into simulated physical memory

The kernel is loaded the same way the boot loader does it: segments are copied to their
physical addresses, the entry point and kernel version are extracted, and the symbol
table is copied to kernel memory. If <KERNEL> is a FAT binary, the slice for the
architecture specified with `--arch` is used."#;

pub const PATCH_LONG_HELP: &str = r#"Apply the patch sites defined in the config file

Without this flag the kernel code is never modified, even if the config file defines
patch sites."#;

pub const THIN_LONG_HELP: &str = r#"Extract a single architecture from a FAT binary

Writes the slice of <KERNEL> that corresponds to the architecture specified with
`--arch` to <OUTPUT_FILE>."#;
