/*! Loader for Mach-O kernel images, as used by x86 boot loaders.

This crate implements the stage of a boot loader that takes a kernel image
already read into memory and prepares it for execution. It selects the
right architecture from FAT (universal) binaries, copies the kernel's
segments to the physical addresses they were linked for, finds the entry
point and the kernel version, and keeps a copy of the kernel's symbol
table in kernel memory. With the `patching` feature it can also patch a few
well-known spots in the kernel code before control is transferred to it.

There's no operating system underneath a boot loader, segments are copied
straight to physical memory. In this crate physical memory is represented by
[`PhysicalMemory`], which owns one buffer for each address window the loader
is allowed to write into.

# Example

```rust,no_run
use machload::{
    select_architecture_slice, BootContext, Error, Loader, LoaderConfig,
    Platform, CPU_TYPE_X86_64,
};

let data = std::fs::read("/System/Library/Kernels/kernel").unwrap();

// Thin the kernel if it's a FAT binary.
let image = match select_architecture_slice(&data, CPU_TYPE_X86_64) {
    Ok(slice) => slice.data,
    Err(Error::BadFatMagic { .. }) => data.as_slice(),
    Err(err) => panic!("{}", err),
};

let config = LoaderConfig::default();

let mut ctx = BootContext::new(
    Platform::new(CPU_TYPE_X86_64),
    config.physical_memory().unwrap(),
);

let kernel = Loader::new(config)
    .decode_and_load_kernel(&mut ctx, image)
    .unwrap();

println!("entry point: {:#x}", kernel.entry);
println!("kernel version: {:?}", ctx.platform.kernel);
```
*/

#![deny(missing_docs)]

pub use config::LoaderConfig;
pub use config::PatchSite;

pub use errors::Error;

pub use loader::select_architecture_slice;
pub use loader::AppliedPatch;
pub use loader::ArchSlice;
pub use loader::LoadedKernel;
pub use loader::Loader;
pub use loader::PreservedSymbolTable;
pub use loader::Symbol;
pub use loader::SYMTAB_RANGE_NAME;

pub use macho::HeaderVariant;

pub use memory::AddressWindow;
pub use memory::MemoryRange;
pub use memory::PhysicalMemory;

pub use platform::BootContext;
pub use platform::CpuState;
pub use platform::KernelVersion;
pub use platform::Platform;
pub use platform::CPU_TYPE_X86;
pub use platform::CPU_TYPE_X86_64;

mod config;
mod errors;
mod loader;
mod macho;
mod memory;
mod platform;

#[cfg(test)]
mod tests;
