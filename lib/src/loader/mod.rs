/*! Loads a Mach-O kernel image into physical memory.

The [`Loader`] walks the load commands of a thin Mach-O kernel twice. The
first pass copies every segment to its physical address, finds the entry
point and, when the symbol table is found, recovers the kernel version and
applies the configured patches. The second pass copies the symbol table to
kernel memory, where the kernel can find it after boot.

FAT binaries must be thinned with [`select_architecture_slice`] before
being passed to the loader.
*/
#[cfg(feature = "logging")]
use log::{debug, error, warn};
use nom::number::complete::le_u32;

use crate::config::LoaderConfig;
use crate::errors::Error;
use crate::macho::parser::{self, LoadCommands};
use crate::macho::{physical_address, HeaderVariant, LoadCommand, Segment};
use crate::platform::BootContext;

mod fat;
#[cfg(feature = "patching")]
mod patcher;
mod segment;
mod symtab;
mod thread;
mod version;

pub use fat::{select_architecture_slice, ArchSlice};
pub use symtab::{PreservedSymbolTable, Symbol, SYMTAB_RANGE_NAME};

use segment::{Placement, SegmentKind};

/// A patch that was applied to the loaded kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    /// Symbol of the patched function or table.
    pub symbol: String,
    /// Physical address where the pattern was found.
    pub address: u64,
}

/// Result of loading a kernel image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedKernel {
    /// Physical address of the kernel's entry point.
    pub entry: u32,
    /// Lowest physical address occupied by the kernel.
    pub image_base: u32,
    /// Size of the range occupied by the kernel, starting at `image_base`.
    pub image_size: u32,
    /// Virtual address of the `__TEXT` segment.
    pub text_vmaddr: Option<u64>,
    /// Virtual address of the `__KLD` segment.
    pub stub_vmaddr: Option<u64>,
    /// Symbol tables copied to kernel memory.
    pub symbol_tables: Vec<PreservedSymbolTable>,
    /// Patches applied to the kernel. Always empty unless the `patching`
    /// feature is enabled.
    pub patches: Vec<AppliedPatch>,
}

/// Range of physical memory covered by the loaded segments.
struct ImageBounds {
    start: u32,
    end: u32,
}

impl ImageBounds {
    fn new() -> Self {
        Self { start: u32::MAX, end: 0 }
    }

    fn merge(&mut self, placement: &Placement) {
        // Masked addresses are 30 bits wide, and segments were checked to
        // be inside a window.
        let start = placement.address as u32;
        let end = placement.address.wrapping_add(placement.size) as u32;
        self.start = self.start.min(start);
        self.end = self.end.max(end);
    }

    fn size(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }
}

/// Loads kernel images according to a [`LoaderConfig`].
pub struct Loader {
    config: LoaderConfig,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl Loader {
    /// Creates a new loader.
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Returns the loader's configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Loads the thin Mach-O kernel in `image` into `ctx.memory`.
    ///
    /// The image must be built for `ctx.platform.arch_cpu_type`, otherwise
    /// [`Error::BadMagic`] is returned and memory is left untouched. On
    /// success `ctx.platform.kernel` holds the kernel version, if the image
    /// has version symbols, and `ctx.load_kernel_drivers` is `false` if the
    /// kernel is a prelinked one.
    ///
    /// Segments are copied as load commands are visited, so an error
    /// other than [`Error::BadMagic`] can leave memory partially written.
    pub fn decode_and_load_kernel(
        &self,
        ctx: &mut BootContext,
        image: &[u8],
    ) -> Result<LoadedKernel, Error> {
        let cputype = ctx.platform.arch_cpu_type;
        let variant = HeaderVariant::for_cpu(cputype);

        let (_, magic) = le_u32::<_, nom::error::Error<&[u8]>>(image)
            .map_err(|_| Error::truncated("Mach-O header", 0, 4))?;

        if magic != variant.magic() {
            #[cfg(feature = "logging")]
            error!(
                "Mach-O file ({}) has bad magic number {:#x}",
                variant.arch_name(),
                magic
            );

            return Err(Error::BadMagic {
                arch: variant.arch_name(),
                expected: variant.magic(),
                found: magic,
            });
        }

        let (_, header) = parser::mach_header(variant)(image).map_err(|_| {
            Error::truncated("Mach-O header", 0, variant.header_size() as u64)
        })?;

        #[cfg(feature = "logging")]
        debug!(
            "magic: {:#x} cputype: {:#x} filetype: {} ncmds: {} \
             sizeofcmds: {:#x} flags: {:#x}",
            header.magic,
            header.cputype,
            header.filetype,
            header.ncmds,
            header.sizeofcmds,
            header.flags
        );

        let mut bounds = ImageBounds::new();
        let mut satisfied = false;
        let mut entry = 0;
        let mut text: Option<Segment> = None;
        let mut stub: Option<Segment> = None;

        #[allow(unused_mut)]
        let mut patches = Vec::new();

        for (index, command) in
            LoadCommands::new(image, variant, header.ncmds).enumerate()
        {
            let command = command?;

            match command.decode()? {
                LoadCommand::Segment(segment) => {
                    let placement = segment::place_segment(
                        ctx,
                        &self.config,
                        image,
                        &segment,
                    )?;

                    match placement.kind {
                        Some(SegmentKind::Text) => {
                            text = Some(segment);
                            satisfied = true;
                        }
                        Some(SegmentKind::Stub) => {
                            stub = Some(segment);
                            satisfied = true;
                        }
                        None => {}
                    }

                    if placement.size != 0
                        && placement.address >= self.config.kernel_window.base
                    {
                        bounds.merge(&placement);
                    }
                }
                LoadCommand::Thread(data) => {
                    entry =
                        thread::entry_point(data, command.offset, cputype)?;
                    satisfied = true;
                }
                LoadCommand::Symtab(symtab) => match &text {
                    Some(text) => {
                        version::probe_kernel_version(
                            ctx, image, variant, &symtab, text,
                        );

                        #[cfg(feature = "patching")]
                        if !self.config.patch_sites.is_empty() {
                            patches.extend(patcher::patch_kernel(
                                ctx,
                                &self.config.patch_sites,
                                image,
                                variant,
                                &symtab,
                                text,
                            ));
                        }
                    }
                    None => {
                        #[cfg(feature = "logging")]
                        warn!("Symbol table found before __TEXT, skipping it");
                    }
                },
                LoadCommand::Other => {}
            }

            if !satisfied {
                return Err(Error::UnsatisfiedLoad {
                    index: index as u32,
                    cmd: command.cmd,
                });
            }
        }

        // Kernel memory allocations must not overlap the loaded segments.
        if bounds.end > bounds.start {
            ctx.memory.reserve_kernel_memory(bounds.end as u64);
        }

        let mut symbol_tables = Vec::new();

        if self.config.preserve_symbol_table {
            for command in LoadCommands::new(image, variant, header.ncmds) {
                if let LoadCommand::Symtab(symtab) = command?.decode()? {
                    symbol_tables.push(symtab::preserve_symbol_table(
                        ctx, image, variant, &symtab,
                    )?);
                }
            }
        }

        let entry = physical_address(entry) as u32;

        #[cfg(feature = "logging")]
        debug!(
            "Kernel loaded: entry {:#x}, image {:#x}+{:#x}",
            entry,
            bounds.start,
            bounds.size()
        );

        Ok(LoadedKernel {
            entry,
            image_base: bounds.start,
            image_size: bounds.size(),
            text_vmaddr: text.map(|segment| segment.vmaddr),
            stub_vmaddr: stub.map(|segment| segment.vmaddr),
            symbol_tables,
            patches,
        })
    }
}
