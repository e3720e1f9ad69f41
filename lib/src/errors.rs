use thiserror::Error;

/// Errors returned while decoding or loading a kernel image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer doesn't start with a FAT magic number. The caller usually
    /// treats the buffer as a thin Mach-O image in this case.
    #[error("not a FAT binary, unknown magic {magic:#010x}")]
    BadFatMagic {
        /// Magic number found at the start of the buffer.
        magic: u32,
    },

    /// The Mach-O magic number doesn't match the architecture being booted.
    #[error("Mach-O file ({arch}) has a bad magic number {found:#010x}")]
    BadMagic {
        /// Architecture expected by the loader.
        arch: &'static str,
        /// Magic number expected for `arch`.
        expected: u32,
        /// Magic number found in the image.
        found: u32,
    },

    /// A thread command was found, but the loader doesn't know how to read
    /// the thread state for the CPU being booted.
    #[error("unknown CPU type {cputype:#x}")]
    UnsupportedArchitecture {
        /// CPU type the loader is running for.
        cputype: u32,
    },

    /// A segment must be copied to a physical range that lies outside of
    /// both the kernel and the hibernation windows. There's no way of
    /// continuing the boot after this error.
    #[error("kernel overflows available space: segment `{segment}` at {address:#x} with size {size:#x}")]
    KernelOverflow {
        /// Name of the segment.
        segment: String,
        /// Physical address where the segment should be loaded.
        address: u64,
        /// Size of the segment in memory.
        size: u64,
    },

    /// A load command finished processing before any command established
    /// the kernel's text segment or its entry point.
    #[error("load command #{index} ({cmd:#x}) left the kernel image unsatisfied")]
    UnsatisfiedLoad {
        /// Index of the load command.
        index: u32,
        /// Type of the load command.
        cmd: u32,
    },

    /// A load command is too small or extends past the end of the image.
    #[error("malformed load command at offset {offset:#x}")]
    MalformedLoadCommand {
        /// Offset of the load command within the image.
        offset: usize,
    },

    /// The string table of a symbol table precedes its symbols.
    #[error("malformed symbol table: string table at {stroff:#x} precedes symbols at {symoff:#x}")]
    MalformedSymbolTable {
        /// File offset of the symbols.
        symoff: u32,
        /// File offset of the string table.
        stroff: u32,
    },

    /// Some structure referenced by the image lies outside the image.
    #[error("image is truncated: {what} needs {len:#x} bytes at offset {offset:#x}")]
    Truncated {
        /// The structure that couldn't be read.
        what: &'static str,
        /// Offset of the structure within the image.
        offset: u64,
        /// Length of the structure.
        len: u64,
    },

    /// A physical address range is not backed by memory.
    #[error("physical range {address:#x}+{len:#x} is not backed by memory")]
    OutOfBounds {
        /// Start of the range.
        address: u64,
        /// Length of the range.
        len: u64,
    },

    /// An address window doesn't fit in the physical address space.
    #[error("address window {base:#x}+{len:#x} is outside physical memory")]
    InvalidWindow {
        /// Start of the window.
        base: u64,
        /// Length of the window.
        len: u64,
    },

    /// The kernel memory allocator ran out of space.
    #[error("can not allocate {size:#x} bytes of kernel memory")]
    AllocationFailure {
        /// Requested size.
        size: u64,
    },
}

impl Error {
    /// Returns `true` if the error leaves physical memory in a state from
    /// which the boot process can't continue, and the caller must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::KernelOverflow { .. }
                | Error::UnsupportedArchitecture { .. }
                | Error::AllocationFailure { .. }
        )
    }

    pub(crate) fn truncated(
        what: &'static str,
        offset: u64,
        len: u64,
    ) -> Self {
        Error::Truncated { what, offset, len }
    }
}
