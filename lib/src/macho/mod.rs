//! Mach-O structures needed for loading a kernel image.
//!
//! Only the subset of the format that matters for kernel executables is
//! represented here: the fat header, the thin header, segment, symbol table
//! and thread commands, and the `nlist` symbol entries. Everything else is
//! treated as opaque.
use bstr::BStr;

use crate::platform::CPU_TYPE_X86_64;

pub(crate) mod parser;

/// Mach-O magic constants
pub(crate) const MH_MAGIC: u32 = 0xfeedface;
pub(crate) const MH_MAGIC_64: u32 = 0xfeedfacf;

/// Mach-O FAT magic constants
pub(crate) const FAT_MAGIC: u32 = 0xcafebabe;
pub(crate) const FAT_CIGAM: u32 = 0xbebafeca;

/// Mach-O dynamic linker constant
const LC_REQ_DYLD: u32 = 0x80000000;

/// Mach-O load commands
pub(crate) const LC_SEGMENT: u32 = 0x00000001;
pub(crate) const LC_SYMTAB: u32 = 0x00000002;
pub(crate) const LC_UNIXTHREAD: u32 = 0x00000005;
pub(crate) const LC_SEGMENT_64: u32 = 0x00000019;
pub(crate) const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;

/// Size of `struct symtab_command`.
pub(crate) const SYMTAB_COMMAND_SIZE: u32 = 24;

/// Kernels are linked at a virtual address whose upper bits must be
/// stripped to obtain the physical address where they are loaded.
pub(crate) const PHYSICAL_ADDRESS_MASK: u64 = 0x3fffffff;

/// Section number of `__TEXT,__text`.
pub(crate) const SECT_TEXT_TEXT: u8 = 1;
/// Section number of `__TEXT,__const`.
pub(crate) const SECT_TEXT_CONST: u8 = 2;
/// Section number of `__DATA,__data`.
pub(crate) const SECT_DATA_DATA: u8 = 8;
/// Section number of `__KLD,__text`.
pub(crate) const SECT_KLD_TEXT: u8 = 25;

/// Layout of a thin (single architecture) Mach-O image.
///
/// The variant is chosen once from the CPU type the boot loader is running
/// for, and every size that depends on the word size is obtained from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVariant {
    /// `mach_header` with 12-byte `nlist` entries.
    Thin32,
    /// `mach_header_64` with 16-byte `nlist_64` entries.
    Thin64,
}

impl HeaderVariant {
    /// Returns the variant expected for the given CPU type.
    pub fn for_cpu(cputype: u32) -> Self {
        if cputype == CPU_TYPE_X86_64 {
            HeaderVariant::Thin64
        } else {
            HeaderVariant::Thin32
        }
    }

    /// Magic number that a header of this variant must start with.
    pub fn magic(&self) -> u32 {
        match self {
            HeaderVariant::Thin32 => MH_MAGIC,
            HeaderVariant::Thin64 => MH_MAGIC_64,
        }
    }

    /// Size of the Mach-O header, load commands start right after it.
    pub fn header_size(&self) -> usize {
        match self {
            HeaderVariant::Thin32 => 28,
            HeaderVariant::Thin64 => 32,
        }
    }

    /// Size of each entry in the symbol table.
    pub fn nlist_size(&self) -> usize {
        match self {
            HeaderVariant::Thin32 => 12,
            HeaderVariant::Thin64 => 16,
        }
    }

    /// Architecture name used in diagnostics.
    pub fn arch_name(&self) -> &'static str {
        match self {
            HeaderVariant::Thin32 => "i386",
            HeaderVariant::Thin64 => "X86_64",
        }
    }

    pub(crate) fn is_32_bits(&self) -> bool {
        matches!(self, HeaderVariant::Thin32)
    }
}

// Only `magic` and `ncmds` drive the loader, the rest is kept for
// diagnostics.
#[allow(dead_code)]
#[derive(Debug)]
pub(crate) struct MachOHeader {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FatArch {
    pub cputype: u32,
    pub offset: u32,
    pub size: u32,
}

/// A load command as it appears in the image, before decoding its payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawCommand<'a> {
    /// Offset of the command within the image.
    pub offset: usize,
    pub cmd: u32,
    /// The whole command, including the `cmd` and `cmdsize` fields.
    pub data: &'a [u8],
}

#[derive(Debug)]
pub(crate) enum LoadCommand<'a> {
    Segment(Segment<'a>),
    Symtab(Symtab),
    /// LC_UNIXTHREAD or LC_MAIN, contains the whole command.
    Thread(&'a [u8]),
    Other,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment<'a> {
    pub segname: &'a BStr,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Symtab {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

/// Strips the link-time high bits from a kernel virtual address.
#[inline]
pub(crate) fn physical_address(vmaddr: u64) -> u64 {
    vmaddr & PHYSICAL_ADDRESS_MASK
}
