use bstr::BString;
#[cfg(feature = "logging")]
use log::debug;
use nom::number::complete::le_u32;
use nom::sequence::tuple;

use crate::errors::Error;
use crate::macho::parser;
use crate::macho::{HeaderVariant, Symtab, LC_SYMTAB, SYMTAB_COMMAND_SIZE};
use crate::memory::PhysicalMemory;
use crate::platform::BootContext;

/// Name of the memory range that holds the preserved symbol table.
pub const SYMTAB_RANGE_NAME: &str = "Kernel-__SYMTAB";

/// A copy of the kernel's symbol table placed in kernel memory.
///
/// The copy starts with a `symtab_command` whose offsets are physical
/// addresses pointing into the copy itself, so the kernel can locate its
/// symbols without having access to the original file. Symbols come right
/// after the header and the string table right after the symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreservedSymbolTable {
    /// Physical address of the copy.
    pub address: u64,
    /// Size of the copy, header included.
    pub size: u64,
    /// Physical address of the first symbol.
    pub symoff: u32,
    /// Number of symbols.
    pub nsyms: u32,
    /// Physical address of the string table.
    pub stroff: u32,
    /// Size of the string table.
    pub strsize: u32,
    variant: HeaderVariant,
}

/// A symbol read back from a [`PreservedSymbolTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name.
    pub name: BString,
    /// Symbol type.
    pub n_type: u8,
    /// Section number, or zero if the symbol is not in any section.
    pub n_sect: u8,
    /// Additional information about the symbol.
    pub n_desc: u16,
    /// Value of the symbol, usually a virtual address.
    pub n_value: u64,
}

impl PreservedSymbolTable {
    /// Reads the symbols from the copy in `memory`.
    ///
    /// The offsets are taken from the header stored in memory, not from
    /// the fields of this structure, so this also verifies that the header
    /// was written correctly.
    pub fn read_symbols(
        &self,
        memory: &PhysicalMemory,
    ) -> Result<Vec<Symbol>, Error> {
        let header = memory.read(self.address, SYMTAB_COMMAND_SIZE as u64)?;

        let (_, (_cmd, _cmdsize, symoff, nsyms, stroff, strsize)) =
            tuple((le_u32, le_u32, le_u32, le_u32, le_u32, le_u32))(header)
                .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| {
                    Error::truncated(
                        "symtab_command",
                        self.address,
                        SYMTAB_COMMAND_SIZE as u64,
                    )
                })?;

        let entry_size = self.variant.nlist_size() as u64;
        let entries =
            memory.read(symoff as u64, nsyms as u64 * entry_size)?;
        let strtab = memory.read(stroff as u64, strsize as u64)?;

        entries
            .chunks_exact(entry_size as usize)
            .enumerate()
            .map(|(index, entry)| {
                let (_, nlist) = parser::nlist(self.variant)(entry).map_err(
                    |_| {
                        Error::truncated(
                            "symbol table",
                            symoff as u64 + index as u64 * entry_size,
                            entry_size,
                        )
                    },
                )?;

                let name = parser::symbol_name(strtab, nlist.n_strx)
                    .map(BString::from)
                    .unwrap_or_default();

                Ok(Symbol {
                    name,
                    n_type: nlist.n_type,
                    n_sect: nlist.n_sect,
                    n_desc: nlist.n_desc,
                    n_value: nlist.n_value,
                })
            })
            .collect()
    }
}

/// Copies the symbols and the string table described by `symtab` to newly
/// allocated kernel memory, preceded by a rewritten `symtab_command`.
///
/// The symbols and the string table are assumed to be contiguous in the
/// image, with the string table after the symbols.
pub(crate) fn preserve_symbol_table(
    ctx: &mut BootContext,
    image: &[u8],
    variant: HeaderVariant,
    symtab: &Symtab,
) -> Result<PreservedSymbolTable, Error> {
    let symbols_size = symtab.stroff.checked_sub(symtab.symoff).ok_or(
        Error::MalformedSymbolTable {
            symoff: symtab.symoff,
            stroff: symtab.stroff,
        },
    )?;

    let data_size = symbols_size as u64 + symtab.strsize as u64;
    let start = symtab.symoff as usize;

    let source = image
        .get(start..start.saturating_add(data_size as usize))
        .ok_or(Error::truncated(
            "symbol table",
            symtab.symoff as u64,
            data_size,
        ))?;

    let size = data_size + SYMTAB_COMMAND_SIZE as u64;
    let address = ctx.memory.allocate_kernel_memory(size)?;

    ctx.memory.register_range(SYMTAB_RANGE_NAME, address, size);

    let out_of_bounds = |_| Error::OutOfBounds { address, len: size };
    let symoff = u32::try_from(address + SYMTAB_COMMAND_SIZE as u64)
        .map_err(out_of_bounds)?;
    let stroff =
        symoff.checked_add(symbols_size).ok_or(Error::OutOfBounds {
            address,
            len: size,
        })?;

    let mut header = Vec::with_capacity(SYMTAB_COMMAND_SIZE as usize);

    for field in [
        LC_SYMTAB,
        SYMTAB_COMMAND_SIZE,
        symoff,
        symtab.nsyms,
        stroff,
        symtab.strsize,
    ] {
        header.extend_from_slice(&field.to_le_bytes());
    }

    let destination = ctx.memory.slice_mut(address, size)?;
    let (header_dst, data_dst) = destination.split_at_mut(header.len());

    header_dst.copy_from_slice(&header);
    data_dst.copy_from_slice(source);

    #[cfg(feature = "logging")]
    debug!(
        "Symbol table: {} symbols, {:#x} bytes at {:#x}",
        symtab.nsyms, size, address
    );

    Ok(PreservedSymbolTable {
        address,
        size,
        symoff,
        nsyms: symtab.nsyms,
        stroff,
        strsize: symtab.strsize,
        variant,
    })
}
