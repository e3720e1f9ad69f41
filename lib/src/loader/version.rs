#[cfg(feature = "logging")]
use log::debug;

use crate::macho::parser;
use crate::macho::{
    physical_address, HeaderVariant, Segment, Symtab, SECT_TEXT_CONST,
};
use crate::platform::BootContext;

/// Version components, in the order they are searched for.
///
/// The kernel defines `_version_major`, `_version_minor` and
/// `_version_revision` in this order, and the symbol table is walked
/// backwards, so the revision is the first one found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expecting {
    Revision,
    Minor,
    Major,
}

impl Expecting {
    fn symbol(&self) -> &'static str {
        match self {
            Expecting::Revision => "_version_revision",
            Expecting::Minor => "_version_minor",
            Expecting::Major => "_version_major",
        }
    }
}

/// Looks for the kernel's version symbols and stores their values in
/// `ctx.platform.kernel`.
///
/// Each symbol is a single byte in `__TEXT,__const`, its value is read from
/// the copy of the text segment that is already in physical memory. Any
/// component that is not found keeps its previous value.
///
/// The probe never fails. Entries outside the image are skipped, the
/// symbol table is validated when it's preserved.
pub(crate) fn probe_kernel_version(
    ctx: &mut BootContext,
    image: &[u8],
    variant: HeaderVariant,
    symtab: &Symtab,
    text: &Segment,
) {
    if symtab.nsyms == 0 {
        return;
    }

    let strtab = match parser::string_table(image, symtab) {
        Ok(strtab) => strtab,
        Err(_err) => {
            #[cfg(feature = "logging")]
            debug!("Can not read string table: {}", _err);
            return;
        }
    };

    let text_base = physical_address(text.vmaddr);
    let mut expecting = Expecting::Revision;

    // Entries past the end of the image are ignored.
    let available = (image.len() as u64)
        .saturating_sub(symtab.symoff as u64)
        / variant.nlist_size() as u64;

    let nsyms = (symtab.nsyms as u64).min(available) as u32;

    for index in (0..nsyms).rev() {
        let Ok(entry) = parser::symbol_entry(image, symtab, variant, index)
        else {
            continue;
        };

        if entry.n_sect != SECT_TEXT_CONST || entry.n_value == 0 {
            continue;
        }

        let Some(name) = parser::symbol_name(strtab, entry.n_strx) else {
            continue;
        };

        if name.is_empty() || name != expecting.symbol() {
            continue;
        }

        let address =
            text_base.wrapping_add(entry.n_value.wrapping_sub(text.vmaddr));

        let value = match ctx.memory.read(address, 1) {
            Ok(bytes) => bytes[0],
            Err(_err) => {
                #[cfg(feature = "logging")]
                debug!("Can not read {} at {:#x}: {}", name, address, _err);
                continue;
            }
        };

        let kernel = &mut ctx.platform.kernel;

        match expecting {
            Expecting::Revision => {
                kernel.revision = value;
                expecting = Expecting::Minor;
            }
            Expecting::Minor => {
                kernel.minor = value;
                expecting = Expecting::Major;
            }
            Expecting::Major => {
                kernel.major = value;
                break;
            }
        }
    }

    #[cfg(feature = "logging")]
    debug!(
        "Kernel version: {}.{}.{}",
        ctx.platform.kernel.major,
        ctx.platform.kernel.minor,
        ctx.platform.kernel.revision
    );
}
