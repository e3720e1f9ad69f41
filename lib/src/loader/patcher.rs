#[cfg(feature = "logging")]
use log::{debug, error};
use memchr::memmem;

use crate::config::PatchSite;
use crate::loader::AppliedPatch;
use crate::macho::parser;
use crate::macho::{physical_address, HeaderVariant, Segment, Symtab};
use crate::memory::PhysicalMemory;
use crate::platform::BootContext;

/// Size of the patterns searched for, and of the words written.
const WORD_SIZE: u64 = 8;

/// Applies `sites` to the kernel code that is already in physical memory.
///
/// Symbols are visited in table order. For each symbol with a non-zero
/// value, the first site whose section matches (and whose CPU condition
/// holds) is the only one considered for that symbol. A site is applied at
/// most once.
///
/// Patching never fails: sites whose symbol or pattern are not found, or
/// whose address is not backed by memory, are simply skipped.
pub(crate) fn patch_kernel(
    ctx: &mut BootContext,
    sites: &[PatchSite],
    image: &[u8],
    variant: HeaderVariant,
    symtab: &Symtab,
    text: &Segment,
) -> Vec<AppliedPatch> {
    let mut applied = Vec::new();
    let mut done = vec![false; sites.len()];

    let Ok(strtab) = parser::string_table(image, symtab) else {
        return applied;
    };

    let msr_locked = ctx.platform.cpu.cst_config_msr_locked;

    for index in 0..symtab.nsyms {
        let Ok(entry) = parser::symbol_entry(image, symtab, variant, index)
        else {
            break;
        };

        if entry.n_value == 0 {
            continue;
        }

        let Some((site_index, site)) =
            sites.iter().enumerate().find(|(_, site)| {
                site.enabled
                    && site.section == entry.n_sect
                    && (!site.requires_msr_lock || msr_locked)
            })
        else {
            continue;
        };

        if done[site_index] {
            continue;
        }

        match parser::symbol_name(strtab, entry.n_strx) {
            Some(name) if name == site.symbol.as_str() => {}
            _ => continue,
        }

        let start = physical_address(
            text.vmaddr
                .wrapping_add(entry.n_value.wrapping_sub(text.vmaddr)),
        );

        if let Some(address) = apply(&mut ctx.memory, site, start) {
            #[cfg(feature = "logging")]
            debug!("Patched {} at {:#x}", site.symbol, address);

            done[site_index] = true;
            applied.push(AppliedPatch {
                symbol: site.symbol.clone(),
                address,
            });
        }
    }

    applied
}

/// Replaces the first occurrence of the site's pattern in the window that
/// starts at `start`. Returns the address of the occurrence.
fn apply(
    memory: &mut PhysicalMemory,
    site: &PatchSite,
    start: u64,
) -> Option<u64> {
    // An occurrence may start at the last byte of the window, and extend
    // past its end.
    let window = memory
        .read_up_to(start, site.window.saturating_add(WORD_SIZE))
        .ok()?;

    let position = memmem::find(window, &site.target.to_le_bytes())?;
    let address = start + position as u64;

    memory.write(address, &site.replacement.to_le_bytes()).ok()?;

    for offset in &site.zero_offsets {
        let zero_at = address.saturating_add(*offset);

        if let Err(_err) = memory.write(zero_at, &[0; WORD_SIZE as usize]) {
            #[cfg(feature = "logging")]
            error!(
                "Can not patch {} at {:#x}: {}",
                site.symbol, zero_at, _err
            );
        }
    }

    Some(address)
}
