use crate::errors::Error;
use crate::macho::parser;

/// Size of a `fat_header` and of each `fat_arch` that follows it.
const FAT_HEADER_SIZE: u64 = 8;
const FAT_ARCH_SIZE: u64 = 20;

/// The part of a FAT binary that contains the image for one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchSlice<'a> {
    /// The binary data starting at the selected slice. When no slice
    /// matched this is the original buffer.
    pub data: &'a [u8],
    /// Offset of the slice within the FAT binary.
    pub offset: u64,
    /// Size of the slice as declared in the FAT header, or zero if no slice
    /// matched.
    pub length: u64,
}

/// Selects the slice for `cputype` from a FAT (universal) binary.
///
/// Slices are visited in the order they appear in the FAT header and the
/// first one with the requested CPU type is returned. CPU subtypes are not
/// taken into account.
///
/// If `data` is not a FAT binary the result is [`Error::BadFatMagic`], and
/// the caller should handle `data` as a thin Mach-O image. If the binary
/// doesn't contain a slice for `cputype` the result is *not* an error, the
/// returned [`ArchSlice`] points to the original data and has a length of
/// zero. It's up to the caller to decide what to do in that case.
pub fn select_architecture_slice(
    data: &[u8],
    cputype: u32,
) -> Result<ArchSlice<'_>, Error> {
    let (endianness, nfat_arch, mut archs) = parser::fat_header(data)?;

    for index in 0..nfat_arch {
        let (remainder, arch) = parser::fat_arch(endianness)(archs).map_err(
            |_| {
                Error::truncated(
                    "fat_arch",
                    FAT_HEADER_SIZE + index as u64 * FAT_ARCH_SIZE,
                    FAT_ARCH_SIZE,
                )
            },
        )?;

        archs = remainder;

        if arch.cputype == cputype {
            let slice = data.get(arch.offset as usize..).ok_or(
                Error::truncated(
                    "architecture slice",
                    arch.offset as u64,
                    arch.size as u64,
                ),
            )?;

            return Ok(ArchSlice {
                data: slice,
                offset: arch.offset as u64,
                length: arch.size as u64,
            });
        }
    }

    Ok(ArchSlice { data, offset: 0, length: 0 })
}
