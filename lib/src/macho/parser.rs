use bstr::{BStr, ByteSlice};
use nom::bytes::complete::{take, take_till};
use nom::combinator::{cond, map};
use nom::number::complete::{le_u16, le_u32, u32, u64, u8};
use nom::number::Endianness;
use nom::sequence::tuple;
use nom::{Err, IResult};

use crate::errors::Error;
use crate::macho::*;

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// Kernel images are always stored in the byte order of the machine that
/// boots them. Only the FAT header can use a different one.
const NATIVE: Endianness = Endianness::Little;

/// Parses the header of a FAT Mach-O file.
///
/// Returns the byte order used by the FAT header, the number of `fat_arch`
/// structures, and the data that follows the header, which starts with the
/// first `fat_arch`.
///
/// The magic number is read in native order. `FAT_MAGIC` means that the
/// rest of the header is in native order too, while `FAT_CIGAM` means that
/// every field must be byte-swapped. The second case is the usual one, as
/// FAT headers are stored big-endian on disk.
pub(crate) fn fat_header(
    data: &[u8],
) -> Result<(Endianness, u32, &[u8]), Error> {
    let (remainder, magic) = le_u32::<_, NomError<'_>>(data)
        .map_err(|_| Error::truncated("FAT header", 0, 4))?;

    let endianness = match magic {
        FAT_MAGIC => Endianness::Little,
        FAT_CIGAM => Endianness::Big,
        _ => return Err(Error::BadFatMagic { magic }),
    };

    let (remainder, nfat_arch) = u32::<_, NomError<'_>>(endianness)(remainder)
        .map_err(|_| Error::truncated("FAT header", 4, 4))?;

    Ok((endianness, nfat_arch, remainder))
}

/// Parser that parses a `fat_arch` structure.
pub(crate) fn fat_arch<'a>(
    endianness: Endianness,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], FatArch> {
    map(
        tuple((
            u32(endianness), // cputype
            u32(endianness), // cpusubtype
            u32(endianness), // offset
            u32(endianness), // size
            u32(endianness), // align
        )),
        |(cputype, _cpusubtype, offset, size, _align)| FatArch {
            cputype,
            offset,
            size,
        },
    )
}

/// Parser that parses a `mach_header` or `mach_header_64`, depending on
/// `variant`. The magic number is not verified.
pub(crate) fn mach_header<'a>(
    variant: HeaderVariant,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], MachOHeader> {
    map(
        tuple((
            u32(NATIVE),                                // magic
            u32(NATIVE),                                // cputype
            u32(NATIVE),                                // cpusubtype
            u32(NATIVE),                                // filetype
            u32(NATIVE),                                // ncmds
            u32(NATIVE),                                // sizeofcmds
            u32(NATIVE),                                // flags
            cond(!variant.is_32_bits(), u32(NATIVE)), // reserved
        )),
        |(
            magic,
            cputype,
            cpusubtype,
            filetype,
            ncmds,
            sizeofcmds,
            flags,
            _reserved,
        )| {
            MachOHeader {
                magic,
                cputype,
                cpusubtype,
                filetype,
                ncmds,
                sizeofcmds,
                flags,
            }
        },
    )
}

/// Iterator over the load commands of a thin Mach-O image.
///
/// Load commands don't have an index, each of them starts exactly where the
/// previous one ends, so they can only be visited sequentially. The iterator
/// stops after returning an error.
pub(crate) struct LoadCommands<'a> {
    image: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> LoadCommands<'a> {
    pub fn new(image: &'a [u8], variant: HeaderVariant, ncmds: u32) -> Self {
        Self { image, offset: variant.header_size(), remaining: ncmds }
    }

    fn command(&mut self) -> Result<RawCommand<'a>, Error> {
        let offset = self.offset;
        let malformed =
            |_: Err<NomError<'_>>| Error::MalformedLoadCommand { offset };

        let input = self
            .image
            .get(offset..)
            .ok_or(Error::MalformedLoadCommand { offset })?;

        // The first two u32 in the command are the value that indicates
        // the command type, and the size of the command's data.
        let (_, (cmd, cmdsize)) =
            tuple((u32(NATIVE), u32(NATIVE)))(input).map_err(malformed)?;

        // `cmdsize` includes the sizes of `cmd` and `cmdsize` themselves, a
        // smaller value would make the walk go backwards or stay in place.
        if cmdsize < 8 {
            return Err(Error::MalformedLoadCommand { offset });
        }

        let (_, data) = take(cmdsize)(input).map_err(malformed)?;

        self.offset = offset + cmdsize as usize;

        Ok(RawCommand { offset, cmd, data })
    }
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = Result<RawCommand<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let command = self.command();
        if command.is_err() {
            self.remaining = 0;
        }
        Some(command)
    }
}

impl<'a> RawCommand<'a> {
    /// Decodes the command's payload.
    pub fn decode(&self) -> Result<LoadCommand<'a>, Error> {
        // Skip `cmd` and `cmdsize`.
        let payload = &self.data[8..];

        let result = match self.cmd {
            LC_SEGMENT | LC_SEGMENT_64 => {
                segment_command(self.cmd == LC_SEGMENT)(payload)
                    .map(|(_, segment)| LoadCommand::Segment(segment))
            }
            LC_SYMTAB => symtab_command(payload)
                .map(|(_, symtab)| LoadCommand::Symtab(symtab)),
            LC_UNIXTHREAD | LC_MAIN => Ok(LoadCommand::Thread(self.data)),
            _ => Ok(LoadCommand::Other),
        };

        result.map_err(|_| Error::MalformedLoadCommand { offset: self.offset })
    }
}

/// Parser that parses a LC_SEGMENT or LC_SEGMENT_64 command, without the
/// `cmd` and `cmdsize` fields. Sections are not parsed.
fn segment_command<'a>(
    is_32_bits: bool,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], Segment<'a>> {
    map(
        tuple((
            // name
            map(take(16_usize), |name: &'a [u8]| {
                BStr::new(name.trim_end_with(|c| c == '\0'))
            }),
            uint(NATIVE, is_32_bits), // vmaddr
            uint(NATIVE, is_32_bits), // vmsize
            uint(NATIVE, is_32_bits), // fileoff
            uint(NATIVE, is_32_bits), // filesize
        )),
        |(segname, vmaddr, vmsize, fileoff, filesize)| Segment {
            segname,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
        },
    )
}

/// Parser that parses a LC_SYMTAB command, without the `cmd` and `cmdsize`
/// fields.
fn symtab_command(input: &[u8]) -> IResult<&[u8], Symtab> {
    map(
        tuple((
            u32(NATIVE), //  symoff
            u32(NATIVE), //  nsyms
            u32(NATIVE), //  stroff
            u32(NATIVE), //  strsize
        )),
        |(symoff, nsyms, stroff, strsize)| Symtab {
            symoff,
            nsyms,
            stroff,
            strsize,
        },
    )(input)
}

/// Parser that parses a `nlist` or `nlist_64` structure.
pub(crate) fn nlist<'a>(
    variant: HeaderVariant,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], Nlist> {
    map(
        tuple((
            le_u32,                             // n_strx
            u8,                                 // n_type
            u8,                                 // n_sect
            le_u16,                             // n_desc
            uint(NATIVE, variant.is_32_bits()), // n_value
        )),
        |(n_strx, n_type, n_sect, n_desc, n_value)| Nlist {
            n_strx,
            n_type,
            n_sect,
            n_desc,
            n_value,
        },
    )
}

/// Returns the `index`-th entry of the symbol table described by `symtab`.
pub(crate) fn symbol_entry(
    image: &[u8],
    symtab: &Symtab,
    variant: HeaderVariant,
    index: u32,
) -> Result<Nlist, Error> {
    let size = variant.nlist_size() as u64;
    let offset = symtab.symoff as u64 + index as u64 * size;

    let entry = usize::try_from(offset)
        .ok()
        .and_then(|start| image.get(start..))
        .ok_or(Error::truncated("symbol table", offset, size))?;

    nlist(variant)(entry)
        .map(|(_, nlist)| nlist)
        .map_err(|_| Error::truncated("symbol table", offset, size))
}

/// Returns the string table described by `symtab`.
pub(crate) fn string_table<'a>(
    image: &'a [u8],
    symtab: &Symtab,
) -> Result<&'a [u8], Error> {
    let start = symtab.stroff as usize;
    image
        .get(start..start.saturating_add(symtab.strsize as usize))
        .ok_or(Error::truncated(
            "string table",
            symtab.stroff as u64,
            symtab.strsize as u64,
        ))
}

/// Returns the NUL-terminated name that starts at `n_strx` within the
/// string table, or `None` if `n_strx` is outside the table.
pub(crate) fn symbol_name(strtab: &[u8], n_strx: u32) -> Option<&BStr> {
    let input = strtab.get(n_strx as usize..)?;
    let (_, name) = take_till::<_, _, NomError<'_>>(|c| c == 0)(input).ok()?;
    Some(BStr::new(name))
}

/// Parser that reads the `eip` register from an `i386_thread_state`.
pub(crate) fn x86_thread_state(input: &[u8]) -> IResult<&[u8], u64> {
    map(
        tuple((
            u32(NATIVE), // eax
            u32(NATIVE), // ebx
            u32(NATIVE), // ecx
            u32(NATIVE), // edx
            u32(NATIVE), // edi
            u32(NATIVE), // esi
            u32(NATIVE), // ebp
            u32(NATIVE), // esp
            u32(NATIVE), // ss
            u32(NATIVE), // eflags
            u32(NATIVE), // eip
        )),
        |reg| reg.10 as u64, // eip
    )(input)
}

/// Parser that reads the `rip` register from an `x86_thread_state64`.
pub(crate) fn x86_64_thread_state(input: &[u8]) -> IResult<&[u8], u64> {
    let (remainder, _) = take(16 * 8_usize)(input)?; // rax ... r15
    u64(NATIVE)(remainder) // rip
}

/// Parser that reads a 32-bits or 64-bits
fn uint(
    endianness: Endianness,
    _32bits: bool,
) -> impl FnMut(&[u8]) -> IResult<&[u8], u64> {
    move |input: &[u8]| {
        if _32bits {
            let (remainder, i) = u32(endianness)(input)?;
            Ok((remainder, i as u64))
        } else {
            u64(endianness)(input)
        }
    }
}

#[test]
fn test_fat_header_byte_order() {
    // Stored big-endian, as it appears on disk.
    let data = [0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x02];
    let (endianness, nfat, remainder) = fat_header(&data).unwrap();
    assert_eq!(endianness, Endianness::Big);
    assert_eq!(nfat, 2);
    assert!(remainder.is_empty());

    // Stored in native order.
    let data = [0xbe, 0xba, 0xfe, 0xca, 0x03, 0x00, 0x00, 0x00];
    let (endianness, nfat, _) = fat_header(&data).unwrap();
    assert_eq!(endianness, Endianness::Little);
    assert_eq!(nfat, 3);

    assert_eq!(
        fat_header(&[0xcf, 0xfa, 0xed, 0xfe, 0, 0, 0, 0]).unwrap_err(),
        Error::BadFatMagic { magic: MH_MAGIC_64 }
    );
}

#[test]
fn test_nlist_parsing() {
    let data = [
        0x04, 0x00, 0x00, 0x00, // n_strx
        0x0f, // n_type
        0x02, // n_sect
        0x00, 0x00, // n_desc
        0x00, 0x10, 0x20, 0x00, 0x80, 0xff, 0xff, 0xff, // n_value
    ];

    let (remainder, entry) = nlist(HeaderVariant::Thin64)(&data).unwrap();
    assert!(remainder.is_empty());
    assert_eq!(entry.n_strx, 4);
    assert_eq!(entry.n_sect, 2);
    assert_eq!(entry.n_value, 0xffffff8000201000);

    let (remainder, entry) = nlist(HeaderVariant::Thin32)(&data).unwrap();
    assert_eq!(remainder.len(), 4);
    assert_eq!(entry.n_value, 0x00201000);
}

#[test]
fn test_symbol_name() {
    let strtab = b"\0_version_major\0_version_minor";
    assert_eq!(symbol_name(strtab, 1).unwrap(), "_version_major");
    // The last string is not NUL-terminated, it ends with the table.
    assert_eq!(symbol_name(strtab, 16).unwrap(), "_version_minor");
    assert_eq!(symbol_name(strtab, 0).unwrap(), "");
    assert!(symbol_name(strtab, 100).is_none());
}

#[test]
fn test_zero_sized_command() {
    let mut image = vec![0_u8; 28];
    image.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0]);

    let mut commands = LoadCommands::new(&image, HeaderVariant::Thin32, 2);
    assert_eq!(
        commands.next().unwrap().unwrap_err(),
        Error::MalformedLoadCommand { offset: 28 }
    );
    assert!(commands.next().is_none());
}
