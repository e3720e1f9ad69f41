/*! End-to-end tests. */
use pretty_assertions::assert_eq;

use crate::macho::{
    HeaderVariant, LC_SEGMENT, LC_SEGMENT_64, LC_SYMTAB, LC_UNIXTHREAD,
    MH_MAGIC, MH_MAGIC_64, SECT_TEXT_CONST, SECT_TEXT_TEXT,
};
use crate::{
    select_architecture_slice, AddressWindow, BootContext, Error,
    KernelVersion, LoadedKernel, Loader, LoaderConfig, MemoryRange, Platform,
    CPU_TYPE_X86, CPU_TYPE_X86_64,
};

/// Load commands go before this offset, segment and symbol data after it.
const DATA_START: usize = 0x1000;

/// Virtual address of `__TEXT` in 64-bit test kernels. The physical address
/// is 0x200000.
const TEXT_VMADDR: u64 = 0xffff_ff80_0020_0000;

/// Virtual address of `__TEXT` in 32-bit test kernels.
const TEXT_VMADDR_32: u64 = 0x4020_0000;

const CPU_TYPE_ARM: u32 = 12;

/// Builds thin Mach-O images with just the commands the loader cares about.
struct MachOBuilder {
    variant: HeaderVariant,
    cputype: u32,
    ncmds: u32,
    commands: Vec<u8>,
    data: Vec<u8>,
}

impl MachOBuilder {
    fn new(cputype: u32) -> Self {
        Self {
            variant: HeaderVariant::for_cpu(cputype),
            cputype,
            ncmds: 0,
            commands: Vec::new(),
            data: Vec::new(),
        }
    }

    fn is_64_bits(&self) -> bool {
        self.variant == HeaderVariant::Thin64
    }

    /// Appends a pointer-sized value.
    fn word(&self, buf: &mut Vec<u8>, value: u64) {
        if self.is_64_bits() {
            buf.extend(value.to_le_bytes());
        } else {
            buf.extend((value as u32).to_le_bytes());
        }
    }

    /// Appends `bytes` to the data area and returns their file offset.
    fn data(&mut self, bytes: &[u8]) -> u64 {
        let offset = DATA_START + self.data.len();
        self.data.extend_from_slice(bytes);
        offset as u64
    }

    fn command(&mut self, cmd: u32, payload: &[u8]) -> &mut Self {
        self.commands.extend(cmd.to_le_bytes());
        self.commands.extend((payload.len() as u32 + 8).to_le_bytes());
        self.commands.extend_from_slice(payload);
        self.ncmds += 1;
        self
    }

    fn segment(
        &mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        contents: &[u8],
    ) -> &mut Self {
        let fileoff =
            if contents.is_empty() { 0 } else { self.data(contents) };

        self.segment_with_offset(
            name,
            vmaddr,
            vmsize,
            fileoff,
            contents.len() as u64,
        )
    }

    fn segment_with_offset(
        &mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
    ) -> &mut Self {
        let mut payload = vec![0_u8; 16];
        payload[..name.len()].copy_from_slice(name.as_bytes());

        for value in [vmaddr, vmsize, fileoff, filesize] {
            self.word(&mut payload, value);
        }

        // maxprot, initprot, nsects, flags
        payload.extend([0_u8; 16]);

        let cmd = if self.is_64_bits() { LC_SEGMENT_64 } else { LC_SEGMENT };
        self.command(cmd, &payload)
    }

    fn thread(&mut self, entry: u64) -> &mut Self {
        let mut payload = Vec::new();

        if self.is_64_bits() {
            payload.extend(4_u32.to_le_bytes()); // x86_THREAD_STATE64
            payload.extend(42_u32.to_le_bytes());
            for register in 0..21 {
                let value = if register == 16 { entry } else { 0 };
                payload.extend(value.to_le_bytes());
            }
        } else {
            payload.extend(1_u32.to_le_bytes()); // i386_THREAD_STATE
            payload.extend(16_u32.to_le_bytes());
            for register in 0..16 {
                let value = if register == 10 { entry as u32 } else { 0 };
                payload.extend(value.to_le_bytes());
            }
        }

        self.command(LC_UNIXTHREAD, &payload)
    }

    /// Adds a symbol table with one entry per `(name, n_sect, n_value)`.
    fn symtab(&mut self, symbols: &[(&str, u8, u64)]) -> &mut Self {
        let mut strtab = vec![0_u8];
        let mut entries = Vec::new();

        for (name, n_sect, n_value) in symbols {
            entries.extend((strtab.len() as u32).to_le_bytes());
            entries.push(0x0f); // N_SECT | N_EXT
            entries.push(*n_sect);
            entries.extend(0_u16.to_le_bytes());
            self.word(&mut entries, *n_value);

            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        let symoff = self.data(&entries) as u32;
        let stroff = self.data(&strtab) as u32;

        self.symtab_with_offsets(
            symoff,
            symbols.len() as u32,
            stroff,
            strtab.len() as u32,
        )
    }

    fn symtab_with_offsets(
        &mut self,
        symoff: u32,
        nsyms: u32,
        stroff: u32,
        strsize: u32,
    ) -> &mut Self {
        let mut payload = Vec::new();
        for value in [symoff, nsyms, stroff, strsize] {
            payload.extend(value.to_le_bytes());
        }
        self.command(LC_SYMTAB, &payload)
    }

    fn build(&self) -> Vec<u8> {
        let mut image = Vec::new();

        image.extend(self.variant.magic().to_le_bytes());
        image.extend(self.cputype.to_le_bytes());
        image.extend(3_u32.to_le_bytes()); // cpusubtype
        image.extend(2_u32.to_le_bytes()); // MH_EXECUTE
        image.extend(self.ncmds.to_le_bytes());
        image.extend((self.commands.len() as u32).to_le_bytes());
        image.extend(1_u32.to_le_bytes()); // MH_NOUNDEFS

        if self.is_64_bits() {
            image.extend(0_u32.to_le_bytes()); // reserved
        }

        image.extend(&self.commands);
        assert!(image.len() <= DATA_START, "too many load commands");

        image.resize(DATA_START, 0);
        image.extend(&self.data);
        image
    }
}

/// Wraps thin images in a FAT binary, with the header in big-endian order
/// as it appears on disk.
fn fat(slices: &[(u32, &[u8])]) -> Vec<u8> {
    let mut header = Vec::new();
    let mut body = Vec::new();
    let mut offset = DATA_START;

    header.extend(0xcafebabe_u32.to_be_bytes());
    header.extend((slices.len() as u32).to_be_bytes());

    for (cputype, data) in slices {
        header.extend(cputype.to_be_bytes());
        header.extend(3_u32.to_be_bytes()); // cpusubtype
        header.extend((offset as u32).to_be_bytes());
        header.extend((data.len() as u32).to_be_bytes());
        header.extend(12_u32.to_be_bytes()); // align

        body.resize(offset - DATA_START, 0);
        body.extend_from_slice(data);

        offset = (offset + data.len() + 0xfff) & !0xfff;
    }

    header.resize(DATA_START, 0);
    header.extend(body);
    header
}

fn config() -> LoaderConfig {
    LoaderConfig {
        kernel_window: AddressWindow { base: 0x10_0000, len: 0x20_0000 },
        hibernation_window: AddressWindow { base: 0x4000, len: 0x4000 },
        ..LoaderConfig::default()
    }
}

fn boot_context(cputype: u32, config: &LoaderConfig) -> BootContext {
    BootContext::new(
        Platform::new(cputype),
        config.physical_memory().unwrap(),
    )
}

fn load(
    ctx: &mut BootContext,
    config: LoaderConfig,
    image: &[u8],
) -> Result<LoadedKernel, Error> {
    Loader::new(config).decode_and_load_kernel(ctx, image)
}

/// Contents of `__TEXT` in test kernels. The version bytes are at 0x100.
fn text_contents() -> Vec<u8> {
    let mut text = vec![0x90_u8; 0x1000];
    text[0x100] = 14; // major
    text[0x101] = 5; // minor
    text[0x102] = 0; // revision
    text
}

/// Version symbols mixed with others that must be ignored.
fn version_symbols() -> Vec<(&'static str, u8, u64)> {
    vec![
        ("_version_major", SECT_TEXT_CONST, TEXT_VMADDR + 0x100),
        ("_printf", SECT_TEXT_TEXT, TEXT_VMADDR + 0x300),
        ("_version_minor", SECT_TEXT_CONST, TEXT_VMADDR + 0x101),
        ("_version_variant", SECT_TEXT_CONST, TEXT_VMADDR + 0x104),
        ("_version_revision", SECT_TEXT_CONST, TEXT_VMADDR + 0x102),
        // Wrong section, the byte at 0x200 is 0x90.
        ("_version_revision", SECT_TEXT_TEXT, TEXT_VMADDR + 0x200),
    ]
}

fn kernel_64(symbols: &[(&str, u8, u64)], text: &[u8]) -> Vec<u8> {
    MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x2000, text)
        .segment("__DATA", TEXT_VMADDR + 0x2000, 0x1000, &[0xdd; 0x800])
        .thread(TEXT_VMADDR + 0x1000)
        .symtab(symbols)
        .build()
}

#[test]
fn fat_first_match() {
    let i386 = MachOBuilder::new(CPU_TYPE_X86)
        .segment("__TEXT", TEXT_VMADDR_32, 0x1000, &[1; 0x10])
        .build();

    let x86_64 = kernel_64(&[], &text_contents());
    let x86_64_other = MachOBuilder::new(CPU_TYPE_X86_64).build();

    let data = fat(&[
        (CPU_TYPE_X86, i386.as_slice()),
        (CPU_TYPE_X86_64, x86_64.as_slice()),
        (CPU_TYPE_X86_64, x86_64_other.as_slice()),
    ]);

    let slice = select_architecture_slice(&data, CPU_TYPE_X86_64).unwrap();

    assert_eq!(slice.offset, 0x3000);
    assert_eq!(slice.length, x86_64.len() as u64);
    assert_eq!(&slice.data[..x86_64.len()], x86_64.as_slice());
    assert_eq!(&slice.data[..4], MH_MAGIC_64.to_le_bytes());

    let slice = select_architecture_slice(&data, CPU_TYPE_X86).unwrap();

    assert_eq!(slice.offset, 0x1000);
    assert_eq!(&slice.data[..4], MH_MAGIC.to_le_bytes());
}

#[test]
fn fat_no_match() {
    let i386 = MachOBuilder::new(CPU_TYPE_X86).build();
    let data = fat(&[(CPU_TYPE_X86, i386.as_slice())]);
    let original = data.clone();

    let slice = select_architecture_slice(&data, CPU_TYPE_X86_64).unwrap();

    assert_eq!(slice.offset, 0);
    assert_eq!(slice.length, 0);
    assert_eq!(slice.data.as_ptr(), data.as_ptr());
    assert_eq!(data, original);
}

#[test]
fn fat_errors() {
    let thin = MachOBuilder::new(CPU_TYPE_X86_64).build();

    assert_eq!(
        select_architecture_slice(&thin, CPU_TYPE_X86_64).unwrap_err(),
        Error::BadFatMagic { magic: MH_MAGIC_64 }
    );

    // The slice starts past the end of the file.
    let mut data = fat(&[(CPU_TYPE_X86_64, thin.as_slice())]);
    data.truncate(DATA_START / 2);

    assert!(matches!(
        select_architecture_slice(&data, CPU_TYPE_X86_64),
        Err(Error::Truncated { .. })
    ));

    // Declares two slices but has room for one.
    let mut data = fat(&[(CPU_TYPE_X86, thin.as_slice())]);
    data[7] = 2;
    data.truncate(8 + 20);

    assert!(matches!(
        select_architecture_slice(&data, CPU_TYPE_X86_64),
        Err(Error::Truncated { what: "fat_arch", offset: 28, .. })
    ));
}

#[test]
fn load_64_bits_kernel() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
    let text = text_contents();
    let image = kernel_64(&version_symbols(), &text);

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert_eq!(kernel.entry, 0x20_1000);
    assert_eq!(kernel.image_base, 0x20_0000);
    assert_eq!(kernel.image_size, 0x3000);
    assert_eq!(kernel.text_vmaddr, Some(TEXT_VMADDR));
    assert_eq!(kernel.stub_vmaddr, None);
    assert!(kernel.patches.is_empty());
    assert!(ctx.load_kernel_drivers);

    // File-backed part of __TEXT.
    assert_eq!(ctx.memory.read(0x20_0000, 0x1000).unwrap(), text.as_slice());
    // Zero-filled part of __TEXT, and __DATA.
    assert_eq!(ctx.memory.read(0x20_1000, 0x1000).unwrap(), &[0_u8; 0x1000]);
    assert_eq!(ctx.memory.read(0x20_2000, 0x800).unwrap(), &[0xdd_u8; 0x800]);
    assert_eq!(ctx.memory.read(0x20_2800, 0x800).unwrap(), &[0_u8; 0x800]);
}

#[test]
fn load_32_bits_kernel() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86)
        .segment("__TEXT", TEXT_VMADDR_32, 0x1000, &[0xcc; 0x400])
        .thread(0x4000_1000)
        .build();

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert_eq!(kernel.entry, 0x1000);
    assert_eq!(kernel.image_base, 0x20_0000);
    assert_eq!(kernel.image_size, 0x1000);
    assert_eq!(ctx.memory.read(0x20_0000, 0x400).unwrap(), &[0xcc_u8; 0x400]);
}

#[test]
fn load_from_fat_binary() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let i386 = MachOBuilder::new(CPU_TYPE_X86)
        .segment("__TEXT", TEXT_VMADDR_32, 0x1000, &[1; 0x10])
        .thread(0x4000_1000)
        .build();

    let x86_64 = kernel_64(&version_symbols(), &text_contents());
    let data = fat(&[
        (CPU_TYPE_X86, i386.as_slice()),
        (CPU_TYPE_X86_64, x86_64.as_slice()),
    ]);

    let slice = select_architecture_slice(&data, CPU_TYPE_X86_64).unwrap();
    let kernel = load(&mut ctx, config, slice.data).unwrap();

    assert_eq!(kernel.entry, 0x20_1000);
    assert_eq!(ctx.platform.kernel.major, 14);
}

#[test]
fn bad_magic() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86)
        .segment("__TEXT", TEXT_VMADDR_32, 0x1000, &[0xcc; 0x400])
        .thread(0x4000_1000)
        .build();

    assert_eq!(
        load(&mut ctx, config, &image).unwrap_err(),
        Error::BadMagic {
            arch: "X86_64",
            expected: MH_MAGIC_64,
            found: MH_MAGIC
        }
    );

    assert_eq!(ctx.memory.read(0x20_0000, 0x1000).unwrap(), &[0_u8; 0x1000]);
    assert!(ctx.memory.ranges().is_empty());
    assert_eq!(ctx.memory.kernel_memory_top(), 0x10_0000);
}

#[test]
fn kernel_overflow() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    // The second segment crosses the end of the kernel window.
    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x1000])
        .segment("__DATA", TEXT_VMADDR + 0xf_f000, 0x2000, &[0xdd; 0x2000])
        .thread(TEXT_VMADDR)
        .build();

    let err = load(&mut ctx, config, &image).unwrap_err();

    assert_eq!(
        err,
        Error::KernelOverflow {
            segment: "__DATA".to_string(),
            address: 0x2f_f000,
            size: 0x2000,
        }
    );

    assert!(err.is_fatal());
    assert_eq!(ctx.memory.read(0x2f_f000, 0x1000).unwrap(), &[0_u8; 0x1000]);
}

#[test]
fn segment_in_hibernation_window() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x1000])
        .segment("__HIB", 0xffff_ff80_0000_4000, 0x2000, &[0xee; 0x1000])
        .thread(TEXT_VMADDR)
        .build();

    let kernel = load(&mut ctx, config, &image).unwrap();

    // Segments below the kernel window don't count as part of the image.
    assert_eq!(kernel.image_base, 0x20_0000);
    assert_eq!(kernel.image_size, 0x1000);

    assert_eq!(ctx.memory.read(0x4000, 0x1000).unwrap(), &[0xee_u8; 0x1000]);
    assert_eq!(ctx.memory.read(0x5000, 0x1000).unwrap(), &[0_u8; 0x1000]);
}

#[test]
fn zero_fill_overwrites_memory() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    ctx.memory.write(0x20_0000, &[0xff; 0x2000]).unwrap();

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x2000, &[0xcc; 0x800])
        .thread(TEXT_VMADDR)
        .build();

    load(&mut ctx, config, &image).unwrap();

    assert_eq!(ctx.memory.read(0x20_0000, 0x800).unwrap(), &[0xcc_u8; 0x800]);
    assert_eq!(ctx.memory.read(0x20_0800, 0x1800).unwrap(), &[0_u8; 0x1800]);
}

#[test]
fn segment_without_file_data() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    ctx.memory.write(0x20_1000, &[0xff; 0x1000]).unwrap();

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x1000])
        .segment("__BSS", TEXT_VMADDR + 0x1000, 0x1000, &[])
        .thread(TEXT_VMADDR)
        .build();

    let kernel = load(&mut ctx, config, &image).unwrap();

    // The segment is ignored, it's neither zero-filled nor part of the
    // image.
    assert_eq!(
        ctx.memory.read(0x20_1000, 0x1000).unwrap(),
        &[0xff_u8; 0x1000]
    );
    assert_eq!(kernel.image_size, 0x1000);
}

#[test]
fn segment_past_end_of_file() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment_with_offset("__TEXT", TEXT_VMADDR, 0x1000, 0x10_0000, 0x1000)
        .thread(TEXT_VMADDR)
        .build();

    assert_eq!(
        load(&mut ctx, config, &image).unwrap_err(),
        Error::Truncated { what: "segment", offset: 0x10_0000, len: 0x1000 }
    );
}

#[test]
fn prelinked_kernel() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x1000])
        .segment("__PRELINK_TEXT", TEXT_VMADDR + 0x1000, 0x1000, &[1; 0x10])
        .segment("__PRELINK_INFO", TEXT_VMADDR + 0x2000, 0x1000, &[2; 0x10])
        .segment("__KLD", TEXT_VMADDR + 0x3000, 0x1000, &[3; 0x10])
        .thread(TEXT_VMADDR)
        .build();

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert!(!ctx.load_kernel_drivers);
    assert_eq!(kernel.text_vmaddr, Some(TEXT_VMADDR));
    assert_eq!(kernel.stub_vmaddr, Some(TEXT_VMADDR + 0x3000));
    assert_eq!(kernel.image_size, 0x4000);

    // Prelinked segments are loaded like any other segment.
    assert_eq!(ctx.memory.read(0x20_1000, 0x10).unwrap(), &[1_u8; 0x10]);
    assert_eq!(ctx.memory.read(0x20_2000, 0x10).unwrap(), &[2_u8; 0x10]);
}

#[test]
fn unsatisfied_load() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__DATA", TEXT_VMADDR + 0x1000, 0x1000, &[0xdd; 0x10])
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x1000])
        .thread(TEXT_VMADDR)
        .build();

    assert_eq!(
        load(&mut ctx, config, &image).unwrap_err(),
        Error::UnsatisfiedLoad { index: 0, cmd: LC_SEGMENT_64 }
    );
}

#[test]
fn unsupported_architecture() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_ARM, &config);

    // Anything that isn't x86_64 is expected to have a 32-bit header.
    let image = MachOBuilder::new(CPU_TYPE_ARM)
        .segment("__TEXT", TEXT_VMADDR_32, 0x1000, &[0xcc; 0x10])
        .thread(0x4000_1000)
        .build();

    let err = load(&mut ctx, config, &image).unwrap_err();

    assert_eq!(err, Error::UnsupportedArchitecture { cputype: CPU_TYPE_ARM });
    assert!(err.is_fatal());
}

#[test]
fn malformed_load_command() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let mut image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x10])
        .build();

    // Make `cmdsize` larger than the whole image.
    image[36..40].copy_from_slice(&0x10_0000_u32.to_le_bytes());

    assert_eq!(
        load(&mut ctx, config, &image).unwrap_err(),
        Error::MalformedLoadCommand { offset: 32 }
    );
}

#[test]
fn kernel_version() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
    let image = kernel_64(&version_symbols(), &text_contents());

    load(&mut ctx, config, &image).unwrap();

    assert_eq!(ctx.platform.kernel.major, 14);
    assert_eq!(ctx.platform.kernel.minor, 5);
    assert_eq!(ctx.platform.kernel.revision, 0);
}

#[test]
fn kernel_version_unexpected_order() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let mut text = text_contents();
    text[0x102] = 7;

    // Walking backwards, `_version_major` and `_version_minor` are found
    // while the scan is still looking for `_version_revision`.
    let image = kernel_64(
        &[
            ("_version_revision", SECT_TEXT_CONST, TEXT_VMADDR + 0x102),
            ("_version_minor", SECT_TEXT_CONST, TEXT_VMADDR + 0x101),
            ("_version_major", SECT_TEXT_CONST, TEXT_VMADDR + 0x100),
        ],
        &text,
    );

    load(&mut ctx, config, &image).unwrap();

    assert_eq!(ctx.platform.kernel.revision, 7);
    assert_eq!(ctx.platform.kernel.minor, 0);
    assert_eq!(ctx.platform.kernel.major, 0);
}

#[test]
fn symbol_table_before_text() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .thread(TEXT_VMADDR)
        .symtab(&version_symbols())
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &text_contents())
        .build();

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert_eq!(ctx.platform.kernel, KernelVersion::default());
    // The symbol table is preserved anyway.
    assert_eq!(kernel.symbol_tables.len(), 1);
}

#[test]
fn symbol_table_preserved() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
    let symbols = version_symbols();
    let image = kernel_64(&symbols, &text_contents());

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert_eq!(kernel.symbol_tables.len(), 1);

    let table = &kernel.symbol_tables[0];

    // Allocated right after the image, which ends at 0x203000.
    assert_eq!(table.address, 0x20_3000);
    assert_eq!(table.nsyms, 6);
    assert_eq!(table.symoff, 0x20_3000 + 24);
    assert_eq!(table.stroff, table.symoff + 6 * 16);
    assert_eq!(table.size, 24 + 6 * 16 + table.strsize as u64);

    assert_eq!(
        ctx.memory.ranges(),
        &[MemoryRange {
            name: "Kernel-__SYMTAB".to_string(),
            base: 0x20_3000,
            len: table.size,
        }]
    );

    assert_eq!(ctx.memory.kernel_memory_top(), 0x20_4000);

    let read_back = table.read_symbols(&ctx.memory).unwrap();

    assert_eq!(read_back.len(), symbols.len());

    for (symbol, (name, n_sect, n_value)) in read_back.iter().zip(symbols) {
        assert_eq!(symbol.name, name);
        assert_eq!(symbol.n_sect, n_sect);
        assert_eq!(symbol.n_value, n_value);
    }
}

#[test]
fn symbol_table_not_preserved() {
    let config =
        LoaderConfig { preserve_symbol_table: false, ..config() };

    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
    let image = kernel_64(&version_symbols(), &text_contents());

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert!(kernel.symbol_tables.is_empty());
    assert!(ctx.memory.ranges().is_empty());
    // The version is still read.
    assert_eq!(ctx.platform.kernel.major, 14);
}

#[test]
fn malformed_symbol_table() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &text_contents())
        .thread(TEXT_VMADDR)
        .symtab_with_offsets(0x1100, 0, 0x1000, 0x10)
        .build();

    assert_eq!(
        load(&mut ctx, config, &image).unwrap_err(),
        Error::MalformedSymbolTable { symoff: 0x1100, stroff: 0x1000 }
    );
}

#[test]
fn load_64_bits_kernel_masks_entry() {
    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x400])
        .thread(0x4000_1000)
        .build();

    let kernel = load(&mut ctx, config, &image).unwrap();

    assert_eq!(kernel.entry, 0x1000);
}

#[test]
fn prelinked_segment_outside_memory() {
    // Memory only backs the first page of the kernel window, but the
    // loader is told that the whole window is available.
    let memory_config = LoaderConfig {
        kernel_window: AddressWindow { base: 0x20_0000, len: 0x1000 },
        ..config()
    };

    let config = config();
    let mut ctx = boot_context(CPU_TYPE_X86_64, &memory_config);

    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &[0xcc; 0x1000])
        .segment("__PRELINK_TEXT", TEXT_VMADDR + 0x1000, 0x1000, &[1; 0x10])
        .thread(TEXT_VMADDR)
        .build();

    assert_eq!(
        load(&mut ctx, config, &image).unwrap_err(),
        Error::OutOfBounds { address: 0x20_1000, len: 0x1000 }
    );

    // Nothing was copied, so the flag is left alone.
    assert!(ctx.load_kernel_drivers);
}

#[test]
fn kernel_version_truncated_symbol_table() {
    let preserving = config();
    let config =
        LoaderConfig { preserve_symbol_table: false, ..config() };

    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    // The string table lies past the end of the file.
    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &text_contents())
        .thread(TEXT_VMADDR)
        .symtab_with_offsets(0x1000, 4, 0x10_0000, 0x100)
        .build();

    load(&mut ctx, config, &image).unwrap();

    assert_eq!(ctx.platform.kernel, KernelVersion::default());

    // The same table can't be preserved.
    let mut ctx = boot_context(CPU_TYPE_X86_64, &preserving);

    assert!(matches!(
        load(&mut ctx, preserving, &image),
        Err(Error::Truncated { what: "symbol table", .. })
    ));
}

#[test]
fn kernel_version_empty_symbol_table() {
    let config =
        LoaderConfig { preserve_symbol_table: false, ..config() };

    let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

    // Without symbols the string table is never read.
    let image = MachOBuilder::new(CPU_TYPE_X86_64)
        .segment("__TEXT", TEXT_VMADDR, 0x1000, &text_contents())
        .thread(TEXT_VMADDR)
        .symtab_with_offsets(0x1000, 0, 0x10_0000, 0x100)
        .build();

    load(&mut ctx, config, &image).unwrap();

    assert_eq!(ctx.platform.kernel, KernelVersion::default());
}

#[cfg(feature = "patching")]
mod patching {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::macho::{SECT_DATA_DATA, SECT_KLD_TEXT};
    use crate::{AppliedPatch, PatchSite};

    const TARGET: u64 = 0x1122_3344_5566_7788;
    const REPLACEMENT: u64 = 0x8877_6655_4433_2211;

    fn put(text: &mut [u8], offset: usize, value: u64) {
        text[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn load_executable_kernel(text: &[u8]) -> Vec<u8> {
        kernel_64(
            &[
                ("_printf", SECT_TEXT_TEXT, TEXT_VMADDR + 0x180),
                (
                    "__ZN6OSKext14loadExecutableEv",
                    SECT_TEXT_TEXT,
                    TEXT_VMADDR + 0x200,
                ),
            ],
            text,
        )
    }

    #[test]
    fn replaces_first_occurrence() {
        let config = LoaderConfig {
            patch_sites: vec![PatchSite::load_executable(
                TARGET,
                REPLACEMENT,
            )],
            ..config()
        };

        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

        let mut text = text_contents();
        // Before the symbol, must not be touched.
        put(&mut text, 0x1f0, TARGET);
        put(&mut text, 0x210, TARGET);
        put(&mut text, 0x220, TARGET);

        let kernel =
            load(&mut ctx, config, &load_executable_kernel(&text)).unwrap();

        assert_eq!(
            kernel.patches,
            vec![AppliedPatch {
                symbol: "__ZN6OSKext14loadExecutableEv".to_string(),
                address: 0x20_0210,
            }]
        );

        let mut expected = text.clone();
        put(&mut expected, 0x210, REPLACEMENT);

        assert_eq!(
            ctx.memory.read(0x20_0000, 0x1000).unwrap(),
            expected.as_slice()
        );
    }

    #[test]
    fn pattern_not_found() {
        let config = LoaderConfig {
            patch_sites: vec![PatchSite::load_executable(
                TARGET,
                REPLACEMENT,
            )],
            ..config()
        };

        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
        let text = text_contents();

        let kernel =
            load(&mut ctx, config, &load_executable_kernel(&text)).unwrap();

        assert!(kernel.patches.is_empty());
        assert_eq!(
            ctx.memory.read(0x20_0000, 0x1000).unwrap(),
            text.as_slice()
        );
    }

    #[test]
    fn window_is_inclusive() {
        let mut site = PatchSite::load_executable(TARGET, REPLACEMENT);
        site.window = 0x10;

        let config = LoaderConfig { patch_sites: vec![site], ..config() };
        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

        let mut text = text_contents();
        put(&mut text, 0x210, TARGET);

        let kernel =
            load(&mut ctx, config, &load_executable_kernel(&text)).unwrap();

        assert_eq!(kernel.patches.len(), 1);
        assert_eq!(
            ctx.memory.read(0x20_0210, 8).unwrap(),
            REPLACEMENT.to_le_bytes()
        );
    }

    #[test]
    fn disabled_site() {
        let mut site = PatchSite::load_executable(TARGET, REPLACEMENT);
        site.enabled = false;

        let config = LoaderConfig { patch_sites: vec![site], ..config() };
        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

        let mut text = text_contents();
        put(&mut text, 0x210, TARGET);

        let kernel =
            load(&mut ctx, config, &load_executable_kernel(&text)).unwrap();

        assert!(kernel.patches.is_empty());
        assert_eq!(
            ctx.memory.read(0x20_0210, 8).unwrap(),
            TARGET.to_le_bytes()
        );
    }

    fn xcpm_kernel(text: &[u8]) -> Vec<u8> {
        kernel_64(
            &[("_xcpm_core_scope_msrs", SECT_DATA_DATA, TEXT_VMADDR + 0x400)],
            text,
        )
    }

    fn xcpm_text() -> Vec<u8> {
        let mut text = text_contents();
        put(&mut text, 0x408, TARGET);
        put(&mut text, 0x438, u64::MAX);
        put(&mut text, 0x468, u64::MAX);
        text
    }

    #[test]
    fn xcpm_requires_locked_msr() {
        let config = LoaderConfig {
            patch_sites: vec![PatchSite::xcpm_core_scope_msrs(TARGET)],
            ..config()
        };

        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
        let text = xcpm_text();

        let kernel = load(&mut ctx, config, &xcpm_kernel(&text)).unwrap();

        assert!(kernel.patches.is_empty());
        assert_eq!(
            ctx.memory.read(0x20_0000, 0x1000).unwrap(),
            text.as_slice()
        );
    }

    #[test]
    fn xcpm_with_locked_msr() {
        let config = LoaderConfig {
            patch_sites: vec![PatchSite::xcpm_core_scope_msrs(TARGET)],
            ..config()
        };

        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);
        ctx.platform.cpu.cst_config_msr_locked = true;

        let text = xcpm_text();
        let kernel = load(&mut ctx, config, &xcpm_kernel(&text)).unwrap();

        assert_eq!(kernel.patches.len(), 1);
        assert_eq!(kernel.patches[0].address, 0x20_0408);

        let mut expected = text.clone();
        put(&mut expected, 0x408, 0);
        put(&mut expected, 0x438, 0);
        put(&mut expected, 0x468, 0);

        assert_eq!(
            ctx.memory.read(0x20_0000, 0x1000).unwrap(),
            expected.as_slice()
        );
    }

    fn kld_kernel(text: &[u8]) -> Vec<u8> {
        let symbol = "__ZN12KLDBootstrap21readStartupExtensionsEv";

        // The symbol appears twice, the site must be applied only at the
        // first one.
        kernel_64(
            &[
                (symbol, SECT_KLD_TEXT, TEXT_VMADDR + 0x600),
                (symbol, SECT_KLD_TEXT, TEXT_VMADDR + 0x700),
            ],
            text,
        )
    }

    #[test]
    fn read_startup_extensions() {
        let config = LoaderConfig {
            patch_sites: vec![PatchSite::read_startup_extensions(
                TARGET,
                REPLACEMENT,
            )],
            ..config()
        };

        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

        let mut text = text_contents();
        put(&mut text, 0x610, TARGET);
        put(&mut text, 0x710, TARGET);

        let kernel = load(&mut ctx, config, &kld_kernel(&text)).unwrap();

        assert_eq!(
            kernel.patches,
            vec![AppliedPatch {
                symbol: "__ZN12KLDBootstrap21readStartupExtensionsEv"
                    .to_string(),
                address: 0x20_0610,
            }]
        );

        let mut expected = text.clone();
        put(&mut expected, 0x610, REPLACEMENT);

        assert_eq!(
            ctx.memory.read(0x20_0000, 0x1000).unwrap(),
            expected.as_slice()
        );
    }

    #[test]
    fn first_site_for_section_wins() {
        let mut printf = PatchSite::load_executable(TARGET, REPLACEMENT);
        printf.symbol = "_printf".to_string();
        printf.window = 0x10;

        // Both sites are for section 1, `_printf` goes first so
        // `loadExecutable` never gets a chance.
        let config = LoaderConfig {
            patch_sites: vec![
                printf,
                PatchSite::load_executable(TARGET, REPLACEMENT),
            ],
            ..config()
        };

        let mut ctx = boot_context(CPU_TYPE_X86_64, &config);

        let mut text = text_contents();
        put(&mut text, 0x188, TARGET);
        put(&mut text, 0x210, TARGET);

        let kernel =
            load(&mut ctx, config, &load_executable_kernel(&text)).unwrap();

        assert_eq!(
            kernel.patches,
            vec![AppliedPatch {
                symbol: "_printf".to_string(),
                address: 0x20_0188,
            }]
        );

        assert_eq!(
            ctx.memory.read(0x20_0210, 8).unwrap(),
            TARGET.to_le_bytes()
        );
    }
}
