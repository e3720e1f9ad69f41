mod load;
mod thin;

pub use load::*;
pub use thin::*;

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::{arg, command, crate_authors, Command, ValueEnum};
use machload::{
    select_architecture_slice, ArchSlice, Error, CPU_TYPE_X86,
    CPU_TYPE_X86_64,
};

use crate::{commands, help, APP_HELP_TEMPLATE};

/// Architectures supported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
pub enum Arch {
    I386,
    #[value(name = "x86_64")]
    X86_64,
}

impl Arch {
    pub fn cpu_type(&self) -> u32 {
        match self {
            Arch::I386 => CPU_TYPE_X86,
            Arch::X86_64 => CPU_TYPE_X86_64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::I386 => "i386",
            Arch::X86_64 => "x86_64",
        }
    }
}

pub fn command(name: &'static str) -> Command {
    Command::new(name).help_template(
        r#"{about-with-newline}
{usage-heading}
  {usage}

{all-args}
"#,
    )
}

pub fn cli() -> Command {
    command!()
        .author(crate_authors!("\n")) // requires `cargo` feature
        .arg_required_else_help(true)
        .arg(
            arg!(-C --config <CONFIG_FILE> "Config file")
                .value_parser(existing_path_parser)
                .long_help(help::CONFIG_FILE),
        )
        .help_template(APP_HELP_TEMPLATE)
        .subcommand_required(true)
        .subcommands(vec![commands::load(), commands::thin()])
}

/// Parses a path and makes sure that it exists.
fn existing_path_parser(input: &str) -> Result<PathBuf, anyhow::Error> {
    let path = PathBuf::from(input);
    if path.try_exists()? {
        Ok(path)
    } else {
        Err(anyhow!("file not found"))
    }
}

/// Returns the slice of a FAT binary that corresponds to `arch`.
///
/// Returns `None` if `data` is not a FAT binary.
fn fat_slice(data: &[u8], arch: Arch) -> anyhow::Result<Option<&[u8]>> {
    let ArchSlice { data: slice, offset, length } =
        match select_architecture_slice(data, arch.cpu_type()) {
            Ok(slice) => slice,
            Err(Error::BadFatMagic { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

    if length == 0 {
        bail!("FAT binary doesn't contain an {} image", arch.name());
    }

    match slice.get(..length as usize) {
        Some(slice) => Ok(Some(slice)),
        None => bail!(
            "{} slice at offset {:#x} with size {:#x} exceeds the file size",
            arch.name(),
            offset,
            length
        ),
    }
}
