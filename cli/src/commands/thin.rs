use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{arg, value_parser, ArgMatches, Command};

use crate::commands::{fat_slice, Arch};
use crate::help;

pub fn thin() -> Command {
    super::command("thin")
        .about("Extract a single architecture from a FAT binary")
        .long_about(help::THIN_LONG_HELP)
        .arg(
            arg!(<KERNEL>)
                .help("Path to the FAT binary")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-a --arch <ARCH>)
                .help("Architecture to extract")
                .required(true)
                .value_parser(value_parser!(Arch)),
        )
        .arg(
            arg!(-o --output <OUTPUT_FILE>)
                .help("Output file")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
}

pub fn exec_thin(args: &ArgMatches) -> anyhow::Result<()> {
    let kernel_path = args
        .get_one::<PathBuf>("KERNEL")
        .context("kernel path is missing")?;

    let output_path =
        args.get_one::<PathBuf>("output").context("output is missing")?;

    let arch = *args.get_one::<Arch>("arch").context("arch is missing")?;

    let data = fs::read(kernel_path).with_context(|| {
        format!("can not read `{}`", kernel_path.display())
    })?;

    let Some(slice) = fat_slice(&data, arch)? else {
        bail!("`{}` is not a FAT binary", kernel_path.display());
    };

    fs::write(output_path, slice).with_context(|| {
        format!("can not write `{}`", output_path.display())
    })?;

    println!(
        "{}: {:#x} bytes written to `{}`",
        arch.name(),
        slice.len(),
        output_path.display()
    );

    Ok(())
}
