use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{arg, value_parser, ArgMatches, Command};
use machload::{BootContext, LoadedKernel, Loader, Platform};
use yansi::Color::{Green, Yellow};
use yansi::Paint;

use crate::commands::{fat_slice, Arch};
use crate::config::Config;
use crate::help;

pub fn load() -> Command {
    super::command("load")
        .about("Load a kernel image and show where it was placed")
        .long_about(help::LOAD_LONG_HELP)
        .arg(
            arg!(<KERNEL>)
                .help("Path to the kernel image")
                .value_parser(value_parser!(PathBuf)),
        )
        // Keep options sorted alphabetically by their long name.
        // For instance, --bar goes before --foo.
        .arg(
            arg!(-a --arch <ARCH>)
                .help("Architecture the kernel is loaded for")
                .value_parser(value_parser!(Arch))
                .default_value("x86_64"),
        )
        .arg(
            arg!(-p --patch)
                .help("Apply the patch sites defined in the config file")
                .long_help(help::PATCH_LONG_HELP),
        )
}

pub fn exec_load(args: &ArgMatches, config: Config) -> anyhow::Result<()> {
    let kernel_path = args
        .get_one::<PathBuf>("KERNEL")
        .context("kernel path is missing")?;

    let arch = args.get_one::<Arch>("arch").copied().unwrap_or(Arch::X86_64);

    let data = fs::read(kernel_path).with_context(|| {
        format!("can not read `{}`", kernel_path.display())
    })?;

    let image = fat_slice(&data, arch)?.unwrap_or(data.as_slice());

    let mut loader_config = config.loader;

    if !args.get_flag("patch") {
        loader_config.patch_sites = Vec::new();
    }

    let mut platform = Platform::new(arch.cpu_type());
    platform.cpu = config.cpu;

    let memory = loader_config
        .physical_memory()
        .context("invalid address window in config file")?;

    let mut ctx = BootContext::new(platform, memory);

    let kernel = Loader::new(loader_config)
        .decode_and_load_kernel(&mut ctx, image)
        .map_err(|err| {
            let context = if err.is_fatal() {
                "boot halted"
            } else {
                "can not load kernel"
            };
            anyhow::Error::new(err).context(context)
        })?;

    print_kernel(&ctx, &kernel);

    Ok(())
}

fn print_kernel(ctx: &BootContext, kernel: &LoadedKernel) {
    let version = &ctx.platform.kernel;

    println!(
        "{} {:#010x}",
        "entry:         ".paint(Green).bold(),
        kernel.entry
    );

    println!(
        "{} {:#010x}-{:#010x} ({:#x} bytes)",
        "image:         ".paint(Green).bold(),
        kernel.image_base,
        kernel.image_base.wrapping_add(kernel.image_size),
        kernel.image_size
    );

    println!(
        "{} {}.{}.{}",
        "kernel version:".paint(Green).bold(),
        version.major,
        version.minor,
        version.revision
    );

    println!(
        "{} {}",
        "load kexts:    ".paint(Green).bold(),
        if ctx.load_kernel_drivers { "yes" } else { "no" }
    );

    for table in &kernel.symbol_tables {
        println!(
            "{} {:#010x} ({} symbols, {:#x} bytes)",
            "symbol table:  ".paint(Green).bold(),
            table.address,
            table.nsyms,
            table.size
        );
    }

    for patch in &kernel.patches {
        println!(
            "{} {} at {:#010x}",
            "patched:       ".paint(Yellow).bold(),
            patch.symbol,
            patch.address
        );
    }
}
