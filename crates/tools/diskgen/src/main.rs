//! Command line interface for building disk images.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use diskgen_core::disk::stream::ImgStream;
use diskgen_core::disk::{NativeBackend, SfdiskBackend, TableBackend};
use diskgen_core::BuildContext;

pub mod config;
pub mod logging;

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Args {
    /// Enable debug output.
    #[clap(short, long, global = true)]
    verbose: bool,
    /// The command to execute.
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Build an image from a configuration file.
    Build(BuildCommand),
    /// Print the partition table of an image.
    Inspect(InspectCommand),
}

#[derive(Debug, Parser)]
pub struct BuildCommand {
    /// The output image.
    #[clap(short, long, default_value = "image.raw")]
    output: PathBuf,
    /// Working directory for temporary files.
    #[clap(short = 't', long)]
    tempdir: Option<PathBuf>,
    /// Backend for writing the partition table.
    #[clap(long, value_enum, default_value_t = TableBackendKind::Native)]
    table_backend: TableBackendKind,
    /// The image configuration file.
    config: PathBuf,
}

#[derive(Debug, Parser)]
pub struct InspectCommand {
    /// The image to inspect.
    image: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TableBackendKind {
    /// Write the partition table directly.
    Native,
    /// Write the partition table with `sfdisk`.
    Sfdisk,
}

fn build(cmd: &BuildCommand) -> anyhow::Result<()> {
    let config = config::load_config(&cmd.config)?;
    let base_dir = cmd.config.parent().unwrap_or(Path::new(""));
    let mut ctx = match &cmd.tempdir {
        Some(dir) => BuildContext::with_work_dir(dir)?,
        None => BuildContext::new()?,
    };
    let mut label = config.into_label(base_dir, &mut ctx)?;
    info!("Preparing...");
    label.prepare(&mut ctx)?;
    info!("The final layout:\n{label}");
    info!("Writing image to {}", cmd.output.display());
    let backend: &dyn TableBackend = match cmd.table_backend {
        TableBackendKind::Native => &NativeBackend,
        TableBackendKind::Sfdisk => &SfdiskBackend,
    };
    label
        .create_with(&ctx, &cmd.output, backend)
        .with_context(|| format!("unable to write image {}", cmd.output.display()))?;
    Ok(())
}

fn inspect(cmd: &InspectCommand) -> anyhow::Result<()> {
    let file = File::open(&cmd.image)
        .with_context(|| format!("unable to open image {}", cmd.image.display()))?;
    let mut stream = ImgStream::new(BufReader::new(file))?;
    println!("Disk id: {}", stream.disk_id());
    if let Some(lba) = stream.gpt_entries_lba() {
        println!("GPT entries at LBA {lba}");
    }
    if let Some(extended) = stream.extended() {
        println!("Extended: {extended}");
    }
    let mut number = 1;
    while let Some(partition) = stream.next_partition()? {
        println!("{number}: {}", partition.entry());
        number += 1;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.verbose);
    match &args.command {
        Command::Build(cmd) => build(cmd),
        Command::Inspect(cmd) => inspect(cmd),
    }
}
