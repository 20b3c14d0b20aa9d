use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use squashpart::{
    codec::Compression,
    config::{Config, DEFAULT_CONFIG_PATH},
    engine::{Backends, Engine, RunOptions},
    error::Category,
    layout::LayoutRequest,
    loop_device::KernelLoop,
    mkfs::{Mkfs, OverlayFs},
    partition::Parted,
    pipeline::{repartition, Job},
    size::format_size,
    squashfs::SquashfsProbe,
    Error, OVERLAY_LABEL,
};

/// Shrink the squashfs root partition of a firmware image and add an overlay partition
#[derive(Debug, Parser)]
#[clap(name = "squashpart", version)]
struct Args {
    /// Input image, compressed or raw
    input: PathBuf,
    /// Output image, written with the same compression as the input
    output: PathBuf,

    /// Size of the overlay partition (e.g. "256MiB")
    #[clap(long, short = 'o')]
    overlay_size: Option<String>,
    /// Size of the root partition [default: squashfs content rounded up to 8MiB]
    #[clap(long, short = 'r')]
    root_size: Option<String>,
    /// Overlay filesystem: ext4 or f2fs
    #[clap(long, short = 't')]
    filesystem: Option<OverlayFs>,
    /// Overlay volume label
    #[clap(long)]
    label: Option<String>,
    /// auto, gzip, xz, bzip2, zstd or raw
    #[clap(long, short = 'c')]
    compression: Option<Compression>,
    /// Configuration file [default: /etc/squashpart.toml]
    #[clap(long)]
    config: Option<PathBuf>,
    /// Directory for the uncompressed working image
    #[clap(long)]
    workdir: Option<PathBuf>,

    /// Print the planned layout without changing anything
    #[clap(long)]
    dry_run: bool,
    /// Overwrite an existing output
    #[clap(long, short = 'f')]
    force: bool,
    /// Debug logging
    #[clap(long, short = 'v')]
    verbose: bool,
    /// No progress bars
    #[clap(long, short = 'q')]
    quiet: bool,
}

fn exit_code(category: Option<Category>) -> u8 {
    match category {
        Some(Category::Parse) => 2,
        Some(Category::Detection) => 3,
        Some(Category::Constraint) => 4,
        Some(Category::ResourceExhaustion) => 5,
        Some(Category::ToolFailure) | None => 1,
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path, true)?,
        None => Config::load(Path::new(DEFAULT_CONFIG_PATH), false)?,
    };
    let settings = Config {
        root_size: args.root_size,
        overlay_size: args.overlay_size,
        filesystem: args.filesystem,
        label: args.label,
        compression: args.compression,
        workdir: args.workdir,
        ..Default::default()
    }
    .or(config);

    // sizes are checked before anything is touched
    let overlay_size = settings.overlay_size.as_deref().ok_or(Error::Parse {
        what: "overlay size",
        value: String::new(),
    })?;
    let request = LayoutRequest::parse(settings.root_size.as_deref(), overlay_size)?;

    let loops = KernelLoop;
    let parted = settings.parted.map(Parted::new).unwrap_or_default();
    let mut mkfs = Mkfs::default();
    if let Some(path) = settings.mkfs_ext4 {
        mkfs.ext4 = path;
    }
    if let Some(path) = settings.mkfs_f2fs {
        mkfs.f2fs = path;
    }
    let engine = Engine::new(
        Backends {
            loops: &loops,
            table: &parted,
            probe: &SquashfsProbe,
            formatter: &mkfs,
        },
        RunOptions {
            overlay_fs: settings.filesystem.unwrap_or_default(),
            label: settings.label.unwrap_or_else(|| OVERLAY_LABEL.into()),
            dry_run: args.dry_run,
            progress: !args.quiet && std::io::stderr().is_terminal(),
        },
    );

    let job = Job {
        input: args.input,
        output: args.output,
        compression: settings.compression.unwrap_or_default(),
        workdir: settings.workdir,
        force: args.force,
    };
    let outcome = repartition(&job, &engine, &request)
        .with_context(|| format!("repartitioning {}", job.input.display()))?;

    match outcome.overlay_index {
        None => println!("{}", outcome.plan),
        Some(index) => info!(
            "{}: root {}, overlay partition {index} {}",
            job.output.display(),
            format_size(outcome.plan.root_size()),
            format_size(outcome.plan.overlay_size()),
        ),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = match args.verbose {
        true => "debug",
        false => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let category = err.downcast_ref::<Error>().map(Error::category);
            match category {
                Some(category) => eprintln!("squashpart: {}: {err:#}", category.name()),
                None => eprintln!("squashpart: {err:#}"),
            }
            ExitCode::from(exit_code(category))
        }
    }
}
