//! lvmrootfs - GPT disk images with an encrypted LVM root
//!
//! Builds the image directly on the host, or emits an equivalent shell
//! script for a build system to run later.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lvmrootfs::cleanup::{Cleaner, CleanupTargets};
use lvmrootfs::config::{parse_param, DiskConfig, RawConfig};
use lvmrootfs::disk::layouts::{compute_layout, print_layout_summary, ImageLayout};
use lvmrootfs::provision::pipeline::BuildTarget;
use lvmrootfs::provision::{self, BuildRequest};
use lvmrootfs::resources;
use lvmrootfs::script::emit_script;
use lvmrootfs::utils::command::CommandRunner;
use lvmrootfs::utils::signal;
use lvmrootfs::LvmRootfsError;

#[derive(Parser)]
#[command(name = "lvmrootfs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dry run mode - show what would be done without making changes
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the disk configuration comes from
#[derive(Args, Clone)]
struct ConfigArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a parameter (key=value, repeatable), e.g. lvm-volumes=varfs:512
    #[arg(short = 'p', long = "param")]
    param: Vec<String>,

    /// Whitespace-separated key=value parameters, as passed by build systems
    #[arg(long, env = "LVMROOTFS_PARAMS")]
    params: Option<String>,
}

#[derive(Args, Clone)]
struct SizeArgs {
    /// Base image size in MiB
    #[arg(short, long, env = "LVMROOTFS_SIZE_MB")]
    size_mb: u64,

    /// Extra space in MiB added on top of the base size
    #[arg(short, long, default_value_t = 0, env = "LVMROOTFS_EXTRA_SPACE_MB")]
    extra_space_mb: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the disk image on this host
    Build {
        #[command(flatten)]
        size: SizeArgs,

        #[command(flatten)]
        config: ConfigArgs,

        /// Output image path
        #[arg(short, long)]
        output: PathBuf,

        /// Root filesystem tree to copy into the image (left empty if omitted)
        #[arg(short, long)]
        rootfs_dir: Option<PathBuf>,

        /// Skip the orphan scan and utility probe
        #[arg(long)]
        skip_preflight: bool,

        /// Print the build summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a standalone shell script that builds the image
    EmitScript {
        #[command(flatten)]
        size: SizeArgs,

        #[command(flatten)]
        config: ConfigArgs,

        /// Directory for the script (defaults to a fresh temporary directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Validate the configuration and show the computed layout
    Plan {
        #[command(flatten)]
        size: SizeArgs,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Sweep orphaned loop devices and probe the required utilities
    Preflight {
        /// Also require rsync, for builds that copy a root filesystem
        #[arg(long)]
        populate: bool,
    },

    /// Release resources left behind by an interrupted build
    Cleanup {
        /// Volume group to deactivate
        #[arg(long)]
        vg: Option<String>,

        /// Encrypted mapping to close
        #[arg(long)]
        luks_name: Option<String>,

        /// Loop device to detach (e.g., /dev/loop3)
        #[arg(long = "loop")]
        loop_device: Option<String>,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "lvmrootfs.toml")]
        output: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    signal::install_signal_handlers();

    let dry_run = cli.dry_run;
    if dry_run {
        info!("Running in dry-run mode - no changes will be made");
    }

    let result = match cli.command {
        Commands::Build {
            size,
            config,
            output,
            rootfs_dir,
            skip_preflight,
            json,
        } => cmd_build(&size, &config, &output, rootfs_dir.as_deref(), skip_preflight, json, dry_run),
        Commands::EmitScript {
            size,
            config,
            output_dir,
        } => cmd_emit_script(&size, &config, output_dir),
        Commands::Plan { size, config } => cmd_plan(&size, &config),
        Commands::Preflight { populate } => cmd_preflight(populate, dry_run),
        Commands::Cleanup {
            vg,
            luks_name,
            loop_device,
        } => cmd_cleanup(vg, luks_name, loop_device, dry_run),
        Commands::GenerateConfig { output } => cmd_generate_config(&output),
    };

    let interrupted = matches!(
        result.as_ref().err().and_then(|e| e.downcast_ref::<LvmRootfsError>()),
        Some(LvmRootfsError::Interrupted)
    );
    if interrupted {
        signal::reraise();
    }
    result
}

/// Merge the configuration file (if any) with command-line parameters.
fn load_config(args: &ConfigArgs) -> Result<RawConfig> {
    let mut raw = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RawConfig::from_file(path)?
        }
        None => RawConfig::default(),
    };

    let mut pairs = Vec::new();
    if let Some(params) = &args.params {
        for token in params.split_whitespace() {
            pairs.push(parse_param(token)?);
        }
    }
    for token in &args.param {
        pairs.push(parse_param(token)?);
    }
    raw.apply_params(pairs)?;
    Ok(raw)
}

fn plan(size: &SizeArgs, args: &ConfigArgs) -> Result<(DiskConfig, ImageLayout)> {
    let raw = load_config(args)?;
    let config = DiskConfig::from_raw(&raw)?;
    let layout = compute_layout(size.size_mb, size.extra_space_mb, &config)?;
    Ok((config, layout))
}

fn cmd_build(
    size: &SizeArgs,
    args: &ConfigArgs,
    output: &Path,
    rootfs_dir: Option<&Path>,
    skip_preflight: bool,
    json: bool,
    dry_run: bool,
) -> Result<()> {
    if let Some(dir) = rootfs_dir {
        if !dir.is_dir() {
            bail!("Root filesystem directory not found: {}", dir.display());
        }
    }
    if output.exists() && !dry_run {
        bail!("Output image already exists: {}", output.display());
    }

    let raw = load_config(args)?;
    let request = BuildRequest {
        size_mb: size.size_mb,
        extra_mb: size.extra_space_mb,
        target: BuildTarget {
            image_path: output.to_string_lossy().into_owned(),
            rootfs_dir: rootfs_dir.map(|d| d.to_string_lossy().into_owned()),
            mount_base: resources::mount_base().to_string_lossy().into_owned(),
        },
        preflight: !skip_preflight,
    };

    let runner = CommandRunner::new(dry_run);
    let summary = provision::provision(&runner, &raw, &request)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print();
        println!("✓ Disk image created: {}", summary.image);
    }
    Ok(())
}

fn cmd_emit_script(size: &SizeArgs, args: &ConfigArgs, output_dir: Option<PathBuf>) -> Result<()> {
    let (config, layout) = plan(size, args)?;
    let dir = output_dir.unwrap_or_else(resources::script_dir);
    let path = emit_script(&config, &layout, &dir)?;
    println!("✓ Script written to {}", path.display());
    println!("  Usage: {} <rootfs_dir> <output_image>", path.display());
    Ok(())
}

fn cmd_plan(size: &SizeArgs, args: &ConfigArgs) -> Result<()> {
    let (config, layout) = plan(size, args)?;
    print_layout_summary(&layout, &config);
    println!("✓ Configuration is valid");
    Ok(())
}

fn cmd_preflight(populate: bool, dry_run: bool) -> Result<()> {
    let runner = CommandRunner::new(dry_run);
    provision::preflight(&runner, populate)?;
    println!("✓ All required utilities are available");
    Ok(())
}

fn cmd_cleanup(
    vg_name: Option<String>,
    luks_name: Option<String>,
    loop_device: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let runner = CommandRunner::new(dry_run);
    let report = Cleaner::new(&runner).cleanup(&CleanupTargets {
        vg_name,
        luks_name,
        loop_device,
    });

    if report.is_clean() {
        println!("✓ Cleanup complete");
    } else {
        println!("⚠ Could not release: {}", report.failed.join(", "));
    }
    Ok(())
}

fn cmd_generate_config(output: &str) -> Result<()> {
    let sample = RawConfig::sample();
    let content = toml::to_string_pretty(&sample)?;
    std::fs::write(output, content)?;
    println!("✓ Sample configuration written to {}", output);
    Ok(())
}
