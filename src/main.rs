//! emcomm-iso - customized EmComm Tools installer image builder.
//!
//! Takes an Ubuntu desktop installer image, installs the EmComm Tools vendor
//! payload into its root filesystem, applies operator settings, and writes a
//! new bootable image that can optionally install itself unattended.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::error;

use emcomm_iso::commands;
use emcomm_iso::commands::clean::CleanTarget as CleanCmd;
use emcomm_iso::commands::show::ShowTarget as ShowCmd;
use emcomm_iso::config::{BuildConfig, CliOverrides, ReleaseMode};
use emcomm_iso::error::BuildError;
use emcomm_iso::partition::PartitionStrategy;
use emcomm_iso::release::GitHubSource;
use emcomm_iso::{interrupt, logging};

#[derive(Parser)]
#[command(name = "emcomm-iso")]
#[command(about = "Customized EmComm Tools installer image builder")]
#[command(
    after_help = "QUICK START:\n  emcomm-iso preflight         Check host tools and privileges\n  emcomm-iso build --dry-run   Show what a build would do\n  sudo emcomm-iso build        Build output/<tag>-custom.iso\n  emcomm-iso clean             Remove extracted trees"
)]
struct Cli {
    /// Project directory holding .env, cache/, work/, output/ and logs/
    #[arg(long, global = true, default_value = ".")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command that loads the configuration.
#[derive(clap::Args)]
struct ReleaseArgs {
    /// Release mode: stable, latest or tag
    #[arg(long, value_name = "MODE")]
    release: Option<String>,

    /// Release tag (implies --release tag)
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the customized image (downloads artifacts automatically)
    Build {
        #[command(flatten)]
        release: ReleaseArgs,

        /// Skip desktop defaults and operator backups
        #[arg(long)]
        minimal: bool,

        /// Resolve the release and print the plan without touching the disk
        #[arg(long)]
        dry_run: bool,

        /// Fail the build when a critical verification check fails
        #[arg(long)]
        strict_verify: bool,

        /// Generate an unattended-install descriptor and patch boot entries
        #[arg(long)]
        autoinstall: bool,

        /// Disk inspected at build time to choose the partition strategy
        #[arg(long, value_name = "DEVICE")]
        target_disk: Option<String>,

        /// Partition strategy: reuse-partition, entire-disk or free-space
        #[arg(long, value_name = "STRATEGY")]
        partition: Option<PartitionStrategy>,

        /// Swap size in GiB (overrides the computed size)
        #[arg(long, value_name = "GIB")]
        swap_gib: Option<u64>,

        /// Allow the entire-disk strategy to erase the target disk
        #[arg(long)]
        dangerously_erase_target_disk: bool,
    },

    /// Resolve the release and download the base image and vendor payload
    Download {
        #[command(flatten)]
        release: ReleaseArgs,
    },

    /// Unpack the cached base image into work/ for inspection
    Extract,

    /// Run preflight checks (host tools, privileges, configuration)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Clean build artifacts (default: extracted trees only)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Extracted image tree and root filesystem
    Work,
    /// Finished images
    Output,
    /// Downloaded base image and payloads
    Cache,
    /// Everything
    All,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration (secrets masked)
    Config,
    /// Show the release a build would use
    Release {
        #[command(flatten)]
        release: ReleaseArgs,
    },
    /// List cached artifacts with SHA-256 digests
    Cache,
}

impl ReleaseArgs {
    fn mode(&self) -> Result<Option<ReleaseMode>> {
        match (&self.release, &self.tag) {
            (None, None) => Ok(None),
            (None, Some(tag)) => Ok(Some(ReleaseMode::Tag(tag.clone()))),
            (Some(mode), tag) => ReleaseMode::parse(mode, tag.as_deref()).map(Some),
        }
    }
}

fn load(base_dir: &Path, cli: CliOverrides) -> Result<BuildConfig> {
    // chroot and mount want absolute paths.
    let base_dir = if base_dir.is_absolute() {
        base_dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(base_dir)
    };
    BuildConfig::load(&base_dir, &cli)
}

fn source(config: &BuildConfig) -> Result<GitHubSource> {
    GitHubSource::new(&config.vendor_repo, config.github_token.clone())
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = cli.base_dir;

    match cli.command {
        Commands::Build {
            release,
            minimal,
            dry_run,
            strict_verify,
            autoinstall,
            target_disk,
            partition,
            swap_gib,
            dangerously_erase_target_disk,
        } => {
            let config = load(
                &base_dir,
                CliOverrides {
                    release: release.mode()?,
                    minimal,
                    dry_run,
                    strict_verify,
                    autoinstall,
                    confirm_erase: dangerously_erase_target_disk,
                    target_disk,
                    partition,
                    swap_gib,
                },
            )?;
            if let Some(log) = logging::init_for_build(&config.log_dir, config.dry_run)? {
                eprintln!("Logging to {}", log.display());
            }
            interrupt::install()?;
            commands::cmd_build(&config, &source(&config)?)
        }

        Commands::Download { release } => {
            logging::init_console();
            let config = load(
                &base_dir,
                CliOverrides {
                    release: release.mode()?,
                    ..Default::default()
                },
            )?;
            commands::cmd_download(&config, &source(&config)?)
        }

        Commands::Extract => {
            logging::init_console();
            let config = load(&base_dir, CliOverrides::default())?;
            commands::cmd_extract(&config)
        }

        Commands::Preflight { strict } => {
            logging::init_console();
            let config = load(&base_dir, CliOverrides::default())?;
            commands::cmd_preflight(&config, strict)
        }

        Commands::Clean { what } => {
            logging::init_console();
            let config = load(&base_dir, CliOverrides::default())?;
            let target = match what {
                None | Some(CleanTarget::Work) => CleanCmd::Work,
                Some(CleanTarget::Output) => CleanCmd::Output,
                Some(CleanTarget::Cache) => CleanCmd::Cache,
                Some(CleanTarget::All) => CleanCmd::All,
            };
            commands::cmd_clean(&config, target)
        }

        Commands::Show { what } => {
            logging::init_console();
            let (overrides, target) = match what {
                ShowTarget::Config => (CliOverrides::default(), ShowCmd::Config),
                ShowTarget::Release { release } => (
                    CliOverrides {
                        release: release.mode()?,
                        ..Default::default()
                    },
                    ShowCmd::Release,
                ),
                ShowTarget::Cache => (CliOverrides::default(), ShowCmd::Cache),
            };
            let config = load(&base_dir, overrides)?;
            commands::cmd_show(&config, target, &source(&config)?)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        // No-op when a subscriber is already installed.
        logging::init_console();
        error!("{:#}", e);
        let code = match e.downcast_ref::<BuildError>() {
            Some(BuildError::Interrupted) => 130,
            _ => 1,
        };
        std::process::exit(code);
    }
}
