//! marfs - Immutable archives with a writable overlay mount
//!
//! Usage:
//!   marfs create -i <src> -o <archive>      - Pack a directory into an archive
//!   marfs mount <archive> <mount_point>     - Mount an archive
//!   marfs unmount <mount_point>             - Unmount
//!   marfs list <archive>                    - List file hashes and sizes
//!   marfs verify <archive>                  - Check every file's content hash

use clap::{Parser, Subcommand};
use marfs::{
    archive::{ArchiveBuilder, ArchiveStore},
    config::Config,
    fs::{MarFs, OverlayEngine, OverlayStore},
    path::VPath,
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "marfs")]
#[command(author = "marfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Immutable archive format with a FUSE mounter and writable overlay")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory tree into an archive
    Create {
        /// Source directory
        #[arg(short, long)]
        input: PathBuf,

        /// Output archive path
        #[arg(short, long)]
        output: PathBuf,

        /// Number of encoding workers
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Store identical file bodies once
        #[arg(long)]
        dedup: bool,
    },

    /// Mount an archive
    Mount {
        /// Archive file
        archive: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Writable overlay directory (read-only mount when omitted)
        #[arg(long)]
        overlay: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Refuse writes below this path (repeatable)
        #[arg(long = "readonly-prefix")]
        readonly_prefixes: Vec<String>,

        /// Mount only archive paths matching this glob (repeatable)
        #[arg(long = "only-glob")]
        only_globs: Vec<String>,

        /// Strip this directory from the front of archive paths
        #[arg(long)]
        strip_prefix: Option<String>,

        /// Mount archive paths below this directory
        #[arg(long)]
        add_prefix: Option<String>,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// List file entries with their content hash and size
    List {
        /// Archive file
        archive: PathBuf,
    },

    /// Decode every file and check its content hash
    Verify {
        /// Archive file
        archive: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Create {
            input,
            output,
            jobs,
            dedup,
        } => cmd_create(config_path, &input, &output, jobs, dedup),

        Commands::Mount {
            archive,
            mount_point,
            overlay,
            allow_other,
            readonly_prefixes,
            only_globs,
            strip_prefix,
            add_prefix,
        } => {
            let options = MountArgs {
                allow_other,
                readonly_prefixes,
                only_globs,
                strip_prefix,
                add_prefix,
            };
            cmd_mount(config_path, &archive, &mount_point, overlay.as_deref(), options)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::List { archive } => cmd_list(config_path, &archive),

        Commands::Verify { archive } => cmd_verify(config_path, &archive),
    }
}

fn cmd_create(
    config_path: &Path,
    input: &Path,
    output: &Path,
    jobs: Option<usize>,
    dedup: bool,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(jobs) = jobs {
        config.build.jobs = jobs;
    }
    config.build.dedup |= dedup;
    config.validate()?;

    info!(
        "Packing {:?} into {:?} with {} workers",
        input, output, config.build.jobs
    );

    let summary = ArchiveBuilder::new(config.build.clone()).build(input, output)?;

    info!(
        "Archived {} files and {} directories: {} bytes stored for {} bytes ({} deduplicated)",
        summary.files,
        summary.directories,
        summary.stored_bytes,
        summary.original_bytes,
        summary.deduplicated
    );
    Ok(())
}

/// Mount flags layered over the config file
struct MountArgs {
    allow_other: bool,
    readonly_prefixes: Vec<String>,
    only_globs: Vec<String>,
    strip_prefix: Option<String>,
    add_prefix: Option<String>,
}

fn cmd_mount(
    config_path: &Path,
    archive_path: &Path,
    mount_point: &Path,
    overlay: Option<&Path>,
    args: MountArgs,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    config.mount.allow_other |= args.allow_other;
    config.mount.readonly_prefixes.extend(args.readonly_prefixes);
    config.mount.only_globs.extend(args.only_globs);
    if args.strip_prefix.is_some() {
        config.mount.strip_prefix = args.strip_prefix;
    }
    if args.add_prefix.is_some() {
        config.mount.add_prefix = args.add_prefix;
    }
    config.validate()?;

    info!("Starting marfs...");

    let rewrite = config.path_rewrite()?;
    let archive = Arc::new(ArchiveStore::open_rewritten(
        archive_path,
        &config.cache,
        &rewrite,
    )?);

    let overlay = match overlay {
        Some(dir) => Some(OverlayStore::open(dir)?),
        None => {
            warn!("No overlay directory given, mounting read-only");
            None
        }
    };

    let engine = OverlayEngine::new(archive, overlay)
        .with_readonly_prefixes(config.readonly_prefixes()?);
    let fs = MarFs::new(engine, &config.mount);

    // Ensure mount point exists
    std::fs::create_dir_all(mount_point)?;

    info!("Mounting {:?} at {:?}", archive_path, mount_point);

    // Build mount options
    let mut options = vec![fuser::MountOption::FSName(config.mount.fs_name.clone())];

    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }

    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    if fs.engine().is_read_only() {
        options.push(fuser::MountOption::RO);
    }

    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_list(config_path: &Path, archive_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let archive = ArchiveStore::open(archive_path, &config.cache)?;

    for entry in archive.entries().iter().filter(|e| e.is_file()) {
        println!("{}\t{}\t{}", entry.content_hash, entry.size, entry.path.as_str());
    }
    Ok(())
}

fn cmd_verify(config_path: &Path, archive_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let archive = ArchiveStore::open(archive_path, &config.cache)?;

    let mut checked = 0usize;
    let mut bad: Vec<&VPath> = Vec::new();
    for entry in archive.entries().iter().filter(|e| e.is_file()) {
        checked += 1;
        match archive.verify(entry) {
            Ok(true) => {}
            Ok(false) => {
                error!("Hash mismatch: {}", entry.path);
                bad.push(&entry.path);
            }
            Err(e) => {
                error!("Failed to decode {}: {}", entry.path, e);
                bad.push(&entry.path);
            }
        }
    }

    if bad.is_empty() {
        info!("Verified {} files", checked);
        Ok(())
    } else {
        Err(Error::Corrupt(format!(
            "{} of {} files failed verification",
            bad.len(),
            checked
        )))
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
