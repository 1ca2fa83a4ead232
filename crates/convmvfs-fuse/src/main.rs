//! The `convmvfs` mount binary.

use anyhow::Context;
use clap::Parser;
use convmvfs_fuse::ConvMvFs;
use convmvfs_core::MountConfig;
use fuser::MountOption;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Mount a local directory under a different filename charset.
///
/// Filenames in SRCDIR are assumed to be stored in the input charset and
/// are presented at MOUNTPOINT in the output charset. File contents pass
/// through untouched.
#[derive(Parser)]
#[command(name = "convmvfs")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Present a GBK-named fileserver tree as UTF-8
    convmvfs /mnt/view --srcdir /srv/legacy --icharset GBK --ocharset UTF-8

    # Serve every user's view (run as root, allow other users in)
    sudo convmvfs /mnt/view --srcdir /srv/legacy --icharset GBK --allow-other
")]
struct Cli {
    /// Where to mount the transcoded view
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Source directory to mirror
    #[arg(long, default_value = "/", value_name = "DIR")]
    srcdir: PathBuf,

    /// Charset of filenames as stored in the source directory
    #[arg(long, default_value = "UTF-8", value_name = "CHARSET")]
    icharset: String,

    /// Charset presented to processes using the mount
    #[arg(long, default_value = "UTF-8", value_name = "CHARSET")]
    ocharset: String,

    /// Allow other users to access the mount (needs user_allow_other in
    /// /etc/fuse.conf unless run as root)
    #[arg(long)]
    allow_other: bool,

    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let srcdir = cli
        .srcdir
        .canonicalize()
        .with_context(|| format!("source directory {} is not accessible", cli.srcdir.display()))?;
    anyhow::ensure!(
        srcdir.is_dir(),
        "source directory {} is not a directory",
        srcdir.display()
    );

    let config = MountConfig::new(&srcdir, &cli.icharset, &cli.ocharset)
        .context("invalid mount configuration")?;

    let mut options = vec![
        MountOption::FSName("convmvfs".to_string()),
        MountOption::Subtype("convmvfs".to_string()),
    ];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }
    if cli.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    // No DefaultPermissions: the filesystem replays the access decision
    // for each caller itself, so the kernel must not pre-filter requests
    // against the driver's identity.

    tracing::info!(
        srcdir = %srcdir.display(),
        mountpoint = %cli.mountpoint.display(),
        icharset = %cli.icharset,
        ocharset = %cli.ocharset,
        "mounting"
    );

    let fs = ConvMvFs::new(config);
    fuser::mount2(fs, &cli.mountpoint, &options)
        .with_context(|| format!("mount at {} failed", cli.mountpoint.display()))?;
    Ok(())
}
