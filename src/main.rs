/*!
 * irodsfs binary: option handling, mount-point validation, connectivity
 * probe, mount.
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use log::info;

use irodsfs::client::registry::global_registry;
use irodsfs::client::Account;
use irodsfs::config::{env_num, env_str};
use irodsfs::{fuse, logging, FsConfig, Vfs};

#[derive(Parser)]
#[command(
    name = "irodsfs",
    version,
    about = "Mount an iRODS data grid as a POSIX directory tree"
)]
struct Cli {
    /// Mount point directory
    mountpoint: PathBuf,

    /// Server host name
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Zone name
    #[arg(short = 'z', long)]
    zone: Option<String>,

    /// User name
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Password
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Ticket for ticket-based access
    #[arg(short = 't', long)]
    ticket: Option<String>,

    /// Default resource
    #[arg(long)]
    defresource: Option<String>,

    /// Collection mounted as the filesystem root (defaults to the home
    /// collection)
    #[arg(short = 'w', long)]
    workdir: Option<String>,

    /// Disable all caching features (buffered I/O, prefetch, metadata)
    #[arg(long)]
    nocache: bool,

    /// Disable the read-ahead prefetcher
    #[arg(long)]
    nopreload: bool,

    /// Disable metadata caching
    #[arg(long)]
    nocachemetadata: bool,

    /// Reuse connections for short operations (may serve inconsistent
    /// metadata while another client mutates the namespace)
    #[arg(long)]
    connreuse: bool,

    /// Maximum number of concurrent connections
    #[arg(long)]
    maxconn: Option<usize>,

    /// Transfer block size in bytes
    #[arg(long)]
    blocksize: Option<usize>,

    /// Idle seconds after which a connection is closed
    #[arg(long)]
    conntimeout: Option<u64>,

    /// Idle seconds after which a keepalive is sent
    #[arg(long)]
    connkeepalive: Option<u64>,

    /// Seconds between connection timeout checks
    #[arg(long)]
    conncheckinterval: Option<u64>,

    /// Seconds before a server API call is abandoned
    #[arg(long)]
    apitimeout: Option<u64>,

    /// Number of blocks fetched ahead of the reader
    #[arg(long)]
    preloadblocks: Option<usize>,

    /// Number of prefetch worker threads per open file
    #[arg(long)]
    preloadthreads: Option<usize>,

    /// Seconds before cached metadata is invalidated
    #[arg(long)]
    metadatacachetimeout: Option<u64>,

    /// Allow mounting over a non-empty directory
    #[arg(long)]
    nonempty: bool,

    /// Verbose logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("irodsfs: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = FsConfig::from_env();
    apply_cli_options(&mut cfg, &cli);
    cfg.normalize();

    let account = build_account(&cli)?;
    let mountpoint = check_mount_point(&cli.mountpoint, cli.nonempty)?;

    let client = global_registry()
        .create(&account)
        .context("cannot select a driver for the configured host")?;

    let vfs = Arc::new(Vfs::new(client, account, cfg));
    vfs.conn_test()
        .context("cannot connect to the configured server")?;

    info!(
        "mounting {} at {}",
        vfs.account().workdir,
        mountpoint.display()
    );
    fuse::mount(vfs, &mountpoint).context("mount failed")?;
    Ok(())
}

fn apply_cli_options(cfg: &mut FsConfig, cli: &Cli) {
    if cli.nocache {
        cfg.buffered_fs = false;
        cfg.preload = false;
        cfg.cache_metadata = false;
    }
    if cli.nopreload {
        cfg.preload = false;
    }
    if cli.nocachemetadata {
        cfg.cache_metadata = false;
    }
    if cli.connreuse {
        cfg.conn_reuse = true;
    }
    if let Some(v) = cli.maxconn {
        cfg.max_conn = v;
    }
    if let Some(v) = cli.blocksize {
        cfg.block_size = v;
    }
    if let Some(v) = cli.conntimeout {
        cfg.conn_timeout_sec = v;
    }
    if let Some(v) = cli.connkeepalive {
        cfg.conn_keepalive_sec = v;
    }
    if let Some(v) = cli.conncheckinterval {
        cfg.conn_check_interval_sec = v;
    }
    if let Some(v) = cli.apitimeout {
        cfg.rpc_timeout_sec = v;
    }
    if let Some(v) = cli.preloadblocks {
        cfg.preload_num_blocks = v;
    }
    if let Some(v) = cli.preloadthreads {
        cfg.preload_num_threads = v;
    }
    if let Some(v) = cli.metadatacachetimeout {
        cfg.metadata_cache_timeout_sec = v;
    }
}

/// Flags override environment; environment overrides nothing being set.
fn build_account(cli: &Cli) -> anyhow::Result<Account> {
    let host = cli
        .host
        .clone()
        .or_else(|| env_str("IRODSFS_HOST"))
        .context("host name is not given")?;
    let zone = cli
        .zone
        .clone()
        .or_else(|| env_str("IRODSFS_ZONE"))
        .context("zone is not given")?;
    let user = cli
        .user
        .clone()
        .or_else(|| env_str("IRODSFS_USER"))
        .context("user is not given")?;

    let mut account = Account::new(host, zone, user);
    if let Some(port) = cli.port.or_else(|| env_num("IRODSFS_PORT").map(|v| v as u16)) {
        account.port = port;
    }
    account.password = cli.password.clone().or_else(|| env_str("IRODSFS_PASSWORD"));
    account.ticket = cli.ticket.clone().or_else(|| env_str("IRODSFS_TICKET"));
    account.default_resource = cli.defresource.clone();
    if let Some(workdir) = cli.workdir.clone().or_else(|| env_str("IRODSFS_WORKDIR")) {
        account.workdir = workdir;
    }
    Ok(account)
}

/// The mount point must resolve to an existing directory, empty unless
/// `--nonempty` says otherwise.
fn check_mount_point(path: &Path, nonempty: bool) -> anyhow::Result<PathBuf> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("cannot find the directory {}", path.display()))?;

    if !resolved.is_dir() {
        bail!("{} is not a directory", resolved.display());
    }

    if !nonempty {
        let occupied = fs::read_dir(&resolved)
            .with_context(|| format!("the directory {} is not accessible", resolved.display()))?
            .next()
            .is_some();
        if occupied {
            bail!(
                "the directory {} is not empty; pass --nonempty if this is safe",
                resolved.display()
            );
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mount_point_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(check_mount_point(&missing, false).is_err());
    }

    #[test]
    fn test_empty_mount_point_accepted() {
        let dir = tempdir().unwrap();
        let resolved = check_mount_point(dir.path(), false).unwrap();
        assert!(resolved.is_dir());
    }

    #[test]
    fn test_occupied_mount_point_needs_nonempty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("leftover"), b"x").unwrap();

        assert!(check_mount_point(dir.path(), false).is_err());
        assert!(check_mount_point(dir.path(), true).is_ok());
    }

    #[test]
    fn test_account_requires_host_zone_user() {
        let cli = Cli::parse_from(["irodsfs", "/tmp/mnt"]);
        // no host/zone/user flags and (presumably) no environment
        std::env::remove_var("IRODSFS_HOST");
        std::env::remove_var("IRODSFS_ZONE");
        std::env::remove_var("IRODSFS_USER");
        assert!(build_account(&cli).is_err());
    }

    #[test]
    fn test_account_from_flags() {
        let cli = Cli::parse_from([
            "irodsfs", "/tmp/mnt", "-H", "memory", "-z", "tempZone", "-u", "rods", "-w",
            "/tempZone/projects",
        ]);
        let account = build_account(&cli).unwrap();
        assert_eq!(account.host, "memory");
        assert_eq!(account.workdir, "/tempZone/projects");
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from(["irodsfs", "/tmp/mnt", "--nopreload", "--maxconn", "3"]);
        let mut cfg = FsConfig::default();
        apply_cli_options(&mut cfg, &cli);
        cfg.normalize();
        assert!(!cfg.preload);
        assert_eq!(cfg.max_conn, 3);
    }
}
