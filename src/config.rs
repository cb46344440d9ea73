//! Command line and config-file handling.
//!
//! The CLI carries the knobs; an optional TOML file can pre-seed them.
//! Precedence is CLI over file over built-in defaults. Derived paths
//! follow the flatten-the-mountpoint convention: `/mnt/data` mounts its
//! upstream under `<nfsbasedir>/mnt-data` and caches under
//! `<cachebasedir>/mnt-data` unless overridden.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::context::Layout;

pub const DEFAULT_NFS_BASE_DIR: &str = "/var/lib/tsumufs/nfs";
pub const DEFAULT_CACHE_BASE_DIR: &str = "/var/cache/tsumufs";
pub const DEFAULT_CACHE_SPEC_DIR: &str = "/var/lib/tsumufs/cachespec";

/// Logical path of the conflict subtree inside the mount.
pub const DEFAULT_CONFLICT_DIR: &str = "/tsumufs-conflicts";

#[derive(Debug, Parser)]
#[command(name = "tsumufs", version, about = "A disconnected-operation caching filesystem")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mount an upstream source with a local write-back cache.
    Mount(MountArgs),
}

#[derive(Debug, Args)]
pub struct MountArgs {
    /// Upstream source (`host:/export` for NFS, or a local directory).
    pub source: String,

    /// Where to present the filesystem.
    pub mountpoint: PathBuf,

    /// Base directory for upstream mount points.
    #[arg(long = "nfsbasedir")]
    pub nfs_base_dir: Option<PathBuf>,

    /// Exact upstream mount point (default: derived from the mountpoint).
    #[arg(long = "nfsmountpoint")]
    pub nfs_mount_point: Option<PathBuf>,

    /// Base directory for cache storage.
    #[arg(long = "cachebasedir")]
    pub cache_base_dir: Option<PathBuf>,

    /// Directory holding cachespec policy files.
    #[arg(long = "cachespecdir")]
    pub cache_spec_dir: Option<PathBuf>,

    /// Exact cache directory (default: derived from the mountpoint).
    #[arg(long = "cachepoint")]
    pub cache_point: Option<PathBuf>,

    /// Mount options passed through to mount(8).
    #[arg(short = 'O', long = "options")]
    pub mount_options: Option<String>,

    /// Stay in the foreground.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Enable debug logging.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Optional TOML config file pre-seeding the options above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Config-file mirror of the CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub nfsbasedir: Option<PathBuf>,
    pub nfsmountpoint: Option<PathBuf>,
    pub cachebasedir: Option<PathBuf>,
    pub cachespecdir: Option<PathBuf>,
    pub cachepoint: Option<PathBuf>,
    pub options: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<FileConfig, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| format!("unable to read {}: {err}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|err| format!("unable to parse {}: {err}", path.display()))
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source: String,
    pub mount_point: PathBuf,
    pub upstream_mount_point: PathBuf,
    pub cache_point: PathBuf,
    pub cachespec_path: PathBuf,
    pub mount_options: Option<String>,
    pub foreground: bool,
    pub debug: bool,
}

fn trim_trailing_slash(value: &str) -> &str {
    if value.len() > 1 {
        value.trim_end_matches('/')
    } else {
        value
    }
}

/// Flatten a mount point into a single path component: `/mnt/data`
/// becomes `mnt-data`.
fn flatten(mount_point: &Path) -> String {
    let flat = mount_point
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('/', "-");
    if flat.is_empty() {
        "root".to_owned()
    } else {
        flat
    }
}

impl Settings {
    /// Merge the CLI with an optional config file and compute the derived
    /// paths.
    pub fn resolve(args: &MountArgs, file: &FileConfig) -> Result<Settings, String> {
        let source = trim_trailing_slash(&args.source).to_owned();
        if source.is_empty() {
            return Err("mount source must not be empty".to_owned());
        }

        let mut mount_point = args.mountpoint.clone();
        if !mount_point.is_absolute() {
            let cwd = std::env::current_dir()
                .map_err(|err| format!("unable to resolve working directory: {err}"))?;
            mount_point = cwd.join(mount_point);
        }
        let flat = flatten(&mount_point);

        let nfs_base = args
            .nfs_base_dir
            .clone()
            .or_else(|| file.nfsbasedir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_NFS_BASE_DIR));
        let cache_base = args
            .cache_base_dir
            .clone()
            .or_else(|| file.cachebasedir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_BASE_DIR));
        let spec_dir = args
            .cache_spec_dir
            .clone()
            .or_else(|| file.cachespecdir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_SPEC_DIR));

        // A plain directory source is its own upstream mount point.
        let default_upstream = if source.contains(':') {
            nfs_base.join(&flat)
        } else {
            PathBuf::from(&source)
        };

        let upstream_mount_point = args
            .nfs_mount_point
            .clone()
            .or_else(|| file.nfsmountpoint.clone())
            .unwrap_or(default_upstream);
        let cache_point = args
            .cache_point
            .clone()
            .or_else(|| file.cachepoint.clone())
            .unwrap_or_else(|| cache_base.join(&flat));
        let mount_options =
            args.mount_options.clone().or_else(|| file.options.clone());

        Ok(Settings {
            source,
            mount_point,
            upstream_mount_point,
            cache_point,
            cachespec_path: spec_dir.join(flat),
            mount_options,
            foreground: args.foreground,
            debug: args.debug,
        })
    }

    /// Whether the source names a remote export rather than a local
    /// directory.
    pub fn source_is_remote(&self) -> bool {
        self.source.contains(':')
    }

    pub fn layout(&self) -> Layout {
        Layout {
            mount_point: self.mount_point.clone(),
            upstream_root: self.upstream_mount_point.clone(),
            cache_point: self.cache_point.clone(),
            cachespec_path: self.cachespec_path.clone(),
            conflict_dir: PathBuf::from(DEFAULT_CONFLICT_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(source: &str, mountpoint: &str) -> MountArgs {
        MountArgs {
            source: source.to_owned(),
            mountpoint: PathBuf::from(mountpoint),
            nfs_base_dir: None,
            nfs_mount_point: None,
            cache_base_dir: None,
            cache_spec_dir: None,
            cache_point: None,
            mount_options: None,
            foreground: false,
            debug: false,
            config: None,
        }
    }

    #[test]
    fn derived_paths_flatten_the_mountpoint() {
        let settings =
            Settings::resolve(&args("fileserver:/export/home", "/mnt/home"), &FileConfig::default())
                .unwrap();
        assert!(settings.source_is_remote());
        assert_eq!(
            settings.upstream_mount_point,
            PathBuf::from("/var/lib/tsumufs/nfs/mnt-home")
        );
        assert_eq!(settings.cache_point, PathBuf::from("/var/cache/tsumufs/mnt-home"));
        assert_eq!(
            settings.cachespec_path,
            PathBuf::from("/var/lib/tsumufs/cachespec/mnt-home")
        );
    }

    #[test]
    fn local_directory_source_is_its_own_upstream() {
        let settings =
            Settings::resolve(&args("/srv/export", "/mnt/data"), &FileConfig::default()).unwrap();
        assert!(!settings.source_is_remote());
        assert_eq!(settings.upstream_mount_point, PathBuf::from("/srv/export"));
    }

    #[test]
    fn explicit_overrides_win() {
        let mut cli = args("host:/export", "/mnt/x");
        cli.nfs_mount_point = Some(PathBuf::from("/custom/nfs"));
        cli.cache_point = Some(PathBuf::from("/custom/cache"));
        let file = FileConfig {
            nfsmountpoint: Some(PathBuf::from("/file/nfs")),
            ..FileConfig::default()
        };
        let settings = Settings::resolve(&cli, &file).unwrap();
        assert_eq!(settings.upstream_mount_point, PathBuf::from("/custom/nfs"));
        assert_eq!(settings.cache_point, PathBuf::from("/custom/cache"));
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let settings =
            Settings::resolve(&args("host:/export/", "/mnt/y"), &FileConfig::default()).unwrap();
        assert_eq!(settings.source, "host:/export");
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(Settings::resolve(&args("", "/mnt/z"), &FileConfig::default()).is_err());
    }
}
