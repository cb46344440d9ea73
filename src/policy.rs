//! Per-path caching policy.
//!
//! Paths carry an explicit allow/deny verdict or inherit one from the
//! longest matching ancestor; the root of the tree defaults to allow. The
//! explicit entries persist in a cachespec file as `path:+` / `path:-`
//! lines so operator decisions survive restarts.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::{map_io_error, FsError, FsResult};

/// One path's policy setting. `Inherit` erases an explicit entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PolicyRule {
    Allow,
    Deny,
    Inherit,
}

impl PolicyRule {
    /// External one-character encoding used by the control xattr and the
    /// cachespec file.
    pub fn parse(value: &str) -> FsResult<PolicyRule> {
        match value.trim() {
            "+" => Ok(PolicyRule::Allow),
            "-" => Ok(PolicyRule::Deny),
            "=" => Ok(PolicyRule::Inherit),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

pub struct CachePolicy {
    spec_path: PathBuf,
    rules: Mutex<BTreeMap<PathBuf, bool>>,
}

impl CachePolicy {
    /// Load explicit entries from the cachespec file. Missing file means
    /// no explicit entries; unparsable lines are logged and skipped.
    pub fn load(spec_path: PathBuf) -> CachePolicy {
        let mut rules = BTreeMap::new();
        if let Ok(contents) = fs::read_to_string(&spec_path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match line.rsplit_once(':') {
                    Some((path, "+")) => {
                        rules.insert(PathBuf::from(path), true);
                    }
                    Some((path, "-")) => {
                        rules.insert(PathBuf::from(path), false);
                    }
                    _ => warn!("skipping malformed cachespec line: {line:?}"),
                }
            }
        }
        CachePolicy { spec_path, rules: Mutex::new(rules) }
    }

    /// Whether `path` should be mirrored into the cache.
    pub fn should_cache(&self, path: &Path) -> bool {
        let rules = self.rules.lock().unwrap();
        let mut probe = Some(path);
        while let Some(current) = probe {
            if let Some(allow) = rules.get(current) {
                return *allow;
            }
            probe = current.parent();
        }
        true
    }

    /// Install or clear an explicit entry and rewrite the cachespec file.
    pub fn set(&self, path: &Path, rule: PolicyRule) -> FsResult<()> {
        let mut rules = self.rules.lock().unwrap();
        match rule {
            PolicyRule::Allow => {
                rules.insert(path.to_path_buf(), true);
            }
            PolicyRule::Deny => {
                rules.insert(path.to_path_buf(), false);
            }
            PolicyRule::Inherit => {
                rules.remove(path);
            }
        }
        self.persist(&rules)
    }

    fn persist(&self, rules: &BTreeMap<PathBuf, bool>) -> FsResult<()> {
        let mut out = String::new();
        for (path, allow) in rules.iter() {
            let _ = writeln!(out, "{}:{}", path.display(), if *allow { '+' } else { '-' });
        }
        let tmp = self.spec_path.with_extension("tmp");
        fs::write(&tmp, out).map_err(map_io_error)?;
        fs::rename(&tmp, &self.spec_path).map_err(map_io_error)
    }

    /// Render the policy of `path` the way the control xattr reports it:
    /// `+` or `-` for an explicit entry, `= (+)` / `= (-)` when inherited.
    pub fn describe(&self, path: &Path) -> String {
        let explicit = self.rules.lock().unwrap().get(path).copied();
        match explicit {
            Some(true) => "+".to_owned(),
            Some(false) => "-".to_owned(),
            None => {
                if self.should_cache(path) {
                    "= (+)".to_owned()
                } else {
                    "= (-)".to_owned()
                }
            }
        }
    }
}
