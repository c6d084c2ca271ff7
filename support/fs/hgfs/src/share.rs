// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared-folder registry.
//!
//! Shares are configured at startup and frozen for the lifetime of the
//! server, so the registry needs no locking. Each share owns an open
//! [`HostVolume`] rooted at its directory; all host operations on the share
//! go through that volume with share-relative paths.

use hostfs::HostVolume;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one shared folder.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    name: String,
    root: PathBuf,
    read_access: bool,
    write_access: bool,
    case_insensitive: bool,
    follow_symlinks: bool,
}

impl ShareConfig {
    /// Creates a new share configuration with read-only access, case
    /// sensitive names, and symlink following disabled.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            root: root.as_ref().to_path_buf(),
            read_access: true,
            write_access: false,
            case_insensitive: false,
            follow_symlinks: false,
        }
    }

    /// Allow or deny read access for guests.
    pub fn read_access(mut self, allowed: bool) -> Self {
        self.read_access = allowed;
        self
    }

    /// Allow or deny write access for guests.
    pub fn write_access(mut self, allowed: bool) -> Self {
        self.write_access = allowed;
        self
    }

    /// Treat guest-supplied names as case insensitive, converting them to
    /// the canonical host casing during name resolution.
    pub fn case_insensitive(mut self, insensitive: bool) -> Self {
        self.case_insensitive = insensitive;
        self
    }

    /// Allow symbolic links inside the share to be followed. Links are
    /// still required to resolve below the share root.
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }
}

/// An immutable snapshot of one share's properties.
///
/// A reference to the `ShareInfo` is stored in every file node and search
/// created under the share, so operations on existing handles never have to
/// query the registry again.
#[derive(Debug)]
pub struct ShareInfo {
    pub name: String,
    pub root: PathBuf,
    /// The fully resolved root, used as the boundary for the symlink-escape
    /// check.
    pub canonical_root: PathBuf,
    pub volume: HostVolume,
    pub read_access: bool,
    pub write_access: bool,
    pub case_insensitive: bool,
    pub follow_symlinks: bool,
}

/// The read-only table of shares, populated at startup.
pub struct ShareRegistry {
    shares: Vec<Arc<ShareInfo>>,
}

impl ShareRegistry {
    /// Builds the registry, opening a volume for each configured share.
    ///
    /// Fails if any share root cannot be opened or resolved.
    pub fn new(configs: impl IntoIterator<Item = ShareConfig>) -> hostfs::Result<Self> {
        let mut shares = Vec::new();
        for config in configs {
            let volume = HostVolume::new(&config.root)?;
            let canonical_root = std::fs::canonicalize(&config.root)?;
            shares.push(Arc::new(ShareInfo {
                name: config.name,
                root: config.root,
                canonical_root,
                volume,
                read_access: config.read_access,
                write_access: config.write_access,
                case_insensitive: config.case_insensitive,
                follow_symlinks: config.follow_symlinks,
            }));
        }

        Ok(Self { shares })
    }

    /// Finds a share by name.
    pub fn get(&self, name: &str) -> Option<Arc<ShareInfo>> {
        self.shares
            .iter()
            .find(|s| s.name == name)
            .map(Arc::clone)
    }

    /// Enumerates all shares, in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ShareInfo>> {
        self.shares.iter()
    }

    /// Checks the requested access against the share's permission flags.
    pub fn check_access(share: &ShareInfo, want_read: bool, want_write: bool) -> bool {
        (!want_read || share.read_access) && (!want_write || share.write_access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lookup_and_access() {
        let dir = TempDir::new().unwrap();
        let registry = ShareRegistry::new([
            ShareConfig::new("docs", dir.path()),
            ShareConfig::new("scratch", dir.path()).write_access(true),
        ])
        .unwrap();

        assert!(registry.get("docs").is_some());
        assert!(registry.get("DOCS").is_none());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.iter().count(), 2);

        let docs = registry.get("docs").unwrap();
        assert!(ShareRegistry::check_access(&docs, true, false));
        assert!(!ShareRegistry::check_access(&docs, false, true));

        let scratch = registry.get("scratch").unwrap();
        assert!(ShareRegistry::check_access(&scratch, true, true));
    }

    #[test]
    fn bad_root_fails() {
        assert!(ShareRegistry::new([ShareConfig::new("x", "/does/not/exist")]).is_err());
    }
}
