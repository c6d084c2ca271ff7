// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The name-resolution pipeline.
//!
//! A CP-encoded guest name consists of a share name followed by a relative
//! path. Resolution looks the share up in the registry, verifies the
//! requested access, decodes and validates each component, optionally
//! canonicalizes component casing for case-insensitive shares, and enforces
//! that the resolved path stays below the share root even in the presence
//! of symbolic links. The escape check is security-critical: a name that
//! resolves outside the share is rejected with `NameEscape` regardless of
//! whether the target exists.

use crate::cpname;
use crate::share::ShareInfo;
use crate::share::ShareRegistry;
use crate::OpError;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

// Limits mirroring the host's PATH_MAX/NAME_MAX.
const MAX_PATH_LEN: usize = 4096;
const MAX_COMPONENT_LEN: usize = 255;

/// A successfully resolved guest name.
#[derive(Debug)]
pub struct ResolvedName {
    /// The share the name lives under.
    pub share: Arc<ShareInfo>,
    /// The path below the share root. Empty for the share root itself.
    pub path: PathBuf,
}

/// Resolves a CP-encoded guest name against the share registry.
pub fn resolve(
    registry: &ShareRegistry,
    cp_name: &[u8],
    want_read: bool,
    want_write: bool,
    case_insensitive: bool,
) -> crate::Result<ResolvedName> {
    let mut components = cpname::components(cp_name);

    // The first component is the share name. The bare virtual root is not a
    // valid target for data operations.
    let share_name = components.next().ok_or(OpError::ShareAccessDenied)?;
    let share_name = decode_component(share_name)?;
    let share = registry.get(&share_name).ok_or(OpError::ShareNotFound)?;
    if !ShareRegistry::check_access(&share, want_read, want_write) {
        return Err(OpError::ShareAccessDenied);
    }

    let case_insensitive = case_insensitive || share.case_insensitive;
    let mut path = PathBuf::new();
    let mut length = share.root.as_os_str().len();
    for component in components {
        let component = decode_component(component)?;
        if component.len() > MAX_COMPONENT_LEN {
            return Err(OpError::NameTooLong);
        }

        length += component.len() + 1;
        if length > MAX_PATH_LEN {
            return Err(OpError::NameTooLong);
        }

        if case_insensitive {
            path.push(convert_case(&share, &path, &component));
        } else {
            path.push(component);
        }
    }

    verify_no_escape(&share, &path)?;
    Ok(ResolvedName { share, path })
}

// Unescapes a single CP component and validates it.
fn decode_component(component: &[u8]) -> crate::Result<String> {
    let mut bytes = component.to_vec();
    let len = cpname::unescape_in_place(&mut bytes, cpname::ESCAPE_BYTE);
    bytes.truncate(len);
    if !cpname::valid_component(&bytes) {
        return Err(OpError::InvalidName);
    }

    String::from_utf8(bytes).map_err(|_| OpError::InvalidName)
}

// Substitutes the canonical casing of a component by scanning the real
// directory contents. A component with no case-insensitive match is kept
// as-is; it either does not exist or is about to be created.
fn convert_case(share: &ShareInfo, parent: &Path, component: &str) -> String {
    if share.volume.lstat(parent.join(component)).is_ok() {
        return component.to_string();
    }

    let entries = match share.volume.read_dir(parent) {
        Ok(entries) => entries,
        Err(_) => return component.to_string(),
    };

    let folded = component.to_lowercase();
    for entry in entries {
        if let Some(name) = entry.name.to_str() {
            if name.to_lowercase() == folded {
                return name.to_string();
            }
        }
    }

    component.to_string()
}

// Walks the path component by component and verifies that no symlink takes
// the resolution outside the share root.
fn verify_no_escape(share: &ShareInfo, path: &Path) -> crate::Result<()> {
    let mut prefix = PathBuf::new();
    for component in path.components() {
        prefix.push(component);
        let stat = match share.volume.lstat(&prefix) {
            Ok(stat) => stat,
            // Nothing below a missing component can be a symlink.
            Err(e) if e.value() == hostfs::ENOENT => break,
            Err(e) => return Err(e.into()),
        };

        if !hostfs::s_islnk(stat.mode) {
            continue;
        }

        if !share.follow_symlinks {
            return Err(OpError::NameEscape);
        }

        match std::fs::canonicalize(share.root.join(&prefix)) {
            Ok(canonical) => {
                if !canonical.starts_with(&share.canonical_root) {
                    return Err(OpError::NameEscape);
                }
            }
            Err(e) if e.raw_os_error() == Some(hostfs::ENOENT) => {
                // Dangling link; reject targets that could leave the share
                // once created.
                let target = share.volume.read_link(&prefix)?;
                let target = Path::new(&target);
                if target.is_absolute()
                    || target.components().any(|c| c == Component::ParentDir)
                {
                    return Err(OpError::NameEscape);
                }
            }
            Err(e) => return Err(OpError::Host(e.into())),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::ShareConfig;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct TestEnv {
        root: TempDir,
        registry: ShareRegistry,
    }

    impl TestEnv {
        fn new(config: impl FnOnce(ShareConfig) -> ShareConfig) -> Self {
            let root = TempDir::new().unwrap();
            let share_root = root.path().join("share");
            fs::create_dir(&share_root).unwrap();
            let registry =
                ShareRegistry::new([config(ShareConfig::new("docs", &share_root))]).unwrap();
            Self { root, registry }
        }

        fn share_path(&self, name: &str) -> PathBuf {
            self.root.path().join("share").join(name)
        }
    }

    #[test]
    fn share_lookup() {
        let env = TestEnv::new(|c| c);
        let resolved = resolve(&env.registry, b"docs", true, false, false).unwrap();
        assert_eq!(resolved.share.name, "docs");
        assert_eq!(resolved.path, PathBuf::new());

        assert!(matches!(
            resolve(&env.registry, b"missing\0file", true, false, false).unwrap_err(),
            OpError::ShareNotFound
        ));
        assert!(matches!(
            resolve(&env.registry, b"", true, false, false).unwrap_err(),
            OpError::ShareAccessDenied
        ));
    }

    #[test]
    fn write_access_denied() {
        let env = TestEnv::new(|c| c.write_access(false));
        assert!(matches!(
            resolve(&env.registry, b"docs\0file", false, true, false).unwrap_err(),
            OpError::ShareAccessDenied
        ));
    }

    #[test]
    fn invalid_components() {
        let env = TestEnv::new(|c| c);
        for name in [
            b"docs\0..\0etc" as &[u8],
            b"docs\0.",
            b"docs\0",
            b"docs\0a/b",
        ] {
            assert!(
                matches!(
                    resolve(&env.registry, name, true, false, false).unwrap_err(),
                    OpError::InvalidName
                ),
                "name {:?}",
                name
            );
        }
    }

    #[test]
    fn case_conversion() {
        let env = TestEnv::new(|c| c.case_insensitive(true));
        fs::create_dir(env.share_path("SubDir")).unwrap();
        fs::write(env.share_path("SubDir/File.TXT"), "x").unwrap();

        let resolved =
            resolve(&env.registry, b"docs\0subdir\0file.txt", true, false, false).unwrap();
        assert_eq!(resolved.path, PathBuf::from("SubDir/File.TXT"));

        // A nonexistent leaf keeps the caller's casing.
        let resolved = resolve(&env.registry, b"docs\0subdir\0New.txt", true, false, false).unwrap();
        assert_eq!(resolved.path, PathBuf::from("SubDir/New.txt"));
    }

    #[test]
    fn symlink_rejected_when_not_followed() {
        let env = TestEnv::new(|c| c);
        fs::write(env.share_path("real"), "x").unwrap();
        symlink("real", env.share_path("link")).unwrap();

        assert!(matches!(
            resolve(&env.registry, b"docs\0link", true, false, false).unwrap_err(),
            OpError::NameEscape
        ));
    }

    #[test]
    fn symlink_escape_rejected() {
        let env = TestEnv::new(|c| c.follow_symlinks(true));
        // A link pointing outside the share root.
        symlink(env.root.path(), env.share_path("out")).unwrap();

        assert!(matches!(
            resolve(&env.registry, b"docs\0out\0secret", true, false, false).unwrap_err(),
            OpError::NameEscape
        ));
        assert!(matches!(
            resolve(&env.registry, b"docs\0out", true, false, false).unwrap_err(),
            OpError::NameEscape
        ));
    }

    #[test]
    fn inside_symlink_followed() {
        let env = TestEnv::new(|c| c.follow_symlinks(true));
        fs::create_dir(env.share_path("dir")).unwrap();
        fs::write(env.share_path("dir/file"), "x").unwrap();
        symlink("dir", env.share_path("alias")).unwrap();

        let resolved = resolve(&env.registry, b"docs\0alias\0file", true, false, false).unwrap();
        assert_eq!(resolved.path, PathBuf::from("alias/file"));
    }

    #[test]
    fn dangling_absolute_symlink_rejected() {
        let env = TestEnv::new(|c| c.follow_symlinks(true));
        symlink("/nonexistent/elsewhere", env.share_path("dangling")).unwrap();

        assert!(matches!(
            resolve(&env.registry, b"docs\0dangling", true, false, false).unwrap_err(),
            OpError::NameEscape
        ));
    }

    #[test]
    fn name_too_long() {
        let env = TestEnv::new(|c| c);
        let long = vec![b'a'; 300];
        let mut name = b"docs\0".to_vec();
        name.extend_from_slice(&long);
        assert!(matches!(
            resolve(&env.registry, &name, true, false, false).unwrap_err(),
            OpError::NameTooLong
        ));
    }
}
