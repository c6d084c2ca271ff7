// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// UNSAFETY: Calling libc file APIs.
#![allow(unsafe_code)]
#![allow(clippy::undocumented_unsafe_blocks)]

mod util;

use crate::CreateOptions;
use crate::DirEntry;
use crate::Result;
use crate::SetAttributes;
use crate::Stat;
use crate::StatFs;
use std::mem;
use std::os::unix::prelude::*;
use std::path::Path;

// Unix implementation of HostVolume.
// See crate::HostVolume for more detailed comments.
#[derive(Debug)]
pub struct Volume {
    root: std::fs::File,
}

impl Volume {
    pub fn new(root_path: &Path) -> Result<Self> {
        let path = util::path_to_cstr(root_path)?;

        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            // Open a file descriptor to the root to use with "*at" functions.
            let fd = util::check_errno(libc::open(
                path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY,
            ))?;

            Ok(Self {
                root: std::fs::File::from_raw_fd(fd),
            })
        }
    }

    pub fn lstat(&self, path: &Path) -> Result<Stat> {
        assert!(path.is_relative());
        let path = util::path_to_cstr(path)?;

        // SAFETY: Calling C API as documented, with no special requirements.
        let stat = unsafe {
            let mut stat = mem::zeroed();
            util::check_errno(libc::fstatat(
                self.root.as_raw_fd(),
                path.as_ptr(),
                &mut stat,
                libc::AT_SYMLINK_NOFOLLOW | libc::AT_EMPTY_PATH,
            ))?;
            stat
        };

        Ok(util::libc_stat_to_stat(stat))
    }

    pub fn open(
        &self,
        path: &Path,
        flags: i32,
        options: Option<CreateOptions>,
    ) -> Result<File> {
        assert!(path.is_relative());

        let fd = util::openat(&self.root, path, flags, options)?;
        Ok(File { fd })
    }

    pub fn mkdir(&self, path: &Path, options: CreateOptions) -> Result<()> {
        assert!(path.is_relative());

        let path = util::path_to_cstr(path)?;

        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            util::check_errno(libc::mkdirat(
                self.root.as_raw_fd(),
                path.as_ptr(),
                options.mode(),
            ))?;
        }

        Ok(())
    }

    pub fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        assert!(path.is_relative());

        let path = util::path_to_cstr(path)?;
        let target = util::create_cstr(target.as_os_str().as_bytes())?;

        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            util::check_errno(libc::symlinkat(
                target.as_ptr(),
                self.root.as_raw_fd(),
                path.as_ptr(),
            ))?;
        }

        Ok(())
    }

    pub fn read_link(&self, path: &Path) -> Result<std::ffi::OsString> {
        assert!(path.is_relative());

        let mut buffer = [0u8; libc::PATH_MAX as usize];
        let path = util::path_to_cstr(path)?;

        // SAFETY: Calling C API as documented, with no special requirements.
        let size = unsafe {
            util::check_errno(libc::readlinkat(
                self.root.as_raw_fd(),
                path.as_ptr(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
            ))?
        };

        // Size is guaranteed non-negative after check_errno.
        Ok(std::ffi::OsString::from_vec(Vec::from(
            &buffer[..size as usize],
        )))
    }

    pub fn unlink(&self, path: &Path, flags: i32) -> Result<()> {
        assert!(path.is_relative());

        let path = util::path_to_cstr(path)?;

        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            util::check_errno(libc::unlinkat(self.root.as_raw_fd(), path.as_ptr(), flags))?;
        }

        Ok(())
    }

    pub fn rename(&self, path: &Path, new_volume: &Volume, new_path: &Path) -> Result<()> {
        assert!(path.is_relative());
        assert!(new_path.is_relative());

        let path = util::path_to_cstr(path)?;
        let new_path = util::path_to_cstr(new_path)?;

        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            util::check_errno(libc::renameat(
                self.root.as_raw_fd(),
                path.as_ptr(),
                new_volume.root.as_raw_fd(),
                new_path.as_ptr(),
            ))?;
        }

        Ok(())
    }

    pub fn set_attr(&self, path: &Path, attr: &SetAttributes) -> Result<()> {
        assert!(path.is_relative());
        util::set_attr(&self.root, Some(path), attr)
    }

    pub fn stat_fs(&self, path: &Path) -> Result<StatFs> {
        assert!(path.is_relative());

        // Open the path so fstatfs can be used; this works for both files
        // and directories.
        let file = util::openat(&self.root, path, libc::O_RDONLY, None)?;
        fstatfs(&file)
    }

    pub fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        assert!(path.is_relative());

        let file = util::openat(&self.root, path, libc::O_RDONLY | libc::O_DIRECTORY, None)?;
        let enumerator = util::DirectoryEnumerator::new(file)?;
        enumerator.collect()
    }
}

// Unix implementation of HostFile.
#[derive(Debug)]
pub struct File {
    fd: std::fs::File,
}

impl File {
    pub fn fstat(&self) -> Result<Stat> {
        // SAFETY: Calling C API as documented, with no special requirements.
        let stat = unsafe {
            let mut stat = mem::zeroed();
            util::check_errno(libc::fstat(self.fd.as_raw_fd(), &mut stat))?;
            stat
        };

        Ok(util::libc_stat_to_stat(stat))
    }

    pub fn pread(&self, buffer: &mut [u8], offset: i64) -> Result<usize> {
        // SAFETY: Calling C API as documented; the buffer pointer and length
        // refer to a valid, exclusively borrowed slice.
        let size = unsafe {
            util::check_errno(libc::pread(
                self.fd.as_raw_fd(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                offset,
            ))?
        };

        Ok(size as usize)
    }

    pub fn pwrite(&self, buffer: &[u8], offset: i64) -> Result<usize> {
        // SAFETY: Calling C API as documented; the buffer pointer and length
        // refer to a valid borrowed slice.
        let size = unsafe {
            util::check_errno(libc::pwrite(
                self.fd.as_raw_fd(),
                buffer.as_ptr().cast(),
                buffer.len(),
                offset,
            ))?
        };

        Ok(size as usize)
    }

    pub fn set_attr(&self, attr: &SetAttributes) -> Result<()> {
        util::set_attr(&self.fd, None, attr)
    }

    pub fn stat_fs(&self) -> Result<StatFs> {
        fstatfs(&self.fd)
    }

    pub fn fsync(&self, data_only: bool) -> Result<()> {
        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            if data_only {
                util::check_errno(libc::fdatasync(self.fd.as_raw_fd()))?;
            } else {
                util::check_errno(libc::fsync(self.fd.as_raw_fd()))?;
            }
        }

        Ok(())
    }
}

fn fstatfs(fd: &std::fs::File) -> Result<StatFs> {
    // SAFETY: Calling C API as documented, with no special requirements.
    let stat_fs = unsafe {
        let mut stat_fs = mem::zeroed();
        util::check_errno(libc::fstatfs(fd.as_raw_fd(), &mut stat_fs))?;
        stat_fs
    };

    Ok(util::libc_stat_fs_to_stat_fs(stat_fs))
}
