// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::Error;
use crate::Result;
use crate::SetAttributes;
use crate::SetTime;
use crate::Stat;
use crate::StatFs;
use crate::Timespec;
use std::ffi;
use std::os::unix::prelude::*;
use std::path::Path;
use std::ptr;

// Wrapper around a C DIR* used for directory enumeration.
pub struct DirectoryEnumerator {
    dir: ptr::NonNull<libc::DIR>,
}

// SAFETY: The DIR* is exclusively owned and only dereferenced through &mut.
unsafe impl Send for DirectoryEnumerator {}

impl DirectoryEnumerator {
    // Create a new enumerator by taking ownership of a file descriptor.
    pub fn new(fd: impl Into<OwnedFd>) -> Result<Self> {
        // SAFETY: By requiring an OwnedFd we take ownership of the fd and give
        // it away to fdopendir, as per its documented requirements.
        let dir = check_ptr(unsafe { libc::fdopendir(fd.into().into_raw_fd()) })?;
        Ok(Self { dir })
    }
}

impl Iterator for DirectoryEnumerator {
    type Item = Result<crate::DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: Following the contract for readdir (setting errno to 0
        // before calling, validating the return value). We only observe our
        // own errno value within this function.
        let entry = unsafe {
            set_errno(0);
            let entry = libc::readdir(self.dir.as_mut());
            if entry.is_null() {
                // If errno is still zero, it's the end of the directory.
                let errno = Error::last_os_error();
                if errno.value() == 0 {
                    return None;
                } else {
                    return Some(Err(errno));
                }
            }
            *entry
        };

        // Find the NUL terminator and convert into an OsString.
        let index = entry.d_name.iter().position(|c| *c == 0);
        let name = if let Some(index) = index {
            ffi::OsString::from_vec(entry.d_name[..index].iter().map(|c| *c as u8).collect())
        } else {
            // The name must have a NUL terminator.
            return Some(Err(Error::EIO));
        };

        Some(Ok(crate::DirEntry {
            name,
            inode_nr: entry.d_ino,
            offset: entry.d_off,
            file_type: entry.d_type,
        }))
    }
}

impl Drop for DirectoryEnumerator {
    fn drop(&mut self) {
        // SAFETY: Calling C API as documented, with no special requirements.
        unsafe {
            libc::closedir(self.dir.as_mut());
        }
    }
}

// Helper to create a CString from a Path.
pub fn path_to_cstr(path: &Path) -> Result<ffi::CString> {
    create_cstr(path.as_os_str().as_bytes())
}

// Helper to create a CString from a byte vector.
pub fn create_cstr(value: impl Into<Vec<u8>>) -> Result<ffi::CString> {
    ffi::CString::new(value).map_err(|_| Error::EINVAL)
}

// Return an error if a libc return value is negative. Otherwise, return the
// value.
pub fn check_errno<T: PartialOrd<T> + Default>(result: T) -> Result<T> {
    if result < Default::default() {
        Err(Error::last_os_error())
    } else {
        Ok(result)
    }
}

// Checks if a pointer returned from a libc function is NULL, and returns an
// error if it is.
pub fn check_ptr<T>(result: *mut T) -> Result<ptr::NonNull<T>> {
    ptr::NonNull::new(result).ok_or_else(Error::last_os_error)
}

/// Change the value of errno.
///
/// # Safety
///
/// Errno is thread-local; the caller must not attempt to observe the set
/// value from a different thread.
pub unsafe fn set_errno(error: i32) {
    // SAFETY: Calling C API as documented, with no special requirements.
    unsafe {
        *libc::__errno_location() = error;
    }
}

pub fn libc_stat_to_stat(stat: libc::stat) -> Stat {
    Stat {
        device_nr: stat.st_dev,
        inode_nr: stat.st_ino,
        link_count: stat.st_nlink as u64,
        mode: stat.st_mode,
        uid: stat.st_uid,
        gid: stat.st_gid,
        file_size: stat.st_size as u64,
        block_size: stat.st_blksize as i64,
        block_count: stat.st_blocks as u64,
        access_time: Timespec {
            seconds: stat.st_atime,
            nanoseconds: stat.st_atime_nsec,
        },
        write_time: Timespec {
            seconds: stat.st_mtime,
            nanoseconds: stat.st_mtime_nsec,
        },
        change_time: Timespec {
            seconds: stat.st_ctime,
            nanoseconds: stat.st_ctime_nsec,
        },
    }
}

pub fn libc_stat_fs_to_stat_fs(stat_fs: libc::statfs) -> StatFs {
    StatFs {
        block_size: stat_fs.f_bsize as u64,
        block_count: stat_fs.f_blocks,
        free_block_count: stat_fs.f_bfree,
        available_block_count: stat_fs.f_bavail,
        file_count: stat_fs.f_files,
        free_file_count: stat_fs.f_ffree,
        maximum_file_name_length: stat_fs.f_namelen as u64,
    }
}

// Wrapper around openat that allows reopening the root by specifying an
// empty path.
pub fn openat(
    dirfd: &std::fs::File,
    path: &Path,
    flags: i32,
    options: Option<crate::CreateOptions>,
) -> Result<std::fs::File> {
    if path.as_os_str().is_empty() {
        return reopen(dirfd, flags);
    }

    let mode = options.unwrap_or_default().mode();
    let path = path_to_cstr(path)?;

    // SAFETY: Calling C API as documented, with no special requirements.
    unsafe {
        let fd = check_errno(libc::openat(dirfd.as_raw_fd(), path.as_ptr(), flags, mode))?;

        Ok(std::fs::File::from_raw_fd(fd))
    }
}

// Reopen an existing file descriptor with new flags through /proc/self/fd.
pub fn reopen(fd: &std::fs::File, flags: i32) -> Result<std::fs::File> {
    let path = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let path = create_cstr(path.into_bytes())?;

    // SAFETY: Calling C API as documented, with no special requirements.
    unsafe {
        let fd = check_errno(libc::open(path.as_ptr(), flags & !libc::O_NOFOLLOW))?;
        Ok(std::fs::File::from_raw_fd(fd))
    }
}

/// Apply attributes either to the fd, or to a subpath of the fd.
pub fn set_attr(fd: &std::fs::File, path: Option<&Path>, attr: &SetAttributes) -> Result<()> {
    // SAFETY: Calling C APIs as documented, with no special requirements.
    unsafe {
        if let Some(size) = attr.size {
            if let Some(path) = path {
                // The file must be opened since truncate always follows
                // symlinks.
                let file = openat(fd, path, libc::O_WRONLY | libc::O_NOFOLLOW, None)?;
                check_errno(libc::ftruncate(file.as_raw_fd(), size))?;
            } else {
                check_errno(libc::ftruncate(fd.as_raw_fd(), size))?;
            }
        }

        let cpath = if let Some(path) = path {
            path_to_cstr(path)?
        } else {
            ffi::CString::default()
        };

        if let Some(mode) = attr.mode {
            if path.is_none() {
                check_errno(libc::fchmod(fd.as_raw_fd(), mode))?;
            } else {
                // This follows symlinks; fchmodat does not support
                // AT_SYMLINK_NOFOLLOW on Linux.
                check_errno(libc::fchmodat(fd.as_raw_fd(), cpath.as_ptr(), mode, 0))?;
            }
        }

        if attr.uid.is_some() || attr.gid.is_some() {
            let uid = attr.uid.unwrap_or(crate::UID_INVALID);
            let gid = attr.gid.unwrap_or(crate::GID_INVALID);
            if path.is_none() {
                check_errno(libc::fchown(fd.as_raw_fd(), uid, gid))?;
            } else {
                check_errno(libc::fchownat(
                    fd.as_raw_fd(),
                    cpath.as_ptr(),
                    uid,
                    gid,
                    libc::AT_SYMLINK_NOFOLLOW,
                ))?;
            }
        }

        if !attr.atime.is_omit() || !attr.mtime.is_omit() {
            let times = [
                set_time_to_timespec(&attr.atime),
                set_time_to_timespec(&attr.mtime),
            ];

            if path.is_none() {
                check_errno(libc::futimens(fd.as_raw_fd(), times.as_ptr()))?;
            } else {
                check_errno(libc::utimensat(
                    fd.as_raw_fd(),
                    cpath.as_ptr(),
                    times.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                ))?;
            }
        }

        Ok(())
    }
}

// Create a timespec with either omit, now or a value.
fn set_time_to_timespec(time: &SetTime) -> libc::timespec {
    match time {
        SetTime::Omit => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        SetTime::Set(duration) => libc::timespec {
            tv_sec: duration.as_secs() as _,
            tv_nsec: duration.subsec_nanos() as _,
        },
        SetTime::Now => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
    }
}
