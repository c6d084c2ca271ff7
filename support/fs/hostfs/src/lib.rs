// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host filesystem primitives for the HGFS server.
//!
//! Provides an errno-typed error, portable stat records, and a [`HostVolume`]
//! abstraction rooted at a directory descriptor. All volume operations take
//! paths relative to that root and are performed with the `*at` family of
//! libc calls, so a volume never operates outside the directory it was
//! created from (path validation is still the caller's responsibility; see
//! the name resolver in the `hgfs` crate).

#![cfg(target_os = "linux")]

#[macro_use]
mod macros;
mod unix;

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[allow(non_camel_case_types)]
pub type uid_t = u32;
#[allow(non_camel_case_types)]
pub type gid_t = u32;
#[allow(non_camel_case_types)]
pub type mode_t = u32;
#[allow(non_camel_case_types)]
pub type ino_t = u64;
#[allow(non_camel_case_types)]
pub type off_t = i64;

pub const UID_INVALID: uid_t = uid_t::MAX;
pub const GID_INVALID: gid_t = gid_t::MAX;

pub const S_IFDIR: u32 = 0x4000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xa000;
pub const S_IFMT: u32 = 0xf000;

pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

pub const O_RDONLY: i32 = libc::O_RDONLY;
pub const O_WRONLY: i32 = libc::O_WRONLY;
pub const O_RDWR: i32 = libc::O_RDWR;
pub const O_CREAT: i32 = libc::O_CREAT;
pub const O_EXCL: i32 = libc::O_EXCL;
pub const O_TRUNC: i32 = libc::O_TRUNC;
pub const O_DIRECTORY: i32 = libc::O_DIRECTORY;
pub const O_NOFOLLOW: i32 = libc::O_NOFOLLOW;

pub const AT_REMOVEDIR: i32 = libc::AT_REMOVEDIR;

host_errors! {
    EPERM = 1;
    ENOENT = 2;
    EINTR = 4;
    EIO = 5;
    EBADF = 9;
    EAGAIN = 11;
    ENOMEM = 12;
    EACCES = 13;
    EBUSY = 16;
    EEXIST = 17;
    EXDEV = 18;
    ENOTDIR = 20;
    EISDIR = 21;
    EINVAL = 22;
    ENFILE = 23;
    EMFILE = 24;
    ETXTBSY = 26;
    EFBIG = 27;
    ENOSPC = 28;
    EROFS = 30;
    ERANGE = 34;
    ENAMETOOLONG = 36;
    ENOTEMPTY = 39;
    ELOOP = 40;
    EOVERFLOW = 75;
    EOPNOTSUPP = 95;
}

/// Wraps a host error code in a strongly-typed struct.
#[derive(Copy, Clone, Error, Eq, PartialEq)]
#[error("{err} ({0})", err = str_error(*.0))]
pub struct Error(i32);

impl From<io::Error> for Error {
    // Map IO errors to the appropriate error code.
    fn from(error: io::Error) -> Self {
        if let Some(e) = error.raw_os_error() {
            return Error(e);
        }

        let e = match error.kind() {
            io::ErrorKind::NotFound => ENOENT,
            io::ErrorKind::PermissionDenied => EACCES,
            io::ErrorKind::AlreadyExists => EEXIST,
            io::ErrorKind::WouldBlock => EAGAIN,
            io::ErrorKind::Interrupted => EINTR,
            _ => EINVAL,
        };

        Error(e)
    }
}

impl Error {
    /// Creates an `Error` from the last operating system error.
    pub fn last_os_error() -> Self {
        Self(io::Error::last_os_error().raw_os_error().unwrap())
    }

    /// Creates an `Error` from an existing error code.
    pub fn from_errno(error: i32) -> Self {
        Self(error)
    }

    /// Returns the error code value.
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Error({} ({}))", str_error(self.0), self.0))
    }
}

/// A specialized `Result` type for operations that return host error codes.
pub type Result<T> = std::result::Result<T, Error>;

/// A second/nanosecond time stamp pair.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Timespec {
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl Timespec {
    /// Returns the stamp as nanoseconds since the epoch.
    pub fn to_nanos(&self) -> u64 {
        (self.seconds as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(self.nanoseconds as u64)
    }
}

/// File attributes as reported by `lstat`/`fstat`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Stat {
    pub device_nr: u64,
    pub inode_nr: ino_t,
    pub link_count: u64,
    pub mode: mode_t,
    pub uid: uid_t,
    pub gid: gid_t,
    pub file_size: u64,
    pub block_size: i64,
    pub block_count: u64,
    pub access_time: Timespec,
    pub write_time: Timespec,
    pub change_time: Timespec,
}

/// File system attributes as reported by `fstatfs`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct StatFs {
    pub block_size: u64,
    pub block_count: u64,
    pub free_block_count: u64,
    pub available_block_count: u64,
    pub file_count: u64,
    pub free_file_count: u64,
    pub maximum_file_name_length: u64,
}

/// A directory entry returned by `HostVolume::read_dir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub inode_nr: ino_t,
    pub offset: off_t,
    pub file_type: u8,
}

/// Specifies the mode to use when creating a file.
#[derive(Debug, Default, Copy, Clone)]
pub struct CreateOptions {
    mode: mode_t,
}

impl CreateOptions {
    /// Creates a new `CreateOptions` with the given mode bits.
    pub fn new(mode: mode_t) -> Self {
        Self { mode }
    }

    pub(crate) fn mode(&self) -> mode_t {
        self.mode
    }
}

/// Supplies the attributes to change for `set_attr`.
///
/// This combines the functionality of `truncate`, `chmod`, `chown` and
/// `utimensat`. If the operation fails part way, some of the changes may
/// still have been applied.
#[derive(Default, Clone, Copy)]
pub struct SetAttributes {
    /// Truncate the file to this size.
    pub size: Option<off_t>,

    /// Set the file's mode bits.
    pub mode: Option<mode_t>,

    /// Set the file's owner user ID.
    pub uid: Option<uid_t>,

    /// Set the file's owner group ID.
    pub gid: Option<gid_t>,

    /// Set the access time.
    pub atime: SetTime,

    /// Set the modified time.
    pub mtime: SetTime,
}

/// Supplies the value to set a time attribute to.
#[derive(Clone, Copy)]
pub enum SetTime {
    /// Don't change the time.
    Omit,
    /// Set the time to the specified value.
    Set(Duration),
    /// Set the time to the current time.
    Now,
}

impl SetTime {
    /// Checks whether the value matches the `Omit` variant.
    pub fn is_omit(&self) -> bool {
        matches!(self, SetTime::Omit)
    }
}

impl Default for SetTime {
    fn default() -> Self {
        Self::Omit
    }
}

/// A handle to a directory tree on the host.
///
/// All methods take paths relative to the volume root and resolve them with
/// the `*at` family of calls against the root's descriptor.
#[derive(Debug)]
pub struct HostVolume {
    inner: unix::Volume,
}

impl HostVolume {
    /// Creates a new instance of `HostVolume` rooted at the specified path.
    pub fn new(root_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            inner: unix::Volume::new(root_path.as_ref())?,
        })
    }

    /// Retrieves the attributes of a file. Symlinks are not followed.
    ///
    /// An empty path refers to the volume root itself.
    pub fn lstat(&self, path: impl AsRef<Path>) -> Result<Stat> {
        self.inner.lstat(path.as_ref())
    }

    /// Opens or creates a file, returning a [`HostFile`].
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        flags: i32,
        options: Option<CreateOptions>,
    ) -> Result<HostFile> {
        Ok(HostFile {
            inner: self.inner.open(path.as_ref(), flags, options)?,
        })
    }

    /// Creates a new directory.
    pub fn mkdir(&self, path: impl AsRef<Path>, options: CreateOptions) -> Result<()> {
        self.inner.mkdir(path.as_ref(), options)
    }

    /// Creates a new symbolic link with the given target contents.
    ///
    /// The target is stored as provided; it is not validated or resolved.
    pub fn symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
        self.inner.symlink(path.as_ref(), target.as_ref())
    }

    /// Reads the target of a symbolic link.
    pub fn read_link(&self, path: impl AsRef<Path>) -> Result<OsString> {
        self.inner.read_link(path.as_ref())
    }

    /// Removes a file, or a directory if `AT_REMOVEDIR` is specified.
    pub fn unlink(&self, path: impl AsRef<Path>, flags: i32) -> Result<()> {
        self.inner.unlink(path.as_ref(), flags)
    }

    /// Renames a file. The destination may live on a different volume, as
    /// long as both volumes are on the same file system.
    pub fn rename(
        &self,
        path: impl AsRef<Path>,
        new_volume: &HostVolume,
        new_path: impl AsRef<Path>,
    ) -> Result<()> {
        self.inner
            .rename(path.as_ref(), &new_volume.inner, new_path.as_ref())
    }

    /// Sets the attributes of a file. Symlinks are not followed where the
    /// underlying calls allow it.
    pub fn set_attr(&self, path: impl AsRef<Path>, attr: SetAttributes) -> Result<()> {
        self.inner.set_attr(path.as_ref(), &attr)
    }

    /// Retrieves attributes of the file system holding `path`.
    pub fn stat_fs(&self, path: impl AsRef<Path>) -> Result<StatFs> {
        self.inner.stat_fs(path.as_ref())
    }

    /// Reads all entries of the directory at `path`, in the order the host
    /// returns them. The `.` and `..` entries are included if the host
    /// reports them.
    pub fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
        self.inner.read_dir(path.as_ref())
    }
}

/// An open file on a [`HostVolume`].
#[derive(Debug)]
pub struct HostFile {
    inner: unix::File,
}

impl HostFile {
    /// Retrieves the attributes of the file.
    pub fn fstat(&self) -> Result<Stat> {
        self.inner.fstat()
    }

    /// Reads a number of bytes starting from a given offset. The file
    /// pointer is not changed.
    pub fn pread(&self, buffer: &mut [u8], offset: off_t) -> Result<usize> {
        self.inner.pread(buffer, offset)
    }

    /// Writes a number of bytes starting from a given offset. The file
    /// pointer is not changed.
    pub fn pwrite(&self, buffer: &[u8], offset: off_t) -> Result<usize> {
        self.inner.pwrite(buffer, offset)
    }

    /// Sets the attributes of the file through its descriptor.
    pub fn set_attr(&self, attr: SetAttributes) -> Result<()> {
        self.inner.set_attr(&attr)
    }

    /// Retrieves attributes of the file system holding the file.
    pub fn stat_fs(&self) -> Result<StatFs> {
        self.inner.stat_fs()
    }

    /// Synchronizes the file's buffers, optionally data only.
    pub fn fsync(&self, data_only: bool) -> Result<()> {
        self.inner.fsync(data_only)
    }
}

pub fn s_isreg(mode: mode_t) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn s_isdir(mode: mode_t) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn s_islnk(mode: mode_t) -> bool {
    mode & S_IFMT == S_IFLNK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct TestEnv {
        root: TempDir,
        volume: HostVolume,
    }

    impl TestEnv {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let volume = HostVolume::new(root.path()).unwrap();
            Self { root, volume }
        }

        fn create_file(&self, name: &str, contents: &str) {
            let path = self.root.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
    }

    #[test]
    fn lstat() {
        let env = TestEnv::new();
        env.create_file("testfile", "test");
        let stat = env.volume.lstat("testfile").unwrap();
        assert_ne!(stat.inode_nr, 0);
        assert_eq!(stat.link_count, 1);
        assert_eq!(stat.mode & S_IFMT, S_IFREG);
        assert_eq!(stat.file_size, 4);

        let result = env.volume.lstat("no_ent").unwrap_err();
        assert_eq!(result.value(), ENOENT);

        // An empty path refers to the root.
        let stat = env.volume.lstat("").unwrap();
        assert_eq!(stat.mode & S_IFMT, S_IFDIR);
    }

    #[test]
    fn read_write() {
        let env = TestEnv::new();
        let file = env
            .volume
            .open(
                "testfile",
                O_RDWR | O_CREAT | O_EXCL,
                Some(CreateOptions::new(0o666)),
            )
            .unwrap();

        assert_eq!(file.fstat().unwrap().file_size, 0);
        assert_eq!(file.pwrite(b"Hello", 0).unwrap(), 5);
        assert_eq!(file.pwrite(b", world!", 5).unwrap(), 8);
        assert_eq!(file.fstat().unwrap().file_size, 13);

        let mut buffer = [0; 1024];
        assert_eq!(file.pread(&mut buffer, 0).unwrap(), 13);
        assert_eq!(&buffer[..13], b"Hello, world!");

        // Read at EOF.
        assert_eq!(file.pread(&mut buffer, 13).unwrap(), 0);

        // Exclusive create of an existing file.
        let err = env
            .volume
            .open(
                "testfile",
                O_RDWR | O_CREAT | O_EXCL,
                Some(CreateOptions::new(0o666)),
            )
            .unwrap_err();
        assert_eq!(err.value(), EEXIST);
    }

    #[test]
    fn read_dir() {
        let env = TestEnv::new();
        for i in 0..5 {
            env.create_file(&format!("file{}", i), "test");
        }

        let entries = env.volume.read_dir("").unwrap();
        let mut names: Vec<_> = entries
            .iter()
            .map(|e| e.name.to_str().unwrap().to_string())
            .filter(|n| n != "." && n != "..")
            .collect();

        names.sort();
        assert_eq!(names, ["file0", "file1", "file2", "file3", "file4"]);
        for entry in &entries {
            assert_ne!(entry.inode_nr, 0);
        }
    }

    #[test]
    fn symlink() {
        let env = TestEnv::new();
        env.create_file("testfile", "foo");
        env.volume.symlink("testlink", "testfile").unwrap();
        let stat = env.volume.lstat("testlink").unwrap();
        assert_eq!(stat.mode & S_IFMT, S_IFLNK);
        assert_eq!(
            env.volume.read_link("testlink").unwrap(),
            OsString::from("testfile")
        );

        assert_eq!(
            env.volume.read_link("testfile").unwrap_err().value(),
            EINVAL
        );
    }

    #[test]
    fn unlink_and_rename() {
        let env = TestEnv::new();
        env.create_file("testfile", "test");
        env.volume
            .mkdir("testdir", CreateOptions::new(0o777))
            .unwrap();
        env.create_file("testdir/inner", "x");

        // A non-empty directory can't be removed.
        assert_eq!(
            env.volume.unlink("testdir", AT_REMOVEDIR).unwrap_err().value(),
            ENOTEMPTY
        );

        env.volume
            .rename("testfile", &env.volume, "testfile2")
            .unwrap();
        assert_eq!(env.volume.lstat("testfile").unwrap_err().value(), ENOENT);
        env.volume.unlink("testfile2", 0).unwrap();
        env.volume.unlink(PathBuf::from("testdir/inner"), 0).unwrap();
        env.volume.unlink("testdir", AT_REMOVEDIR).unwrap();
    }

    #[test]
    fn set_attr() {
        let env = TestEnv::new();
        env.create_file("testfile", "hello world");
        let mut attr = SetAttributes::default();
        attr.size = Some(5);
        env.volume.set_attr("testfile", attr).unwrap();
        assert_eq!(env.volume.lstat("testfile").unwrap().file_size, 5);

        let mut attr = SetAttributes::default();
        attr.mode = Some(0o600);
        env.volume.set_attr("testfile", attr).unwrap();
        assert_eq!(env.volume.lstat("testfile").unwrap().mode & 0o777, 0o600);

        let mut attr = SetAttributes::default();
        attr.mtime = SetTime::Set(Duration::new(1_000_000, 500));
        env.volume.set_attr("testfile", attr).unwrap();
        let stat = env.volume.lstat("testfile").unwrap();
        assert_eq!(stat.write_time.seconds, 1_000_000);
        assert_eq!(stat.write_time.nanoseconds, 500);
    }

    #[test]
    fn stat_fs() {
        let env = TestEnv::new();
        let stat_fs = env.volume.stat_fs("").unwrap();
        assert_ne!(stat_fs.block_size, 0);
        assert_ne!(stat_fs.block_count, 0);
    }
}
