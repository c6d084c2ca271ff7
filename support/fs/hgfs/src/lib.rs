// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side server for the Host-Guest File System (HGFS).
//!
//! HGFS is a request/reply protocol spoken between a virtual machine guest
//! and its host. Guest processes read, write, enumerate and modify files in
//! administrator-designated shared folders on the host. Each request names
//! an operation plus parameters in a cross-platform name encoding; the
//! server resolves the name into a host path, performs the action and
//! returns a reply.
//!
//! This crate is the per-session protocol engine: the packet codec and
//! dispatcher, the handle table mapping opaque per-session handles to open
//! files and directory searches, the name-resolution pipeline with its
//! symlink-escape check, the bounded open-file cache, and the session
//! lifecycle. The transport that carries packets and the host filesystem
//! primitives (see the `hostfs` crate) are external collaborators.

#![forbid(unsafe_code)]
#![cfg(target_os = "linux")]

pub mod cpname;
mod node;
mod oplock;
pub mod protocol;
mod resolve;
mod search;
mod server;
mod session;
mod share;
mod version;

pub use node::HgfsHandle;
pub use node::LocalId;
pub use oplock::OplockKind;
pub use search::SearchEntry;
pub use search::SearchKind;
pub use server::HgfsServer;
pub use server::HgfsServerOptions;
pub use server::ReplySender;
pub use server::Transport;
pub use session::Session;
pub use session::SessionKind;
pub use share::ShareConfig;
pub use share::ShareInfo;
pub use share::ShareRegistry;
pub use version::Requester;
pub use version::RoundTrip;
pub use version::VersionCell;

use protocol::Status;
use thiserror::Error;

/// The internal error taxonomy for request processing.
///
/// Operations fail with a host errno or one of the protocol-internal causes
/// below. At the codec boundary every error is translated to a wire
/// [`Status`] via [`OpError::status`]; handlers never abort the session on a
/// per-request error.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("host error")]
    Host(#[from] hostfs::Error),
    #[error("malformed packet")]
    Protocol,
    #[error("reply too large for the packet buffer")]
    BufferTooSmall,
    #[error("stale or unallocated handle")]
    HandleGone,
    #[error("name resolves outside the share")]
    NameEscape,
    #[error("unknown share name")]
    ShareNotFound,
    #[error("share access denied")]
    ShareAccessDenied,
    #[error("invalid name component")]
    InvalidName,
    #[error("name too long")]
    NameTooLong,
    #[error("operation not supported on this host")]
    Unsupported,
}

/// A specialized `Result` type for request processing.
pub type Result<T> = std::result::Result<T, OpError>;

impl OpError {
    /// Translates the internal error to the wire status, per the protocol's
    /// fixed translation table.
    pub fn status(&self) -> Status {
        match self {
            OpError::Host(e) => match e.value() {
                hostfs::ENOENT => Status::NoSuchFileOrDir,
                hostfs::EBADF => Status::InvalidHandle,
                hostfs::EPERM => Status::OperationNotPermitted,
                hostfs::EEXIST => Status::FileExists,
                hostfs::ENOTDIR => Status::NotDirectory,
                hostfs::ENOTEMPTY => Status::DirNotEmpty,
                hostfs::EACCES => Status::AccessDenied,
                hostfs::ETXTBSY | hostfs::EBUSY => Status::SharingViolation,
                hostfs::ENOSPC => Status::NoSpace,
                hostfs::EOPNOTSUPP => Status::OperationNotSupported,
                hostfs::ENAMETOOLONG => Status::NameTooLong,
                _ => Status::GenericError,
            },
            OpError::Protocol | OpError::BufferTooSmall => Status::ProtocolError,
            OpError::HandleGone => Status::InvalidHandle,
            OpError::NameEscape | OpError::ShareAccessDenied => Status::AccessDenied,
            OpError::ShareNotFound => Status::NoSuchFileOrDir,
            OpError::InvalidName => Status::InvalidName,
            OpError::NameTooLong => Status::NameTooLong,
            OpError::Unsupported => Status::OperationNotSupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation() {
        assert_eq!(
            OpError::Host(hostfs::Error::ENOENT).status(),
            Status::NoSuchFileOrDir
        );
        assert_eq!(
            OpError::Host(hostfs::Error::ENOTEMPTY).status(),
            Status::DirNotEmpty
        );
        assert_eq!(
            OpError::Host(hostfs::Error::ETXTBSY).status(),
            Status::SharingViolation
        );
        assert_eq!(
            OpError::Host(hostfs::Error::EIO).status(),
            Status::GenericError
        );
        assert_eq!(OpError::HandleGone.status(), Status::InvalidHandle);
        assert_eq!(OpError::NameEscape.status(), Status::AccessDenied);
        assert_eq!(OpError::BufferTooSmall.status(), Status::ProtocolError);
        assert_eq!(OpError::ShareNotFound.status(), Status::NoSuchFileOrDir);
    }
}
