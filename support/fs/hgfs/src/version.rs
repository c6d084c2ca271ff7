// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-operation protocol version negotiation.
//!
//! Each versioned operation has an atomic cell recording the opcode
//! currently in use. Requests are issued at the cell's version; when the
//! peer replies `ProtocolError` the cell is downgraded to the next older
//! version and the request retried once. Later requests start at the
//! downgraded version directly, so a peer pays the negotiation round-trip
//! at most once per operation. The negotiation is invisible to packet
//! handlers.

use crate::node::HgfsHandle;
use crate::protocol;
use crate::protocol::AttrV2;
use crate::protocol::PacketReader;
use crate::protocol::PacketWriter;
use crate::protocol::Status;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// An atomic cell holding the protocol version in use for one operation.
pub struct VersionCell {
    // Known opcodes for the operation, newest first.
    versions: &'static [u32],
    current: AtomicUsize,
}

impl VersionCell {
    pub const fn new(versions: &'static [u32]) -> Self {
        Self {
            versions,
            current: AtomicUsize::new(0),
        }
    }

    /// Returns the opcode currently in use.
    pub fn current(&self) -> u32 {
        self.versions[self.current.load(Ordering::Acquire).min(self.versions.len() - 1)]
    }

    /// Downgrades from `observed` to the next older version, if any.
    ///
    /// Returns the opcode to retry with. A concurrent downgrade wins the
    /// race; the caller still retries at the resulting version.
    pub fn downgrade(&self, observed: u32) -> Option<u32> {
        let pos = self.versions.iter().position(|&v| v == observed)?;
        if pos + 1 >= self.versions.len() {
            return None;
        }

        let _ = self.current.compare_exchange(
            pos,
            pos + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let now = self.current.load(Ordering::Acquire).min(self.versions.len() - 1);
        if now > pos {
            tracing::debug!(from = observed, to = self.versions[now], "downgraded operation version");
            Some(self.versions[now])
        } else {
            None
        }
    }
}

/// Issues a request at the cell's current version, downgrading and retrying
/// once if the peer rejects the version with `ProtocolError`.
pub fn negotiate<T>(
    cell: &VersionCell,
    mut issue: impl FnMut(u32) -> crate::Result<(Status, T)>,
) -> crate::Result<(Status, T)> {
    let op = cell.current();
    let (status, value) = issue(op)?;
    if status != Status::ProtocolError {
        return Ok((status, value));
    }

    match cell.downgrade(op) {
        Some(older) => issue(older),
        None => Ok((status, value)),
    }
}

/// A blocking request/reply exchange with the peer.
pub trait RoundTrip {
    /// Sends a request packet and returns the peer's reply bytes.
    fn round_trip(&self, packet: &[u8]) -> crate::Result<Vec<u8>>;
}

/// Issues requests to the peer on behalf of the host, handling version
/// negotiation.
pub struct Requester<T> {
    transport: T,
    next_id: AtomicU32,
    getattr: VersionCell,
}

impl<T: RoundTrip> Requester<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: AtomicU32::new(1),
            getattr: VersionCell::new(&[protocol::OP_GETATTR_V2, protocol::OP_GETATTR]),
        }
    }

    /// Retrieves attributes from the peer.
    ///
    /// By-handle is preferred when a handle is supplied; if the peer
    /// reports `InvalidHandle` for the by-handle attempt, the request is
    /// retried once by name.
    pub fn get_attr(
        &self,
        handle: Option<HgfsHandle>,
        cp_name: &[u8],
    ) -> crate::Result<(Status, AttrV2)> {
        let (status, attr) = self.get_attr_inner(handle, cp_name)?;
        if status == Status::InvalidHandle && handle.is_some() {
            return self.get_attr_inner(None, cp_name);
        }

        Ok((status, attr))
    }

    fn get_attr_inner(
        &self,
        handle: Option<HgfsHandle>,
        cp_name: &[u8],
    ) -> crate::Result<(Status, AttrV2)> {
        negotiate(&self.getattr, |op| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut packet = vec![0u8; protocol::MAX_PACKET_SIZE];
            let mut writer = PacketWriter::new_request(&mut packet);
            match op {
                protocol::OP_GETATTR_V2 => {
                    let hints = if handle.is_some() {
                        protocol::HINT_USE_HANDLE
                    } else {
                        0
                    };
                    writer.u32(hints)?;
                    writer.u32(handle.unwrap_or(0))?;
                    writer.u32(protocol::CASE_SENSITIVE)?;
                    writer.cp_name(cp_name)?;
                }
                _ => {
                    writer.cp_name(cp_name)?;
                }
            }

            writer.request_header(op, id)?;
            let size = writer.size();
            packet.truncate(size);

            let reply = self.transport.round_trip(&packet)?;
            let mut reader = PacketReader::new(&reply);
            let header = reader.reply_header()?;
            if header.status != Status::Success {
                return Ok((header.status, AttrV2::default()));
            }

            let attr = match op {
                protocol::OP_GETATTR_V2 => reader.attr_v2()?,
                _ => reader.attr_v1()?.into(),
            };

            Ok((Status::Success, attr))
        })
    }
}
