// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The HGFS wire format: request/reply headers, the closed status
//! enumeration, versioned request payloads and attribute records.
//!
//! All integers are little-endian. Strings on the wire are in CP form (see
//! [`crate::cpname`]): a 32-bit length followed by NUL-separated path
//! components.

use crate::OpError;
use std::fmt;
use std::slice;

#[macro_use]
mod macros;

/// The maximum size of a request or reply packet.
pub const MAX_PACKET_SIZE: usize = 6144;

/// Size of the fixed request header: {u32 opcode, u32 id}.
pub const REQUEST_HEADER_SIZE: usize = 8;

/// Size of the fixed reply header: {u32 opcode, u32 id, u32 status}.
pub const REPLY_HEADER_SIZE: usize = 12;

/// The largest read or write payload that fits in a packet.
pub const MAX_IO_SIZE: usize = MAX_PACKET_SIZE - REPLY_HEADER_SIZE - 4;

// Request opcodes. The opcode identifies both the operation and its version.
pub const OP_OPEN: u32 = 0;
pub const OP_READ: u32 = 1;
pub const OP_WRITE: u32 = 2;
pub const OP_CLOSE: u32 = 3;
pub const OP_SEARCH_OPEN: u32 = 4;
pub const OP_SEARCH_READ: u32 = 5;
pub const OP_SEARCH_CLOSE: u32 = 6;
pub const OP_GETATTR: u32 = 7;
pub const OP_SETATTR: u32 = 8;
pub const OP_CREATE_DIR: u32 = 9;
pub const OP_DELETE_FILE: u32 = 10;
pub const OP_DELETE_DIR: u32 = 11;
pub const OP_RENAME: u32 = 12;
pub const OP_QUERY_VOLUME: u32 = 13;
pub const OP_CREATE_SYMLINK: u32 = 14;
pub const OP_SERVER_LOCK_CHANGE: u32 = 15;
pub const OP_OPEN_V2: u32 = 16;
pub const OP_GETATTR_V2: u32 = 17;
pub const OP_SETATTR_V2: u32 = 18;
pub const OP_SEARCH_READ_V2: u32 = 19;
pub const OP_WRITE_STREAM: u32 = 20;

// Access modes for the open request.
pub const OPEN_MODE_READ_ONLY: u32 = 0;
pub const OPEN_MODE_WRITE_ONLY: u32 = 1;
pub const OPEN_MODE_READ_WRITE: u32 = 2;

// Flags for the open request.
pub const OPEN_FLAG_CREATE: u32 = 1 << 0;
pub const OPEN_FLAG_TRUNCATE: u32 = 1 << 1;
pub const OPEN_FLAG_EXCLUSIVE: u32 = 1 << 2;
pub const OPEN_FLAG_APPEND: u32 = 1 << 3;
pub const OPEN_FLAG_SEQUENTIAL: u32 = 1 << 4;

// Hints for the V2 getattr and setattr requests.
pub const HINT_USE_HANDLE: u32 = 1 << 0;

// Update flags for the V1 setattr request (V1 has no explicit attr mask).
pub const SETATTR_SIZE: u8 = 1 << 0;
pub const SETATTR_PERMS: u8 = 1 << 1;
pub const SETATTR_ACCESS_TIME: u8 = 1 << 2;
pub const SETATTR_WRITE_TIME: u8 = 1 << 3;

// Case-sensitivity flags carried by V2 requests.
pub const CASE_SENSITIVE: u32 = 0;
pub const CASE_INSENSITIVE: u32 = 1;

// Opportunistic lock kinds on the wire.
pub const LOCK_NONE: u32 = 0;
pub const LOCK_SHARED: u32 = 1;
pub const LOCK_EXCLUSIVE: u32 = 2;

// File types on the wire.
pub const FILE_TYPE_REGULAR: u32 = 0;
pub const FILE_TYPE_DIRECTORY: u32 = 1;
pub const FILE_TYPE_SYMLINK: u32 = 2;

// V2 attribute mask bits. V1 has an implicit mask covering the fixed V1
// record.
pub const ATTR_VALID_TYPE: u64 = 1 << 0;
pub const ATTR_VALID_SIZE: u64 = 1 << 1;
pub const ATTR_VALID_ACCESS_TIME: u64 = 1 << 2;
pub const ATTR_VALID_WRITE_TIME: u64 = 1 << 3;
pub const ATTR_VALID_CHANGE_TIME: u64 = 1 << 4;
pub const ATTR_VALID_SPECIAL_PERMS: u64 = 1 << 5;
pub const ATTR_VALID_OWNER_PERMS: u64 = 1 << 6;
pub const ATTR_VALID_GROUP_PERMS: u64 = 1 << 7;
pub const ATTR_VALID_OTHER_PERMS: u64 = 1 << 8;
pub const ATTR_VALID_USER_ID: u64 = 1 << 9;
pub const ATTR_VALID_GROUP_ID: u64 = 1 << 10;
pub const ATTR_VALID_FILE_ID: u64 = 1 << 11;

// These messages use the format:
// opcode name (field_name[kind])*
// The kind indicates the type:
// 1, 2, 4, 8: u8, u16, u32 or u64.
// c: A 4 byte length followed by a CP name of that length.
// a1, a2: A V1 or V2 attribute record.
// Trailing payload bytes (Write, WriteStream) are read from the message's
// reader by the handler.
hgfs_request_messages! {
    0 OpenRequest mode[4] flags[4] perms[1] name[c];
    1 ReadRequest handle[4] offset[8] size[4];
    2 WriteRequest handle[4] offset[8] size[4] flags[1];
    3 CloseRequest handle[4];
    4 SearchOpenRequest name[c];
    5 SearchReadRequest handle[4] offset[4];
    6 SearchCloseRequest handle[4];
    7 GetattrRequest name[c];
    8 SetattrRequest update[1] attr[a1] name[c];
    9 CreateDirRequest perms[1] name[c];
    10 DeleteFileRequest name[c];
    11 DeleteDirRequest name[c];
    12 RenameRequest old_name[c] new_name[c];
    13 QueryVolumeRequest name[c];
    14 CreateSymlinkRequest name[c] target[c];
    15 ServerLockChangeRequest handle[4] lock[4];
    16 OpenV2Request mask[4] mode[4] flags[4] special_perms[1] owner_perms[1] group_perms[1] other_perms[1] allocation_size[8] desired_access[4] share_access[4] desired_lock[4] case_flags[4] name[c];
    17 GetattrV2Request hints[4] handle[4] case_flags[4] name[c];
    18 SetattrV2Request hints[4] handle[4] case_flags[4] attr[a2] name[c];
    19 SearchReadV2Request handle[4] offset[4];
    20 WriteStreamRequest handle[4] flags[4];
}

/// Status codes carried by every reply.
///
/// This is a closed, cross-platform enumeration; it is never extended with
/// host errno values. Unknown values from peers decode to `GenericError`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    NoSuchFileOrDir = 1,
    InvalidHandle = 2,
    OperationNotPermitted = 3,
    FileExists = 4,
    NotDirectory = 5,
    DirNotEmpty = 6,
    ProtocolError = 7,
    AccessDenied = 8,
    SharingViolation = 9,
    NoSpace = 10,
    OperationNotSupported = 11,
    NameTooLong = 12,
    InvalidName = 13,
    GenericError = 14,
}

impl Status {
    /// Decodes a wire value, mapping unknown values to `GenericError`.
    pub fn from_wire(value: u32) -> Status {
        match value {
            0 => Status::Success,
            1 => Status::NoSuchFileOrDir,
            2 => Status::InvalidHandle,
            3 => Status::OperationNotPermitted,
            4 => Status::FileExists,
            5 => Status::NotDirectory,
            6 => Status::DirNotEmpty,
            7 => Status::ProtocolError,
            8 => Status::AccessDenied,
            9 => Status::SharingViolation,
            10 => Status::NoSpace,
            11 => Status::OperationNotSupported,
            12 => Status::NameTooLong,
            13 => Status::InvalidName,
            _ => Status::GenericError,
        }
    }
}

/// The fixed header at the start of every request.
#[derive(Debug, Copy, Clone)]
pub struct RequestHeader {
    pub op: u32,
    pub id: u32,
}

/// The fixed header at the start of every reply.
#[derive(Debug, Copy, Clone)]
pub struct ReplyHeader {
    pub op: u32,
    pub id: u32,
    pub status: Status,
}

/// The V1 attribute record. The set of meaningful fields is implicit.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AttrV1 {
    pub file_type: u32,
    pub size: u64,
    pub creation_time: u64,
    pub access_time: u64,
    pub write_time: u64,
    pub change_time: u64,
    pub owner_perms: u8,
}

/// The V2 attribute record. `mask` declares which fields are meaningful.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AttrV2 {
    pub mask: u64,
    pub file_type: u32,
    pub size: u64,
    pub creation_time: u64,
    pub access_time: u64,
    pub write_time: u64,
    pub change_time: u64,
    pub special_perms: u8,
    pub owner_perms: u8,
    pub group_perms: u8,
    pub other_perms: u8,
    pub user_id: u32,
    pub group_id: u32,
    pub host_file_id: u64,
    pub volume_id: u32,
}

impl From<AttrV1> for AttrV2 {
    // V1 records carry an implicit mask over the fixed V1 field set.
    fn from(attr: AttrV1) -> Self {
        AttrV2 {
            mask: ATTR_VALID_TYPE
                | ATTR_VALID_SIZE
                | ATTR_VALID_ACCESS_TIME
                | ATTR_VALID_WRITE_TIME
                | ATTR_VALID_CHANGE_TIME
                | ATTR_VALID_OWNER_PERMS,
            file_type: attr.file_type,
            size: attr.size,
            creation_time: attr.creation_time,
            access_time: attr.access_time,
            write_time: attr.write_time,
            change_time: attr.change_time,
            owner_perms: attr.owner_perms,
            ..Default::default()
        }
    }
}

/// Helper to extract fields from a buffer of bytes.
#[derive(Clone)]
pub struct PacketReader<'a> {
    slice: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(slice: &'a [u8]) -> PacketReader<'a> {
        PacketReader { slice, offset: 0 }
    }

    pub fn u8(&mut self) -> crate::Result<u8> {
        let result = self.slice.get(self.offset).ok_or(OpError::Protocol)?;

        self.offset += 1;
        Ok(*result)
    }

    // Unfortunately this can't be done with generics because there is no
    // trait for from_le_bytes.
    pub fn u16(&mut self) -> crate::Result<u16> {
        Ok(u16::from_le_bytes(
            self.read(size_of::<u16>())?.try_into().unwrap(),
        ))
    }

    pub fn u32(&mut self) -> crate::Result<u32> {
        Ok(u32::from_le_bytes(
            self.read(size_of::<u32>())?.try_into().unwrap(),
        ))
    }

    pub fn u64(&mut self) -> crate::Result<u64> {
        Ok(u64::from_le_bytes(
            self.read(size_of::<u64>())?.try_into().unwrap(),
        ))
    }

    pub fn read(&mut self, count: usize) -> crate::Result<&'a [u8]> {
        let end = self.offset.checked_add(count).ok_or(OpError::Protocol)?;
        let result = self.slice.get(self.offset..end).ok_or(OpError::Protocol)?;

        self.offset = end;
        Ok(result)
    }

    pub fn request_header(&mut self) -> crate::Result<RequestHeader> {
        Ok(RequestHeader {
            op: self.u32()?,
            id: self.u32()?,
        })
    }

    pub fn reply_header(&mut self) -> crate::Result<ReplyHeader> {
        Ok(ReplyHeader {
            op: self.u32()?,
            id: self.u32()?,
            status: Status::from_wire(self.u32()?),
        })
    }

    // Read a CP name preceded by a four byte length. The length is validated
    // against the packet bounds.
    pub fn cp_name(&mut self) -> crate::Result<&'a [u8]> {
        let length = self.u32()?;
        self.read(length as usize)
    }

    pub fn attr_v1(&mut self) -> crate::Result<AttrV1> {
        Ok(AttrV1 {
            file_type: self.u32()?,
            size: self.u64()?,
            creation_time: self.u64()?,
            access_time: self.u64()?,
            write_time: self.u64()?,
            change_time: self.u64()?,
            owner_perms: self.u8()?,
        })
    }

    pub fn attr_v2(&mut self) -> crate::Result<AttrV2> {
        Ok(AttrV2 {
            mask: self.u64()?,
            file_type: self.u32()?,
            size: self.u64()?,
            creation_time: self.u64()?,
            access_time: self.u64()?,
            write_time: self.u64()?,
            change_time: self.u64()?,
            special_perms: self.u8()?,
            owner_perms: self.u8()?,
            group_perms: self.u8()?,
            other_perms: self.u8()?,
            user_id: self.u32()?,
            group_id: self.u32()?,
            host_file_id: self.u64()?,
            volume_id: self.u32()?,
        })
    }

    /// Returns the bytes remaining in the packet without consuming them.
    pub fn remaining(&self) -> &'a [u8] {
        &self.slice[self.offset.min(self.slice.len())..]
    }
}

impl fmt::Debug for PacketReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketReader")
            .field("len", &self.slice.len())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Helper to write fields to a buffer of bytes.
pub struct PacketWriter<'a> {
    slice: &'a mut [u8],
    offset: usize,
}

impl<'a> PacketWriter<'a> {
    /// Create an instance to write a reply payload after the reply header.
    pub fn new(slice: &'a mut [u8]) -> PacketWriter<'a> {
        PacketWriter {
            slice,
            offset: REPLY_HEADER_SIZE,
        }
    }

    /// Create an instance to write a request payload after the request
    /// header.
    pub fn new_request(slice: &'a mut [u8]) -> PacketWriter<'a> {
        PacketWriter {
            slice,
            offset: REQUEST_HEADER_SIZE,
        }
    }

    /// Create an instance that doesn't skip any header.
    pub fn new_raw(slice: &'a mut [u8]) -> PacketWriter<'a> {
        PacketWriter { slice, offset: 0 }
    }

    pub fn u8(&mut self, value: u8) -> crate::Result<()> {
        *self
            .slice
            .get_mut(self.offset)
            .ok_or(OpError::BufferTooSmall)? = value;

        self.offset += 1;
        Ok(())
    }

    pub fn u16(&mut self, value: u16) -> crate::Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> crate::Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn u64(&mut self, value: u64) -> crate::Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write(&mut self, value: &[u8]) -> crate::Result<()> {
        self.next(value.len())?.copy_from_slice(value);
        Ok(())
    }

    /// Write a reply header at the start of the buffer. The payload length
    /// is implied by the current offset.
    pub fn reply_header(&mut self, op: u32, id: u32, status: Status) -> crate::Result<()> {
        let mut writer = PacketWriter {
            slice: self.slice,
            offset: 0,
        };
        writer.u32(op)?;
        writer.u32(id)?;
        writer.u32(status as u32)
    }

    /// Write a request header at the start of the buffer.
    pub fn request_header(&mut self, op: u32, id: u32) -> crate::Result<()> {
        let mut writer = PacketWriter {
            slice: self.slice,
            offset: 0,
        };
        writer.u32(op)?;
        writer.u32(id)
    }

    // Write a CP name preceded by a four byte length.
    pub fn cp_name(&mut self, name: &[u8]) -> crate::Result<()> {
        self.u32(name.len() as u32)?;
        self.write(name)
    }

    pub fn attr_v1(&mut self, attr: &AttrV1) -> crate::Result<()> {
        self.u32(attr.file_type)?;
        self.u64(attr.size)?;
        self.u64(attr.creation_time)?;
        self.u64(attr.access_time)?;
        self.u64(attr.write_time)?;
        self.u64(attr.change_time)?;
        self.u8(attr.owner_perms)
    }

    pub fn attr_v2(&mut self, attr: &AttrV2) -> crate::Result<()> {
        self.u64(attr.mask)?;
        self.u32(attr.file_type)?;
        self.u64(attr.size)?;
        self.u64(attr.creation_time)?;
        self.u64(attr.access_time)?;
        self.u64(attr.write_time)?;
        self.u64(attr.change_time)?;
        self.u8(attr.special_perms)?;
        self.u8(attr.owner_perms)?;
        self.u8(attr.group_perms)?;
        self.u8(attr.other_perms)?;
        self.u32(attr.user_id)?;
        self.u32(attr.group_id)?;
        self.u64(attr.host_file_id)?;
        self.u32(attr.volume_id)
    }

    // Get a partial slice without updating the offset.
    pub fn peek<I>(&mut self, index: I) -> crate::Result<&mut [u8]>
    where
        I: slice::SliceIndex<[u8], Output = [u8]>,
    {
        self.slice[self.offset..]
            .get_mut(index)
            .ok_or(OpError::BufferTooSmall)
    }

    // Get a partial slice and update the offset to after it.
    pub fn next(&mut self, count: usize) -> crate::Result<&mut [u8]> {
        let start = self.offset;
        let end = start.checked_add(count).ok_or(OpError::BufferTooSmall)?;
        self.offset = end;
        self.slice.get_mut(start..end).ok_or(OpError::BufferTooSmall)
    }

    /// Gets the currently written size.
    pub fn size(&self) -> usize {
        self.offset
    }

    /// Resets the write position to after the reply header.
    pub fn reset(&mut self) {
        self.offset = REPLY_HEADER_SIZE;
    }
}
