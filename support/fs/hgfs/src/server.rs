// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The request dispatcher and per-opcode handlers.
//!
//! Every handler follows the same shape: unpack the request, look up a
//! handle or resolve a name, perform the host operation, update the handle
//! table, and pack the reply. Errors become reply statuses; a request never
//! aborts its session. The only session-fatal condition is a transport
//! failure.

use crate::cpname;
use crate::node::HgfsHandle;
use crate::node::LocalId;
use crate::node::NODE_APPEND;
use crate::node::NODE_SEQUENTIAL;
use crate::node::NODE_SHARED_FOLDER_OPEN;
use crate::oplock;
use crate::oplock::OplockKind;
use crate::protocol::*;
use crate::resolve;
use crate::search;
use crate::search::SearchEntry;
use crate::search::SearchKind;
use crate::session::Session;
use crate::session::SessionKind;
use crate::share::ShareInfo;
use crate::share::ShareRegistry;
use crate::OpError;
use hostfs::HostFile;
use hostfs::SetAttributes;
use hostfs::SetTime;
use hostfs::Stat;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::SystemTime;

/// Operator configuration for the server.
#[derive(Debug, Clone)]
pub struct HgfsServerOptions {
    pub(crate) max_cached_open_nodes: usize,
    pub(crate) max_file_nodes_per_session: usize,
    pub(crate) max_searches_per_session: usize,
    pub(crate) always_use_host_time: bool,
    pub(crate) debug: bool,
}

impl HgfsServerOptions {
    /// Creates options with the default limits.
    pub fn new() -> Self {
        Self {
            max_cached_open_nodes: 256,
            max_file_nodes_per_session: 1 << 16,
            max_searches_per_session: 1024,
            always_use_host_time: false,
            debug: false,
        }
    }

    /// Sets the maximum number of host descriptors kept open per session.
    pub fn max_cached_open_nodes(mut self, max: usize) -> Self {
        self.max_cached_open_nodes = max;
        self
    }

    /// Sets the maximum number of file nodes per session.
    pub fn max_file_nodes_per_session(mut self, max: usize) -> Self {
        self.max_file_nodes_per_session = max;
        self
    }

    /// Sets the maximum number of concurrent searches per session.
    pub fn max_searches_per_session(mut self, max: usize) -> Self {
        self.max_searches_per_session = max;
        self
    }

    /// Forces reply time stamps to the host clock rather than any stored
    /// file time.
    pub fn always_use_host_time(mut self, always: bool) -> Self {
        self.always_use_host_time = always;
        self
    }

    /// Enables per-request logging.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for HgfsServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-session reply path supplied by the transport.
pub trait ReplySender: Send + Sync {
    /// Sends a reply packet for the session this sender is bound to.
    fn send(&self, packet: &[u8]) -> std::io::Result<()>;
}

/// The packet source supplied by the transport. Framing is the transport's
/// responsibility; packets are opaque byte arrays.
pub trait Transport: Send + Sync {
    /// Blocks until the next request packet arrives, returning the packet
    /// and the session it belongs to. An error ends the worker loop.
    fn receive(&self) -> std::io::Result<(Vec<u8>, Arc<Session>)>;
}

/// The HGFS server: a share registry plus the per-opcode handlers.
///
/// The server itself is stateless apart from the registry; all mutable
/// state lives in the sessions.
pub struct HgfsServer {
    registry: Arc<ShareRegistry>,
    options: HgfsServerOptions,
}

impl HgfsServer {
    pub fn new(registry: ShareRegistry, options: HgfsServerOptions) -> Self {
        Self {
            registry: Arc::new(registry),
            options,
        }
    }

    pub fn registry(&self) -> &ShareRegistry {
        &self.registry
    }

    /// Creates a new session bound to the given reply sender.
    pub fn create_session(&self, kind: SessionKind, sender: Arc<dyn ReplySender>) -> Arc<Session> {
        Session::new(kind, &self.options, sender)
    }

    /// Spawns a pool of worker threads, each processing one request at a
    /// time from the transport. Returns the thread handles; they exit when
    /// the transport reports an error from `receive`.
    pub fn run(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        workers: usize,
    ) -> std::io::Result<Vec<thread::JoinHandle<()>>> {
        (0..workers.max(1))
            .map(|i| {
                let server = Arc::clone(self);
                let transport = Arc::clone(&transport);
                thread::Builder::new()
                    .name(format!("hgfs-worker-{}", i))
                    .spawn(move || server.worker_loop(transport.as_ref()))
            })
            .collect()
    }

    fn worker_loop(&self, transport: &dyn Transport) {
        let mut response = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (packet, session) = match transport.receive() {
                Ok(received) => received,
                Err(error) => {
                    tracing::debug!(
                        error = &error as &dyn std::error::Error,
                        "transport closed"
                    );
                    break;
                }
            };

            if !session.is_open() {
                continue;
            }

            if let Some(size) = self.process_packet(&session, &packet, &mut response) {
                if let Err(error) = session.send_reply(&response[..size]) {
                    // Transport failure is the one session-fatal condition.
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to send reply; closing session"
                    );
                    session.shutdown();
                }
            }
        }
    }

    /// Processes one request packet, writing the reply into `response`.
    ///
    /// Returns the reply size, or `None` if the packet is too short to
    /// carry a request header (such packets are dropped, as there is no id
    /// to reply to).
    pub fn process_packet(
        &self,
        session: &Session,
        packet: &[u8],
        response: &mut [u8],
    ) -> Option<usize> {
        let mut reader = PacketReader::new(packet);
        let header = reader.request_header().ok()?;

        let mut writer = PacketWriter::new(response);
        let result = HgfsRequest::read(header.op, reader)
            .and_then(|request| self.dispatch(session, request, &mut writer));

        let status = match result {
            Ok(()) => Status::Success,
            Err(error) => {
                writer.reset();
                error.status()
            }
        };

        if self.options.debug {
            tracing::info!(op = header.op, id = header.id, ?status, "[hgfs] request");
        }

        writer.reply_header(header.op, header.id, status).ok()?;
        Some(writer.size())
    }

    // Route a request to the matching handler.
    fn dispatch(
        &self,
        session: &Session,
        request: HgfsRequest<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        match request {
            HgfsRequest::OpenRequest(m) => self.handle_open(session, OpenParams::v1(&m), writer),
            HgfsRequest::OpenV2Request(m) => {
                self.handle_open(session, OpenParams::v2(&m), writer)
            }
            HgfsRequest::ReadRequest(m) => self.handle_read(session, m, writer),
            HgfsRequest::WriteRequest(m) => self.handle_write(session, m, writer),
            HgfsRequest::CloseRequest(m) => self.handle_close(session, m),
            HgfsRequest::SearchOpenRequest(m) => self.handle_search_open(session, m, writer),
            HgfsRequest::SearchReadRequest(m) => {
                self.handle_search_read(session, m.handle, m.offset, false, writer)
            }
            HgfsRequest::SearchReadV2Request(m) => {
                self.handle_search_read(session, m.handle, m.offset, true, writer)
            }
            HgfsRequest::SearchCloseRequest(m) => self.handle_search_close(session, m),
            HgfsRequest::GetattrRequest(m) => self.handle_getattr(m, writer),
            HgfsRequest::GetattrV2Request(m) => self.handle_getattr_v2(session, m, writer),
            HgfsRequest::SetattrRequest(m) => self.handle_setattr(m),
            HgfsRequest::SetattrV2Request(m) => self.handle_setattr_v2(session, m),
            HgfsRequest::CreateDirRequest(m) => self.handle_create_dir(m),
            HgfsRequest::DeleteFileRequest(m) => self.handle_delete(m.name, 0),
            HgfsRequest::DeleteDirRequest(m) => self.handle_delete(m.name, hostfs::AT_REMOVEDIR),
            HgfsRequest::RenameRequest(m) => self.handle_rename(session, m),
            HgfsRequest::QueryVolumeRequest(m) => self.handle_query_volume(m, writer),
            HgfsRequest::CreateSymlinkRequest(m) => self.handle_create_symlink(m),
            HgfsRequest::ServerLockChangeRequest(m) => self.handle_server_lock_change(session, m),
            HgfsRequest::WriteStreamRequest(m) => self.handle_write_stream(session, m),
        }
    }

    fn handle_open(
        &self,
        session: &Session,
        params: OpenParams<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let access = match params.mode {
            OPEN_MODE_READ_ONLY => hostfs::O_RDONLY,
            OPEN_MODE_WRITE_ONLY => hostfs::O_WRONLY,
            OPEN_MODE_READ_WRITE => hostfs::O_RDWR,
            _ => return Err(OpError::Protocol),
        };

        let want_read = params.mode != OPEN_MODE_WRITE_ONLY;
        let want_write = params.mode != OPEN_MODE_READ_ONLY
            || params.flags & (OPEN_FLAG_CREATE | OPEN_FLAG_TRUNCATE) != 0;
        let resolved = resolve::resolve(
            &self.registry,
            params.name,
            want_read,
            want_write,
            params.case_flags == CASE_INSENSITIVE,
        )?;

        // The re-open flags for an evicted node carry the access mode only;
        // a transparent re-open must never create or truncate.
        let mut reopen_flags = access;
        if !resolved.share.follow_symlinks {
            reopen_flags |= hostfs::O_NOFOLLOW;
        }

        let mut open_flags = reopen_flags;
        if params.flags & OPEN_FLAG_CREATE != 0 {
            open_flags |= hostfs::O_CREAT;
            if params.flags & OPEN_FLAG_EXCLUSIVE != 0 {
                open_flags |= hostfs::O_EXCL;
            }
        }

        if params.flags & OPEN_FLAG_TRUNCATE != 0 {
            open_flags |= hostfs::O_TRUNC;
        }

        let file = resolved.share.volume.open(
            &resolved.path,
            open_flags,
            Some(hostfs::CreateOptions::new(params.perms)),
        )?;

        let stat = file.fstat()?;
        let local_id = LocalId {
            volume_id: stat.device_nr,
            file_id: stat.inode_nr,
        };

        let mut node_flags = 0;
        if params.flags & OPEN_FLAG_APPEND != 0 {
            node_flags |= NODE_APPEND;
        }
        if params.flags & OPEN_FLAG_SEQUENTIAL != 0 {
            node_flags |= NODE_SEQUENTIAL;
        }
        if resolved.path.as_os_str().is_empty() {
            node_flags |= NODE_SHARED_FOLDER_OPEN;
        }

        let mut nodes = session.nodes();
        // A lock is only worth requesting when the session is under its
        // locked-node budget and no other node holds one on the same file.
        let lock = if params.desired_lock != OplockKind::None
            && nodes.lock_allowed()
            && !nodes.file_has_lock(&local_id)
        {
            oplock::acquire(params.desired_lock)
        } else {
            OplockKind::None
        };

        let handle = nodes.insert(
            resolved.share,
            resolved.path,
            local_id,
            Arc::new(file),
            reopen_flags,
            params.mode,
            params.share_access,
            lock,
            node_flags,
        )?;
        drop(nodes);

        writer.u32(handle)?;
        if params.v2 {
            writer.u32(lock.to_wire())?;
        }

        Ok(())
    }

    fn handle_read(
        &self,
        session: &Session,
        message: ReadRequest<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let io = self.node_file(session, message.handle)?;
        if io.mode == OPEN_MODE_WRITE_ONLY {
            return Err(OpError::Host(hostfs::Error::EBADF));
        }

        let size = (message.size as usize).min(MAX_IO_SIZE);
        let start = size_of::<u32>();
        let buffer = writer.peek(start..start + size)?;
        let actual = io.file.pread(buffer, message.offset as i64)?;
        writer.u32(actual as u32)?;
        writer.next(actual)?;
        Ok(())
    }

    fn handle_write(
        &self,
        session: &Session,
        mut message: WriteRequest<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let append = session.nodes().get(message.handle)?.flags & NODE_APPEND != 0;

        // The file-IO lock makes the size probe and the write atomic with
        // respect to other appends on this session. It is taken before any
        // further node lookups, per the session lock order.
        let _io_guard = append.then(|| session.file_io());
        let io = self.node_file(session, message.handle)?;
        if io.mode == OPEN_MODE_READ_ONLY {
            return Err(OpError::Host(hostfs::Error::EBADF));
        }

        let size = (message.size as usize).min(MAX_IO_SIZE);
        let data = message.reader.read(size)?;
        let offset = if append {
            io.file.fstat()?.file_size as i64
        } else {
            message.offset as i64
        };

        let actual = io.file.pwrite(data, offset)?;
        writer.u32(actual as u32)?;
        Ok(())
    }

    fn handle_close(&self, session: &Session, message: CloseRequest<'_>) -> crate::Result<()> {
        // Dropping the node closes the descriptor once in-flight operations
        // release their references.
        session.nodes().remove(message.handle)?;
        Ok(())
    }

    fn handle_search_open(
        &self,
        session: &Session,
        message: SearchOpenRequest<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let (dir_path, share, kind, entries) = if message.name.is_empty() {
            // The virtual root enumerates the shares themselves.
            (
                PathBuf::new(),
                None,
                SearchKind::Base,
                search::capture_virtual(self.share_list_entries()),
            )
        } else {
            let resolved = resolve::resolve(&self.registry, message.name, true, false, false)?;
            let mut entries = Vec::new();
            for entry in resolved.share.volume.read_dir(&resolved.path)? {
                let name = entry.name.as_bytes();
                if name == b"." || name == b".." {
                    continue;
                }

                entries.push(SearchEntry {
                    inode_nr: entry.inode_nr,
                    file_type: entry.file_type,
                    name: name.to_vec(),
                });
            }

            (resolved.path, Some(resolved.share), SearchKind::Dir, entries)
        };

        let handle = session.searches().insert(dir_path, share, kind, entries)?;
        writer.u32(handle)?;
        Ok(())
    }

    /// Opens a virtual search over a caller-supplied entry sequence, for
    /// directories that exist only as protocol artifacts rather than on the
    /// host filesystem.
    ///
    /// The sequence is consumed once; the resulting snapshot is as stable
    /// as a real directory snapshot.
    pub fn open_virtual_search(
        &self,
        session: &Session,
        kind: SearchKind,
        entries: impl IntoIterator<Item = SearchEntry>,
    ) -> crate::Result<HgfsHandle> {
        let entries = search::capture_virtual(entries);
        session
            .searches()
            .insert(PathBuf::new(), None, kind, entries)
    }

    fn share_list_entries(&self) -> Vec<SearchEntry> {
        self.registry
            .iter()
            .map(|share| SearchEntry {
                inode_nr: share.volume.lstat("").map(|s| s.inode_nr).unwrap_or(0),
                file_type: hostfs::DT_DIR,
                name: share.name.as_bytes().to_vec(),
            })
            .collect()
    }

    fn handle_search_read(
        &self,
        session: &Session,
        handle: HgfsHandle,
        offset: u32,
        v2: bool,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        // Copy the entry out so the search lock is not held during the stat.
        let entry = {
            let searches = session.searches();
            let search = searches.get(handle)?;
            search
                .entries
                .get(offset as usize)
                .cloned()
                .map(|entry| (entry, search.kind, search.share.clone(), search.dir_path.clone()))
        };

        match entry {
            None => {
                // End of the enumeration: an empty name with no attributes.
                if v2 {
                    writer.attr_v2(&AttrV2::default())?;
                } else {
                    writer.attr_v1(&AttrV1::default())?;
                }

                writer.cp_name(b"")?;
            }
            Some((entry, kind, share, dir_path)) => {
                let attr = self.entry_attr(&entry, kind, share.as_deref(), &dir_path);
                if v2 {
                    writer.attr_v2(&attr)?;
                } else {
                    writer.attr_v1(&attr_v1_of(&attr))?;
                }

                writer.cp_name(&entry.name)?;
            }
        }

        Ok(())
    }

    // Retrieves attributes for one captured entry at read time. An entry
    // that vanished since the snapshot keeps its name and reports an empty
    // attribute mask.
    fn entry_attr(
        &self,
        entry: &SearchEntry,
        kind: SearchKind,
        share: Option<&ShareInfo>,
        dir_path: &Path,
    ) -> AttrV2 {
        let stat = match kind {
            SearchKind::Dir => share.and_then(|share| {
                let name = OsStr::from_bytes(&entry.name);
                share.volume.lstat(dir_path.join(name)).ok()
            }),
            SearchKind::Base => std::str::from_utf8(&entry.name)
                .ok()
                .and_then(|name| self.registry.get(name))
                .and_then(|share| share.volume.lstat("").ok()),
            SearchKind::Other => None,
        };

        match stat {
            Some(stat) => self.attr_from_stat(&stat),
            None => AttrV2::default(),
        }
    }

    fn handle_search_close(
        &self,
        session: &Session,
        message: SearchCloseRequest<'_>,
    ) -> crate::Result<()> {
        session.searches().remove(message.handle)?;
        Ok(())
    }

    fn handle_getattr(
        &self,
        message: GetattrRequest<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let resolved = resolve::resolve(&self.registry, message.name, true, false, false)?;
        let stat = resolved.share.volume.lstat(&resolved.path)?;
        writer.attr_v1(&attr_v1_of(&self.attr_from_stat(&stat)))?;
        Ok(())
    }

    fn handle_getattr_v2(
        &self,
        session: &Session,
        message: GetattrV2Request<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let (attr, target) = if message.hints & HINT_USE_HANDLE != 0 {
            // By handle; an open descriptor can't be a symlink.
            let io = self.node_file(session, message.handle)?;
            (self.attr_from_stat(&io.file.fstat()?), Vec::new())
        } else {
            let resolved = resolve::resolve(
                &self.registry,
                message.name,
                true,
                false,
                message.case_flags == CASE_INSENSITIVE,
            )?;
            let stat = resolved.share.volume.lstat(&resolved.path)?;
            let target = if hostfs::s_islnk(stat.mode) {
                let target = resolved.share.volume.read_link(&resolved.path)?;
                path_to_cp(target.as_bytes())
            } else {
                Vec::new()
            };

            (self.attr_from_stat(&stat), target)
        };

        writer.attr_v2(&attr)?;
        writer.cp_name(&target)?;
        Ok(())
    }

    fn handle_setattr(&self, message: SetattrRequest<'_>) -> crate::Result<()> {
        let mut attr = SetAttributes::default();
        if message.update & SETATTR_SIZE != 0 {
            attr.size = Some(message.attr.size as i64);
        }

        if message.update & SETATTR_PERMS != 0 {
            attr.mode = Some((message.attr.owner_perms as u32) << 6);
        }

        if message.update & SETATTR_ACCESS_TIME != 0 {
            attr.atime = self.requested_time(message.attr.access_time);
        }

        if message.update & SETATTR_WRITE_TIME != 0 {
            attr.mtime = self.requested_time(message.attr.write_time);
        }

        let resolved = resolve::resolve(&self.registry, message.name, false, true, false)?;
        resolved.share.volume.set_attr(&resolved.path, attr)?;
        Ok(())
    }

    fn handle_setattr_v2(
        &self,
        session: &Session,
        message: SetattrV2Request<'_>,
    ) -> crate::Result<()> {
        let requested = &message.attr;
        let mut attr = SetAttributes::default();
        if requested.mask & ATTR_VALID_SIZE != 0 {
            attr.size = Some(requested.size as i64);
        }

        let perm_bits = ATTR_VALID_SPECIAL_PERMS
            | ATTR_VALID_OWNER_PERMS
            | ATTR_VALID_GROUP_PERMS
            | ATTR_VALID_OTHER_PERMS;
        if requested.mask & perm_bits != 0 {
            attr.mode = Some(
                ((requested.special_perms as u32) << 9)
                    | ((requested.owner_perms as u32) << 6)
                    | ((requested.group_perms as u32) << 3)
                    | requested.other_perms as u32,
            );
        }

        if requested.mask & ATTR_VALID_USER_ID != 0 {
            attr.uid = Some(requested.user_id);
        }

        if requested.mask & ATTR_VALID_GROUP_ID != 0 {
            attr.gid = Some(requested.group_id);
        }

        if requested.mask & ATTR_VALID_ACCESS_TIME != 0 {
            attr.atime = self.requested_time(requested.access_time);
        }

        if requested.mask & ATTR_VALID_WRITE_TIME != 0 {
            attr.mtime = self.requested_time(requested.write_time);
        }

        if message.hints & HINT_USE_HANDLE != 0 {
            let io = self.node_file(session, message.handle)?;
            io.file.set_attr(attr)?;
        } else {
            let resolved = resolve::resolve(
                &self.registry,
                message.name,
                false,
                true,
                message.case_flags == CASE_INSENSITIVE,
            )?;
            resolved.share.volume.set_attr(&resolved.path, attr)?;
        }

        Ok(())
    }

    fn handle_create_dir(&self, message: CreateDirRequest<'_>) -> crate::Result<()> {
        let resolved = resolve::resolve(&self.registry, message.name, false, true, false)?;
        resolved.share.volume.mkdir(
            &resolved.path,
            hostfs::CreateOptions::new((message.perms as u32) << 6),
        )?;
        Ok(())
    }

    fn handle_delete(&self, name: &[u8], flags: i32) -> crate::Result<()> {
        let resolved = resolve::resolve(&self.registry, name, false, true, false)?;
        resolved.share.volume.unlink(&resolved.path, flags)?;
        Ok(())
    }

    fn handle_rename(&self, session: &Session, message: RenameRequest<'_>) -> crate::Result<()> {
        let old = resolve::resolve(&self.registry, message.old_name, false, true, false)?;
        let new = resolve::resolve(&self.registry, message.new_name, false, true, false)?;
        old.share
            .volume
            .rename(&old.path, &new.share.volume, &new.path)?;

        // Renaming an open file is permitted; every node that referenced
        // the old name now refers to the new one.
        session
            .nodes()
            .update_paths(&old.share.name, &old.path, &new.share, &new.path);
        Ok(())
    }

    fn handle_query_volume(
        &self,
        message: QueryVolumeRequest<'_>,
        writer: &mut PacketWriter<'_>,
    ) -> crate::Result<()> {
        let resolved = resolve::resolve(&self.registry, message.name, true, false, false)?;
        let stat_fs = resolved.share.volume.stat_fs(&resolved.path)?;
        let free = stat_fs.available_block_count.saturating_mul(stat_fs.block_size);
        let total = stat_fs.block_count.saturating_mul(stat_fs.block_size);
        writer.u64(free)?;
        writer.u64(total)?;
        Ok(())
    }

    fn handle_create_symlink(&self, message: CreateSymlinkRequest<'_>) -> crate::Result<()> {
        let resolved = resolve::resolve(&self.registry, message.name, false, true, false)?;

        // The target is link content, not a name to resolve; it is stored
        // as given. Following it later is subject to the escape check.
        let target = cp_to_path(message.target);
        resolved
            .share
            .volume
            .symlink(&resolved.path, Path::new(&target))?;
        Ok(())
    }

    fn handle_server_lock_change(
        &self,
        session: &Session,
        message: ServerLockChangeRequest<'_>,
    ) -> crate::Result<()> {
        let desired = OplockKind::from_wire(message.lock);
        let nodes = session.nodes();
        let node = nodes.get(message.handle)?;
        tracing::debug!(
            handle = node.handle,
            ?desired,
            "server lock change not supported"
        );
        Err(OpError::Unsupported)
    }

    fn handle_write_stream(
        &self,
        session: &Session,
        message: WriteStreamRequest<'_>,
    ) -> crate::Result<()> {
        // Alternate data streams do not exist on this host.
        session.nodes().get(message.handle)?;
        Err(OpError::Unsupported)
    }

    // Returns the descriptor for a handle, transparently re-opening an
    // evicted node from its stored name and mode. A cached node is moved to
    // the MRU end of the cache; a re-opened node stays off the cached list.
    fn node_file(&self, session: &Session, handle: HgfsHandle) -> crate::Result<NodeIo> {
        let (share, path, reopen_flags) = {
            let mut nodes = session.nodes();
            let node = nodes.get(handle)?;
            if let Some(file) = &node.file {
                let io = NodeIo {
                    file: Arc::clone(file),
                    mode: node.mode,
                };
                nodes.touch(handle);
                return Ok(io);
            }

            (Arc::clone(&node.share), node.path.clone(), node.reopen_flags)
        };

        // Re-open outside the table lock; host IO must not block other
        // handle operations.
        tracing::trace!(handle, path = %path.display(), "re-opening evicted node");
        let file = Arc::new(share.volume.open(&path, reopen_flags, None)?);
        let mut nodes = session.nodes();
        nodes.restore_file(handle, Arc::clone(&file))?;
        let node = nodes.get(handle)?;
        Ok(NodeIo {
            file: Arc::clone(node.file.as_ref().ok_or(OpError::HandleGone)?),
            mode: node.mode,
        })
    }

    // Builds the full attribute record from a host stat.
    fn attr_from_stat(&self, stat: &Stat) -> AttrV2 {
        let file_type = if hostfs::s_isdir(stat.mode) {
            FILE_TYPE_DIRECTORY
        } else if hostfs::s_islnk(stat.mode) {
            FILE_TYPE_SYMLINK
        } else {
            FILE_TYPE_REGULAR
        };

        let (access, write, change) = if self.options.always_use_host_time {
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_nanos() as u64;
            (now, now, now)
        } else {
            (
                stat.access_time.to_nanos(),
                stat.write_time.to_nanos(),
                stat.change_time.to_nanos(),
            )
        };

        AttrV2 {
            mask: ATTR_VALID_TYPE
                | ATTR_VALID_SIZE
                | ATTR_VALID_ACCESS_TIME
                | ATTR_VALID_WRITE_TIME
                | ATTR_VALID_CHANGE_TIME
                | ATTR_VALID_SPECIAL_PERMS
                | ATTR_VALID_OWNER_PERMS
                | ATTR_VALID_GROUP_PERMS
                | ATTR_VALID_OTHER_PERMS
                | ATTR_VALID_USER_ID
                | ATTR_VALID_GROUP_ID
                | ATTR_VALID_FILE_ID,
            file_type,
            size: stat.file_size,
            creation_time: write,
            access_time: access,
            write_time: write,
            change_time: change,
            special_perms: ((stat.mode >> 9) & 0o7) as u8,
            owner_perms: ((stat.mode >> 6) & 0o7) as u8,
            group_perms: ((stat.mode >> 3) & 0o7) as u8,
            other_perms: (stat.mode & 0o7) as u8,
            user_id: stat.uid,
            group_id: stat.gid,
            host_file_id: stat.inode_nr,
            volume_id: stat.device_nr as u32,
        }
    }

    fn requested_time(&self, nanos: u64) -> SetTime {
        if self.options.always_use_host_time {
            SetTime::Now
        } else {
            SetTime::Set(Duration::from_nanos(nanos))
        }
    }
}

// The descriptor and node properties an IO operation needs, copied out of
// the table so the lock is not held across host IO.
struct NodeIo {
    file: Arc<HostFile>,
    mode: u32,
}

// Unified open parameters for the V1 and V2 requests.
struct OpenParams<'a> {
    mode: u32,
    flags: u32,
    perms: u32,
    case_flags: u32,
    desired_lock: OplockKind,
    share_access: u32,
    name: &'a [u8],
    v2: bool,
}

impl<'a> OpenParams<'a> {
    fn v1(message: &OpenRequest<'a>) -> Self {
        Self {
            mode: message.mode,
            flags: message.flags,
            perms: (message.perms as u32) << 6,
            case_flags: CASE_SENSITIVE,
            desired_lock: OplockKind::None,
            share_access: 0,
            name: message.name,
            v2: false,
        }
    }

    fn v2(message: &OpenV2Request<'a>) -> Self {
        Self {
            mode: message.mode,
            flags: message.flags,
            perms: ((message.special_perms as u32) << 9)
                | ((message.owner_perms as u32) << 6)
                | ((message.group_perms as u32) << 3)
                | message.other_perms as u32,
            case_flags: message.case_flags,
            desired_lock: OplockKind::from_wire(message.desired_lock),
            share_access: message.share_access,
            name: message.name,
            v2: true,
        }
    }
}

// Derives the fixed V1 record from the full attribute record.
fn attr_v1_of(attr: &AttrV2) -> AttrV1 {
    AttrV1 {
        file_type: attr.file_type,
        size: attr.size,
        creation_time: attr.creation_time,
        access_time: attr.access_time,
        write_time: attr.write_time,
        change_time: attr.change_time,
        owner_perms: attr.owner_perms,
    }
}

// Converts a host path to CP form for a reply.
fn path_to_cp(path: &[u8]) -> Vec<u8> {
    path.iter()
        .map(|&b| if b == b'/' { cpname::SEPARATOR } else { b })
        .collect()
}

// Converts a CP name to a host path, reversing the guest escape form.
fn cp_to_path(cp: &[u8]) -> OsString {
    let mut bytes: Vec<u8> = cp
        .iter()
        .map(|&b| if b == cpname::SEPARATOR { b'/' } else { b })
        .collect();
    let len = cpname::unescape_in_place(&mut bytes, cpname::ESCAPE_BYTE);
    bytes.truncate(len);
    OsString::from_vec(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::ShareConfig;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct NullSender;

    impl ReplySender for NullSender {
        fn send(&self, _packet: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct TestEnv {
        root: TempDir,
        server: HgfsServer,
        session: Arc<Session>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self::with_options(HgfsServerOptions::new(), |c| {
                c.write_access(true).follow_symlinks(true)
            })
        }

        fn with_options(
            options: HgfsServerOptions,
            config: impl FnOnce(ShareConfig) -> ShareConfig,
        ) -> Self {
            let root = TempDir::new().unwrap();
            let share_root = root.path().join("docs");
            fs::create_dir(&share_root).unwrap();
            let registry =
                ShareRegistry::new([config(ShareConfig::new("docs", &share_root))]).unwrap();
            let server = HgfsServer::new(registry, options);
            let session = server.create_session(SessionKind::Regular, Arc::new(NullSender));
            Self {
                root,
                server,
                session,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.path().join("docs").join(name)
        }

        fn call(&self, packet: &[u8]) -> (Status, Vec<u8>) {
            let mut response = vec![0u8; MAX_PACKET_SIZE];
            let size = self
                .server
                .process_packet(&self.session, packet, &mut response)
                .unwrap();
            let mut reader = PacketReader::new(&response[..size]);
            let header = reader.reply_header().unwrap();
            (header.status, response[REPLY_HEADER_SIZE..size].to_vec())
        }

        fn open(&self, name: &[u8], mode: u32, flags: u32) -> HgfsHandle {
            let (status, payload) = self.call(&request(OP_OPEN, |w| {
                w.u32(mode).unwrap();
                w.u32(flags).unwrap();
                w.u8(0o6).unwrap();
                w.cp_name(name).unwrap();
            }));
            assert_eq!(status, Status::Success);
            u32_of(&payload)
        }

        fn read(&self, handle: HgfsHandle, offset: u64, size: u32) -> (Status, Vec<u8>) {
            let (status, payload) = self.call(&request(OP_READ, |w| {
                w.u32(handle).unwrap();
                w.u64(offset).unwrap();
                w.u32(size).unwrap();
            }));
            if status != Status::Success {
                return (status, Vec::new());
            }

            let len = u32_of(&payload) as usize;
            (status, payload[4..4 + len].to_vec())
        }

        fn search_read(&self, handle: HgfsHandle, offset: u32) -> (AttrV1, Vec<u8>) {
            let (status, payload) = self.call(&request(OP_SEARCH_READ, |w| {
                w.u32(handle).unwrap();
                w.u32(offset).unwrap();
            }));
            assert_eq!(status, Status::Success);
            let mut reader = PacketReader::new(&payload);
            let attr = reader.attr_v1().unwrap();
            let name = reader.cp_name().unwrap().to_vec();
            (attr, name)
        }
    }

    fn request(op: u32, build: impl FnOnce(&mut PacketWriter<'_>)) -> Vec<u8> {
        let mut packet = vec![0u8; MAX_PACKET_SIZE];
        let mut writer = PacketWriter::new_request(&mut packet);
        build(&mut writer);
        writer.request_header(op, 1).unwrap();
        let size = writer.size();
        packet.truncate(size);
        packet
    }

    fn name_request(op: u32, name: &[u8]) -> Vec<u8> {
        request(op, |w| w.cp_name(name).unwrap())
    }

    fn u32_of(payload: &[u8]) -> u32 {
        u32::from_le_bytes(payload[..4].try_into().unwrap())
    }

    #[test]
    fn open_read_close_round_trip() {
        let env = TestEnv::new();
        fs::write(env.path("hello.txt"), "HELLO").unwrap();

        let handle = env.open(b"docs\0hello.txt", OPEN_MODE_READ_ONLY, 0);
        let (status, data) = env.read(handle, 0, 16);
        assert_eq!(status, Status::Success);
        assert_eq!(data, b"HELLO");

        let (status, _) = env.call(&request(OP_CLOSE, |w| w.u32(handle).unwrap()));
        assert_eq!(status, Status::Success);

        // The handle is dead; the generation check rejects it.
        let (status, _) = env.read(handle, 0, 16);
        assert_eq!(status, Status::InvalidHandle);

        // Closing twice is an error, not idempotent success.
        let (status, _) = env.call(&request(OP_CLOSE, |w| w.u32(handle).unwrap()));
        assert_eq!(status, Status::InvalidHandle);
    }

    #[test]
    fn symlink_escape_rejected() {
        let env = TestEnv::new();
        fs::create_dir(env.root.path().join("secret")).unwrap();
        fs::write(env.root.path().join("secret/passwd"), "root:x").unwrap();
        symlink(env.root.path().join("secret"), env.path("out")).unwrap();

        let (status, _) = env.call(&name_request(OP_GETATTR, b"docs\0out\0passwd"));
        assert_eq!(status, Status::AccessDenied);

        let (status, _) = env.call(&request(OP_OPEN, |w| {
            w.u32(OPEN_MODE_READ_ONLY).unwrap();
            w.u32(0).unwrap();
            w.u8(0).unwrap();
            w.cp_name(b"docs\0out\0passwd").unwrap();
        }));
        assert_eq!(status, Status::AccessDenied);
    }

    #[test]
    fn cache_eviction_with_transparent_reopen() {
        let env = TestEnv::with_options(
            HgfsServerOptions::new().max_cached_open_nodes(2),
            |c| c.write_access(true),
        );
        for name in ["a", "b", "c"] {
            fs::write(env.path(name), name).unwrap();
        }

        let a = env.open(b"docs\0a", OPEN_MODE_READ_ONLY, 0);
        let b = env.open(b"docs\0b", OPEN_MODE_READ_ONLY, 0);
        let c = env.open(b"docs\0c", OPEN_MODE_READ_ONLY, 0);

        // Opening C evicted A: descriptor closed, name retained.
        {
            let nodes = env.session.nodes();
            assert!(nodes.get(a).unwrap().file.is_none());
            assert_eq!(nodes.cached_handles(), [b, c]);
        }

        // Operations on A still succeed through a transparent re-open; the
        // re-opened node stays off the cached list.
        let (status, data) = env.read(a, 0, 16);
        assert_eq!(status, Status::Success);
        assert_eq!(data, b"a");
        {
            let nodes = env.session.nodes();
            assert!(nodes.get(a).unwrap().file.is_some());
            assert_eq!(nodes.cached_handles(), [b, c]);
        }

        // Accessing B moves it to the MRU end.
        let (status, _) = env.read(b, 0, 16);
        assert_eq!(status, Status::Success);
        assert_eq!(env.session.nodes().cached_handles(), [c, b]);
    }

    #[test]
    fn search_snapshot_stability() {
        let env = TestEnv::new();
        for name in ["a", "b", "c"] {
            fs::write(env.path(name), "x").unwrap();
        }

        let (status, payload) = env.call(&name_request(OP_SEARCH_OPEN, b"docs"));
        assert_eq!(status, Status::Success);
        let handle = u32_of(&payload);

        let mut names = Vec::new();
        for offset in 0..3 {
            let (attr, name) = env.search_read(handle, offset);
            assert_eq!(attr.file_type, FILE_TYPE_REGULAR);
            names.push(String::from_utf8(name).unwrap());
        }

        names.sort();
        assert_eq!(names, ["a", "b", "c"]);

        // The same index returns the same entry on every call.
        let (_, first) = env.search_read(handle, 0);
        let (_, again) = env.search_read(handle, 0);
        assert_eq!(first, again);

        // A file created after search-open is not observed.
        fs::write(env.path("d"), "x").unwrap();
        let (attr, name) = env.search_read(handle, 3);
        assert!(name.is_empty());
        assert_eq!(attr, AttrV1::default());

        let (status, _) = env.call(&request(OP_SEARCH_CLOSE, |w| w.u32(handle).unwrap()));
        assert_eq!(status, Status::Success);
        let (status, _) = env.call(&request(OP_SEARCH_READ, |w| {
            w.u32(handle).unwrap();
            w.u32(0).unwrap();
        }));
        assert_eq!(status, Status::InvalidHandle);
    }

    #[test]
    fn append_write_ignores_offset() {
        let env = TestEnv::new();
        fs::write(env.path("f"), "0123456789").unwrap();

        let handle = env.open(b"docs\0f", OPEN_MODE_WRITE_ONLY, OPEN_FLAG_APPEND);
        let (status, payload) = env.call(&request(OP_WRITE, |w| {
            w.u32(handle).unwrap();
            w.u64(0).unwrap();
            w.u32(3).unwrap();
            w.u8(0).unwrap();
            w.write(b"XYZ").unwrap();
        }));
        assert_eq!(status, Status::Success);
        assert_eq!(u32_of(&payload), 3);
        assert_eq!(fs::read(env.path("f")).unwrap(), b"0123456789XYZ");
    }

    #[test]
    fn create_exclusive_of_existing_file() {
        let env = TestEnv::new();
        fs::write(env.path("f"), "x").unwrap();

        let (status, _) = env.call(&request(OP_OPEN, |w| {
            w.u32(OPEN_MODE_WRITE_ONLY).unwrap();
            w.u32(OPEN_FLAG_CREATE | OPEN_FLAG_EXCLUSIVE).unwrap();
            w.u8(0o6).unwrap();
            w.cp_name(b"docs\0f").unwrap();
        }));
        assert_eq!(status, Status::FileExists);
    }

    #[test]
    fn delete_of_open_file_keeps_descriptor() {
        let env = TestEnv::new();
        fs::write(env.path("f"), "DATA").unwrap();
        let handle = env.open(b"docs\0f", OPEN_MODE_READ_ONLY, 0);

        let (status, _) = env.call(&name_request(OP_DELETE_FILE, b"docs\0f"));
        assert_eq!(status, Status::Success);
        assert!(!env.path("f").exists());

        // The descriptor remains usable by its handle until closed.
        let (status, data) = env.read(handle, 0, 16);
        assert_eq!(status, Status::Success);
        assert_eq!(data, b"DATA");
    }

    #[test]
    fn delete_nonempty_dir() {
        let env = TestEnv::new();
        let (status, _) = env.call(&request(OP_CREATE_DIR, |w| {
            w.u8(0o7).unwrap();
            w.cp_name(b"docs\0dir").unwrap();
        }));
        assert_eq!(status, Status::Success);
        fs::write(env.path("dir/inner"), "x").unwrap();

        let (status, _) = env.call(&name_request(OP_DELETE_DIR, b"docs\0dir"));
        assert_eq!(status, Status::DirNotEmpty);

        fs::remove_file(env.path("dir/inner")).unwrap();
        let (status, _) = env.call(&name_request(OP_DELETE_DIR, b"docs\0dir"));
        assert_eq!(status, Status::Success);
    }

    #[test]
    fn rename_updates_open_nodes() {
        let env = TestEnv::new();
        fs::write(env.path("old"), "content").unwrap();
        let handle = env.open(b"docs\0old", OPEN_MODE_READ_ONLY, 0);

        let (status, _) = env.call(&request(OP_RENAME, |w| {
            w.cp_name(b"docs\0old").unwrap();
            w.cp_name(b"docs\0new").unwrap();
        }));
        assert_eq!(status, Status::Success);
        assert_eq!(
            env.session.nodes().get(handle).unwrap().path,
            PathBuf::from("new")
        );

        // Attribute queries by handle see the renamed file.
        let (status, payload) = env.call(&request(OP_GETATTR_V2, |w| {
            w.u32(HINT_USE_HANDLE).unwrap();
            w.u32(handle).unwrap();
            w.u32(CASE_SENSITIVE).unwrap();
            w.cp_name(b"").unwrap();
        }));
        assert_eq!(status, Status::Success);
        let mut reader = PacketReader::new(&payload);
        let attr = reader.attr_v2().unwrap();
        assert_eq!(attr.size, 7);
    }

    #[test]
    fn getattr_v2_symlink_target() {
        let env = TestEnv::new();
        fs::write(env.path("hello.txt"), "HELLO").unwrap();
        symlink("hello.txt", env.path("link")).unwrap();

        let (status, payload) = env.call(&request(OP_GETATTR_V2, |w| {
            w.u32(0).unwrap();
            w.u32(0).unwrap();
            w.u32(CASE_SENSITIVE).unwrap();
            w.cp_name(b"docs\0link").unwrap();
        }));
        assert_eq!(status, Status::Success);
        let mut reader = PacketReader::new(&payload);
        let attr = reader.attr_v2().unwrap();
        assert_eq!(attr.file_type, FILE_TYPE_SYMLINK);
        assert_eq!(reader.cp_name().unwrap(), b"hello.txt");
    }

    #[test]
    fn setattr_truncates() {
        let env = TestEnv::new();
        fs::write(env.path("f"), "hello world").unwrap();

        let mut attr = AttrV1::default();
        attr.size = 5;
        let (status, _) = env.call(&request(OP_SETATTR, |w| {
            w.u8(SETATTR_SIZE).unwrap();
            w.attr_v1(&attr).unwrap();
            w.cp_name(b"docs\0f").unwrap();
        }));
        assert_eq!(status, Status::Success);
        assert_eq!(fs::read(env.path("f")).unwrap(), b"hello");
    }

    #[test]
    fn query_volume() {
        let env = TestEnv::new();
        let (status, payload) = env.call(&name_request(OP_QUERY_VOLUME, b"docs"));
        assert_eq!(status, Status::Success);
        let mut reader = PacketReader::new(&payload);
        let free = reader.u64().unwrap();
        let total = reader.u64().unwrap();
        assert_ne!(total, 0);
        assert!(free <= total);
    }

    #[test]
    fn base_search_lists_shares() {
        let env = TestEnv::new();
        let (status, payload) = env.call(&name_request(OP_SEARCH_OPEN, b""));
        assert_eq!(status, Status::Success);
        let handle = u32_of(&payload);

        let (attr, name) = env.search_read(handle, 0);
        assert_eq!(name, b"docs");
        assert_eq!(attr.file_type, FILE_TYPE_DIRECTORY);

        let (_, name) = env.search_read(handle, 1);
        assert!(name.is_empty());
    }

    #[test]
    fn create_symlink() {
        let env = TestEnv::new();
        fs::write(env.path("target"), "x").unwrap();
        let (status, _) = env.call(&request(OP_CREATE_SYMLINK, |w| {
            w.cp_name(b"docs\0link").unwrap();
            w.cp_name(b"target").unwrap();
        }));
        assert_eq!(status, Status::Success);
        assert_eq!(
            fs::read_link(env.path("link")).unwrap(),
            PathBuf::from("target")
        );
    }

    #[test]
    fn lock_change_and_stream_write_unsupported() {
        let env = TestEnv::new();
        fs::write(env.path("f"), "x").unwrap();
        let handle = env.open(b"docs\0f", OPEN_MODE_READ_ONLY, 0);

        let (status, _) = env.call(&request(OP_SERVER_LOCK_CHANGE, |w| {
            w.u32(handle).unwrap();
            w.u32(LOCK_EXCLUSIVE).unwrap();
        }));
        assert_eq!(status, Status::OperationNotSupported);

        let (status, _) = env.call(&request(OP_WRITE_STREAM, |w| {
            w.u32(handle).unwrap();
            w.u32(0).unwrap();
        }));
        assert_eq!(status, Status::OperationNotSupported);

        // An invalid handle is reported as such before the unsupported
        // operation.
        let (status, _) = env.call(&request(OP_SERVER_LOCK_CHANGE, |w| {
            w.u32(0xdead_beef).unwrap();
            w.u32(LOCK_SHARED).unwrap();
        }));
        assert_eq!(status, Status::InvalidHandle);
    }

    #[test]
    fn malformed_packets() {
        let env = TestEnv::new();

        // Too short for a header: dropped.
        let mut response = vec![0u8; MAX_PACKET_SIZE];
        assert!(env
            .server
            .process_packet(&env.session, &[1, 2, 3], &mut response)
            .is_none());

        // A truncated payload yields a protocol error reply.
        let (status, _) = env.call(&request(OP_OPEN, |w| w.u32(OPEN_MODE_READ_ONLY).unwrap()));
        assert_eq!(status, Status::ProtocolError);

        // An unknown opcode as well.
        let (status, _) = env.call(&request(999, |_| ()));
        assert_eq!(status, Status::ProtocolError);
    }

    #[test]
    fn virtual_search() {
        let env = TestEnv::new();
        let handle = env
            .server
            .open_virtual_search(
                &env.session,
                SearchKind::Other,
                (0..2).map(|i| SearchEntry {
                    inode_nr: 0,
                    file_type: hostfs::DT_REG,
                    name: format!("virtual{}", i).into_bytes(),
                }),
            )
            .unwrap();

        // Virtual entries carry their name and an empty attribute mask.
        let (attr, name) = env.search_read(handle, 0);
        assert_eq!(name, b"virtual0");
        assert_eq!(attr, AttrV1::default());

        let (_, name) = env.search_read(handle, 2);
        assert!(name.is_empty());

        let (status, _) = env.call(&request(OP_SEARCH_CLOSE, |w| w.u32(handle).unwrap()));
        assert_eq!(status, Status::Success);
    }

    #[test]
    fn unknown_share() {
        let env = TestEnv::new();
        let (status, _) = env.call(&name_request(OP_GETATTR, b"nope\0f"));
        assert_eq!(status, Status::NoSuchFileOrDir);
    }
}
