// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Session lifecycle and per-session locking.
//!
//! A session is created when the transport accepts a new connection (or
//! statically at startup for internal use) and is shared, reference
//! counted, between the dispatcher and the transport. Three independent
//! mutexes guard the file-IO serialization, the node array and the search
//! array. When more than one is needed the acquisition order is:
//! file-IO lock, then node-array lock, then search-array lock. The lock
//! methods below are the only way to take them; callers must follow that
//! order.

use crate::node::NodeTable;
use crate::search::SearchTable;
use crate::server::HgfsServerOptions;
use crate::server::ReplySender;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Whether a session was created dynamically by the transport or
/// statically by the host itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionKind {
    Regular,
    Internal,
}

/// A per-connection context owning the handle tables and locks.
pub struct Session {
    kind: SessionKind,
    open: AtomicBool,
    sender: Arc<dyn ReplySender>,
    // Serializes multi-step file IO on a handle (e.g. append writes).
    file_io: Mutex<()>,
    nodes: Mutex<NodeTable>,
    searches: Mutex<SearchTable>,
}

impl Session {
    pub(crate) fn new(
        kind: SessionKind,
        options: &HgfsServerOptions,
        sender: Arc<dyn ReplySender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            open: AtomicBool::new(true),
            sender,
            file_io: Mutex::new(()),
            nodes: Mutex::new(NodeTable::new(
                options.max_file_nodes_per_session,
                options.max_cached_open_nodes,
            )),
            searches: Mutex::new(SearchTable::new(options.max_searches_per_session)),
        })
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Indicates whether the session is still open. Closed sessions accept
    /// no further requests.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the session closed and destroys every still-open file node and
    /// search, closing their descriptors.
    ///
    /// Outstanding requests holding descriptor references complete against
    /// those descriptors; the handles themselves are dead afterwards.
    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("session shutdown");
            self.nodes.lock().clear();
            self.searches.lock().clear();
        }
    }

    /// Sends a reply through the transport's per-session send callback.
    pub fn send_reply(&self, packet: &[u8]) -> std::io::Result<()> {
        self.sender.send(packet)
    }

    /// Takes the file-IO serialization lock. Must be acquired before the
    /// node or search locks.
    pub(crate) fn file_io(&self) -> MutexGuard<'_, ()> {
        self.file_io.lock()
    }

    /// Takes the node-array lock. Must not be held while acquiring the
    /// file-IO lock.
    pub(crate) fn nodes(&self) -> MutexGuard<'_, NodeTable> {
        self.nodes.lock()
    }

    /// Takes the search-array lock. Must be acquired last.
    pub(crate) fn searches(&self) -> MutexGuard<'_, SearchTable> {
        self.searches.lock()
    }
}
