// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-session file-node table and open-file cache.
//!
//! Guests can hold far more open handles than the host can afford
//! descriptors for. Each session therefore keeps a flat array of node
//! slots with a LIFO free list, and a bounded LRU list of "cached" nodes
//! whose descriptors are kept open. When the cache is full the least
//! recently used descriptor is closed; the node keeps its name and is
//! transparently re-opened by the dispatcher on next use.
//!
//! Handles are 32-bit: the low bits index the slot, the high bits carry a
//! generation counter that is bumped every time a slot is freed, so a stale
//! handle to a reused slot is reliably rejected.

use crate::oplock;
use crate::oplock::OplockKind;
use crate::share::ShareInfo;
use crate::OpError;
use hostfs::HostFile;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

/// An opaque handle identifying an open file or an active search within a
/// session.
pub type HgfsHandle = u32;

const HANDLE_INDEX_BITS: u32 = 16;
const HANDLE_INDEX_MASK: u32 = (1 << HANDLE_INDEX_BITS) - 1;

// The initial slot count; the array doubles up to the configured maximum.
const INITIAL_NODES: usize = 8;

/// Packs a slot index and generation into a handle.
pub(crate) fn pack_handle(index: u16, generation: u16) -> HgfsHandle {
    ((generation as u32) << HANDLE_INDEX_BITS) | index as u32
}

pub(crate) fn handle_index(handle: HgfsHandle) -> u16 {
    (handle & HANDLE_INDEX_MASK) as u16
}

pub(crate) fn handle_generation(handle: HgfsHandle) -> u16 {
    (handle >> HANDLE_INDEX_BITS) as u16
}

// File node flags.
pub const NODE_APPEND: u32 = 1 << 0;
pub const NODE_SEQUENTIAL: u32 = 1 << 1;
pub const NODE_SHARED_FOLDER_OPEN: u32 = 1 << 2;

/// Identifier for a local file: the host volume and file IDs, used to
/// detect whether two names refer to the same host file.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct LocalId {
    pub volume_id: u64,
    pub file_id: u64,
}

/// Whether an in-use node's descriptor is on the cached-nodes list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeState {
    /// On the LRU list; the descriptor is open and subject to eviction.
    Cached,
    /// Not on the LRU list. The descriptor may be open (lock holders and
    /// re-opened nodes) or closed (evicted stubs awaiting re-open).
    NotCached,
}

/// A file on the host that has been opened by the guest.
#[derive(Debug)]
pub struct FileNode {
    pub handle: HgfsHandle,
    pub share: Arc<ShareInfo>,
    /// The share-relative path, updated in place when the file is renamed.
    pub path: PathBuf,
    pub local_id: LocalId,
    /// The open descriptor, shared with in-flight operations. `None` for an
    /// evicted node that has not been re-opened yet.
    pub file: Option<Arc<HostFile>>,
    /// Host flags to re-open the descriptor with; creation dispositions are
    /// stripped so a re-open never creates or truncates.
    pub reopen_flags: i32,
    /// The guest's requested access mode.
    pub mode: u32,
    /// The guest's requested share-access mode.
    #[allow(dead_code)]
    pub share_access: u32,
    pub lock: OplockKind,
    pub state: NodeState,
    pub flags: u32,
}

struct NodeSlot {
    generation: u16,
    node: Option<FileNode>,
}

/// The per-session node array with its free list and cached-node LRU list.
pub struct NodeTable {
    slots: Vec<NodeSlot>,
    // LIFO free list of slot indices, for cache affinity.
    free: Vec<u16>,
    // Cached-node handles in LRU order; front is evicted first.
    cached: Vec<u16>,
    locked_nodes: usize,
    max_nodes: usize,
    max_cached: usize,
}

impl NodeTable {
    pub fn new(max_nodes: usize, max_cached: usize) -> Self {
        let max_nodes = max_nodes.min(1 << HANDLE_INDEX_BITS);
        let mut table = Self {
            slots: Vec::new(),
            free: Vec::new(),
            cached: Vec::new(),
            locked_nodes: 0,
            max_nodes,
            max_cached,
        };

        table.grow(INITIAL_NODES.min(max_nodes));
        table
    }

    // Grows the slot array to `target`, pushing the new slots onto the free
    // list so that the lowest index is handed out first.
    fn grow(&mut self, target: usize) {
        let start = self.slots.len();
        for _ in start..target {
            self.slots.push(NodeSlot {
                generation: 1,
                node: None,
            });
        }

        for index in (start..target).rev() {
            self.free.push(index as u16);
        }
    }

    /// Inserts a newly opened file, placing it on the cached list and
    /// evicting the least recently used node if the cache is full.
    ///
    /// Returns the node's handle.
    pub fn insert(
        &mut self,
        share: Arc<ShareInfo>,
        path: PathBuf,
        local_id: LocalId,
        file: Arc<HostFile>,
        reopen_flags: i32,
        mode: u32,
        share_access: u32,
        lock: OplockKind,
        flags: u32,
    ) -> crate::Result<HgfsHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.max_nodes {
                    return Err(OpError::Host(hostfs::Error::EMFILE));
                }

                self.grow((self.slots.len() * 2).min(self.max_nodes));
                self.free.pop().ok_or(OpError::Host(hostfs::Error::EMFILE))?
            }
        };

        let handle = pack_handle(index, self.slots[index as usize].generation);
        // Lock holders are never placed on the cached list, so they can
        // never be evicted.
        let cache = lock == OplockKind::None && self.max_cached > 0;
        if lock != OplockKind::None {
            self.locked_nodes += 1;
        }

        self.slots[index as usize].node = Some(FileNode {
            handle,
            share,
            path,
            local_id,
            file: Some(file),
            reopen_flags,
            mode,
            share_access,
            lock,
            state: NodeState::NotCached,
            flags,
        });

        if cache {
            self.add_to_cache(index);
        }

        Ok(handle)
    }

    fn slot(&self, handle: HgfsHandle) -> crate::Result<&NodeSlot> {
        let slot = self
            .slots
            .get(handle_index(handle) as usize)
            .ok_or(OpError::HandleGone)?;
        if slot.generation != handle_generation(handle) || slot.node.is_none() {
            return Err(OpError::HandleGone);
        }

        Ok(slot)
    }

    /// Looks up a node, failing with `HandleGone` for unallocated or stale
    /// handles.
    pub fn get(&self, handle: HgfsHandle) -> crate::Result<&FileNode> {
        // The slot lookup validated that the node exists.
        Ok(self.slot(handle)?.node.as_ref().unwrap())
    }

    pub fn get_mut(&mut self, handle: HgfsHandle) -> crate::Result<&mut FileNode> {
        self.slot(handle)?;
        let index = handle_index(handle) as usize;
        Ok(self.slots[index].node.as_mut().unwrap())
    }

    /// Frees a node, closing its descriptor and bumping the slot generation
    /// so the handle cannot be reused.
    pub fn remove(&mut self, handle: HgfsHandle) -> crate::Result<FileNode> {
        self.slot(handle)?;
        let index = handle_index(handle);
        self.remove_from_cache(index);
        let slot = &mut self.slots[index as usize];
        let node = slot.node.take().unwrap();
        if node.lock != OplockKind::None {
            self.locked_nodes -= 1;
        }

        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
        Ok(node)
    }

    /// Records a use of the node: a cached node moves to the MRU end of the
    /// list, an uncached node is left alone.
    pub fn touch(&mut self, handle: HgfsHandle) {
        let index = handle_index(handle);
        if let Some(pos) = self.cached.iter().position(|&i| i == index) {
            self.cached.remove(pos);
            self.cached.push(index);
        }
    }

    // Adds a node to the MRU end of the cached list, evicting first if the
    // cache is full.
    fn add_to_cache(&mut self, index: u16) {
        while self.cached.len() >= self.max_cached && !self.cached.is_empty() {
            self.evict_lru();
        }

        self.cached.push(index);
        self.slots[index as usize].node.as_mut().unwrap().state = NodeState::Cached;
    }

    // Closes the descriptor of the least recently used cached node, leaving
    // a stub that keeps the name for transparent re-opening.
    fn evict_lru(&mut self) {
        let index = self.cached.remove(0);
        let node = self.slots[index as usize].node.as_mut().unwrap();
        tracing::trace!(handle = node.handle, path = %node.path.display(), "evicting cached node");
        node.file = None;
        node.state = NodeState::NotCached;
    }

    fn remove_from_cache(&mut self, index: u16) {
        if let Some(pos) = self.cached.iter().position(|&i| i == index) {
            self.cached.remove(pos);
            self.slots[index as usize].node.as_mut().unwrap().state = NodeState::NotCached;
        }
    }

    /// Installs a re-opened descriptor on an evicted node. The node stays
    /// off the cached list until it is closed.
    pub fn restore_file(&mut self, handle: HgfsHandle, file: Arc<HostFile>) -> crate::Result<()> {
        let node = self.get_mut(handle)?;
        debug_assert!(node.state == NodeState::NotCached);
        if node.file.is_none() {
            node.file = Some(file);
        }

        Ok(())
    }

    /// Updates the stored name of every node whose path exactly matches
    /// `old_path` within `share_name`, so that later queries through those
    /// handles see the renamed file.
    pub fn update_paths(
        &mut self,
        share_name: &str,
        old_path: &Path,
        new_share: &Arc<ShareInfo>,
        new_path: &Path,
    ) {
        for slot in &mut self.slots {
            if let Some(node) = &mut slot.node {
                if node.share.name == share_name && node.path == old_path {
                    node.share = Arc::clone(new_share);
                    node.path = new_path.to_path_buf();
                }
            }
        }
    }

    /// Closes every node. Used at session shutdown.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1).max(1);
                self.free.push(index as u16);
            }
        }

        self.cached.clear();
        self.locked_nodes = 0;
    }

    /// Checks whether a node is currently allowed to take a lock.
    pub fn lock_allowed(&self) -> bool {
        oplock::lock_allowed(self.locked_nodes)
    }

    /// Checks whether any node referring to the same host file already
    /// holds a lock.
    pub fn file_has_lock(&self, local_id: &LocalId) -> bool {
        self.slots.iter().any(|slot| {
            slot.node
                .as_ref()
                .is_some_and(|node| node.local_id == *local_id && node.lock != OplockKind::None)
        })
    }

    #[cfg(test)]
    pub(crate) fn cached_handles(&self) -> Vec<HgfsHandle> {
        self.cached
            .iter()
            .map(|&i| self.slots[i as usize].node.as_ref().unwrap().handle)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let in_use = self.slots.iter().filter(|s| s.node.is_some()).count();
        (in_use, self.cached.len(), self.free.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::ShareConfig;
    use crate::share::ShareRegistry;
    use hostfs::CreateOptions;
    use std::fs;
    use tempfile::TempDir;

    struct TestEnv {
        _root: TempDir,
        share: Arc<ShareInfo>,
    }

    impl TestEnv {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let registry = ShareRegistry::new([
                ShareConfig::new("docs", root.path()).write_access(true)
            ])
            .unwrap();
            let share = registry.get("docs").unwrap();
            Self { _root: root, share }
        }

        fn open(&self, name: &str) -> Arc<HostFile> {
            fs::write(self.share.root.join(name), "test").unwrap();
            Arc::new(
                self.share
                    .volume
                    .open(name, hostfs::O_RDONLY, None)
                    .unwrap(),
            )
        }

        fn insert(&self, table: &mut NodeTable, name: &str) -> HgfsHandle {
            table
                .insert(
                    Arc::clone(&self.share),
                    PathBuf::from(name),
                    LocalId::default(),
                    self.open(name),
                    hostfs::O_RDONLY,
                    crate::protocol::OPEN_MODE_READ_ONLY,
                    0,
                    OplockKind::None,
                    0,
                )
                .unwrap()
        }
    }

    #[test]
    fn stale_handle_rejected() {
        let env = TestEnv::new();
        let mut table = NodeTable::new(16, 4);
        let handle = env.insert(&mut table, "a");
        assert!(table.get(handle).is_ok());
        table.remove(handle).unwrap();
        assert!(matches!(table.get(handle).unwrap_err(), OpError::HandleGone));
        assert!(matches!(
            table.remove(handle).unwrap_err(),
            OpError::HandleGone
        ));

        // The slot is reused with a new generation; the old handle stays
        // dead.
        let handle2 = env.insert(&mut table, "b");
        assert_eq!(handle_index(handle2), handle_index(handle));
        assert_ne!(handle2, handle);
        assert!(matches!(table.get(handle).unwrap_err(), OpError::HandleGone));
        assert!(table.get(handle2).is_ok());
    }

    #[test]
    fn lru_eviction() {
        let env = TestEnv::new();
        let mut table = NodeTable::new(16, 2);
        let a = env.insert(&mut table, "a");
        let b = env.insert(&mut table, "b");
        let c = env.insert(&mut table, "c");

        // A was evicted: descriptor closed, name retained.
        let node_a = table.get(a).unwrap();
        assert!(node_a.file.is_none());
        assert_eq!(node_a.state, NodeState::NotCached);
        assert_eq!(node_a.path, PathBuf::from("a"));
        assert_eq!(table.cached_handles(), [b, c]);

        // Touching B moves it to the MRU end.
        table.touch(b);
        assert_eq!(table.cached_handles(), [c, b]);

        // Touching the uncached A changes nothing.
        table.touch(a);
        assert_eq!(table.cached_handles(), [c, b]);
    }

    #[test]
    fn state_partition() {
        let env = TestEnv::new();
        let mut table = NodeTable::new(16, 2);
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| env.insert(&mut table, n))
            .collect();

        // Slots partition into in-use and free; the cached list never
        // exceeds its cap.
        let (in_use, cached, free) = table.counts();
        assert_eq!(in_use, 4);
        assert_eq!(cached, 2);
        assert_eq!(in_use + free, 8);

        for &h in &handles {
            table.remove(h).unwrap();
        }

        let (in_use, cached, free) = table.counts();
        assert_eq!(in_use, 0);
        assert_eq!(cached, 0);
        assert_eq!(free, 8);
    }

    #[test]
    fn rename_updates_matching_nodes() {
        let env = TestEnv::new();
        let mut table = NodeTable::new(16, 4);
        let a1 = env.insert(&mut table, "a");
        // A second open of the same file gets its own node and descriptor.
        let a2 = table
            .insert(
                Arc::clone(&env.share),
                PathBuf::from("a"),
                LocalId::default(),
                Arc::new(env.share.volume.open("a", hostfs::O_RDONLY, None).unwrap()),
                hostfs::O_RDONLY,
                crate::protocol::OPEN_MODE_READ_ONLY,
                0,
                OplockKind::None,
                0,
            )
            .unwrap();
        let b = env.insert(&mut table, "b");
        assert_ne!(a1, a2);

        let share = Arc::clone(&env.share);
        table.update_paths("docs", Path::new("a"), &share, Path::new("renamed"));
        assert_eq!(table.get(a1).unwrap().path, PathBuf::from("renamed"));
        assert_eq!(table.get(a2).unwrap().path, PathBuf::from("renamed"));
        assert_eq!(table.get(b).unwrap().path, PathBuf::from("b"));
    }

    #[test]
    fn table_growth_and_cap() {
        let env = TestEnv::new();
        let mut table = NodeTable::new(12, 16);
        let handles: Vec<_> = (0..12)
            .map(|i| env.insert(&mut table, &format!("f{}", i)))
            .collect();

        fs::write(env.share.root.join("overflow"), "x").unwrap();
        let file = Arc::new(
            env.share
                .volume
                .open("overflow", hostfs::O_RDONLY, None)
                .unwrap(),
        );
        let err = table
            .insert(
                Arc::clone(&env.share),
                PathBuf::from("overflow"),
                LocalId::default(),
                file,
                hostfs::O_RDONLY,
                crate::protocol::OPEN_MODE_READ_ONLY,
                0,
                OplockKind::None,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, OpError::Host(e) if e.value() == hostfs::EMFILE));

        for h in handles {
            table.remove(h).unwrap();
        }
    }
}
