// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-session directory search state.
//!
//! A search handle owns a snapshot of directory entries captured once at
//! search-open. The snapshot is never refreshed; the guest observes a
//! stable enumeration even if the host directory changes underneath.
//! Searches may also enumerate virtual directories, such as the set of
//! shares, from any caller-supplied entry sequence.

use crate::node::handle_generation;
use crate::node::handle_index;
use crate::node::pack_handle;
use crate::node::HgfsHandle;
use crate::share::ShareInfo;
use crate::OpError;
use std::path::PathBuf;
use std::sync::Arc;

/// What a search enumerates. This determines how entry attributes are
/// retrieved during search-read.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SearchKind {
    /// Files and subdirectories of a real host directory.
    Dir,
    /// The set of shares.
    Base,
    /// Other virtual contents supplied by the embedder.
    Other,
}

/// One captured directory entry, with the name stored ready to be packed
/// into a search-read reply.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub inode_nr: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// An active directory search.
#[derive(Debug)]
pub struct Search {
    pub handle: HgfsHandle,
    /// The share-relative directory path. Empty for virtual searches.
    pub dir_path: PathBuf,
    /// The share being enumerated, absent for virtual searches.
    pub share: Option<Arc<ShareInfo>>,
    pub kind: SearchKind,
    /// The snapshot, fixed at search-open.
    pub entries: Vec<SearchEntry>,
}

struct SearchSlot {
    generation: u16,
    search: Option<Search>,
}

/// The per-session search array with its LIFO free list.
pub struct SearchTable {
    slots: Vec<SearchSlot>,
    free: Vec<u16>,
    max_searches: usize,
}

const INITIAL_SEARCHES: usize = 4;

impl SearchTable {
    pub fn new(max_searches: usize) -> Self {
        let max_searches = max_searches.min(u16::MAX as usize + 1);
        let mut table = Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_searches,
        };

        table.grow(INITIAL_SEARCHES.min(max_searches));
        table
    }

    fn grow(&mut self, target: usize) {
        let start = self.slots.len();
        for _ in start..target {
            self.slots.push(SearchSlot {
                generation: 1,
                search: None,
            });
        }

        for index in (start..target).rev() {
            self.free.push(index as u16);
        }
    }

    /// Stores a new search snapshot and returns its handle.
    pub fn insert(
        &mut self,
        dir_path: PathBuf,
        share: Option<Arc<ShareInfo>>,
        kind: SearchKind,
        entries: Vec<SearchEntry>,
    ) -> crate::Result<HgfsHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.max_searches {
                    return Err(OpError::Host(hostfs::Error::EMFILE));
                }

                self.grow((self.slots.len() * 2).min(self.max_searches));
                self.free.pop().ok_or(OpError::Host(hostfs::Error::EMFILE))?
            }
        };

        let handle = pack_handle(index, self.slots[index as usize].generation);
        self.slots[index as usize].search = Some(Search {
            handle,
            dir_path,
            share,
            kind,
            entries,
        });

        Ok(handle)
    }

    /// Looks up a search, failing with `HandleGone` for unallocated or
    /// stale handles.
    pub fn get(&self, handle: HgfsHandle) -> crate::Result<&Search> {
        let slot = self
            .slots
            .get(handle_index(handle) as usize)
            .ok_or(OpError::HandleGone)?;
        if slot.generation != handle_generation(handle) {
            return Err(OpError::HandleGone);
        }

        slot.search.as_ref().ok_or(OpError::HandleGone)
    }

    /// Frees a search and bumps the slot generation.
    pub fn remove(&mut self, handle: HgfsHandle) -> crate::Result<Search> {
        self.get(handle)?;
        let index = handle_index(handle);
        let slot = &mut self.slots[index as usize];
        let search = slot.search.take().unwrap();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
        Ok(search)
    }

    /// Drops every search. Used at session shutdown.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.search.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1).max(1);
                self.free.push(index as u16);
            }
        }
    }
}

/// Builds search entries from an arbitrary entry sequence, for virtual
/// directories. The sequence is consumed once; the resulting snapshot is as
/// stable as a real directory snapshot.
pub fn capture_virtual(entries: impl IntoIterator<Item = SearchEntry>) -> Vec<SearchEntry> {
    entries.into_iter().collect()
}
