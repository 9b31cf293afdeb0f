// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity arena of process control blocks.
//!
//! Processes are named by [`ProcessId`], which packs a slot index with a
//! generation drawn from one table-wide counter. Every load and every restart
//! takes the next generation, so ids held from before go stale instead of
//! silently naming someone else.

use abi::{Generation, ProcessId, ShortId};

use crate::ident::{AppId, ShortIdSet};
use crate::process::Process;

pub struct ProcessTable<'f, const N: usize> {
    slots: [Option<Process<'f>>; N],
    generation: Generation,
}

impl<const N: usize> Default for ProcessTable<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'f, const N: usize> ProcessTable<'f, N> {
    pub fn new() -> Self {
        // Indices must fit in the id's index field.
        debug_assert!(N <= ProcessId::MAX_PROCESSES);
        Self {
            slots: core::array::from_fn(|_| None),
            generation: Generation::ZERO,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_index(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Takes the next generation and returns the id it gives slot `index`.
    pub(crate) fn fresh_id(&mut self, index: usize) -> ProcessId {
        self.generation = self.generation.next();
        ProcessId::for_index_and_gen(index, self.generation)
    }

    /// Puts a process built by `make` into a free slot. `None` if the table
    /// is full.
    pub(crate) fn insert_with(
        &mut self,
        make: impl FnOnce(ProcessId) -> Process<'f>,
    ) -> Option<ProcessId> {
        let index = self.free_index()?;
        let id = self.fresh_id(index);
        self.slots[index] = Some(make(id));
        Some(id)
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process<'f>> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|p| p.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: ProcessId) -> Option<&mut Process<'f>> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|p| p.id() == id)
    }

    pub fn by_index(&self, index: usize) -> Option<&Process<'f>> {
        self.slots.get(index)?.as_ref()
    }

    pub(crate) fn by_index_mut(
        &mut self,
        index: usize,
    ) -> Option<&mut Process<'f>> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Empties the slot `id` names. The caller decides whether that's
    /// allowed.
    pub(crate) fn remove(&mut self, id: ProcessId) -> Option<Process<'f>> {
        self.get(id)?;
        self.slots[id.index()].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process<'f>> + '_ {
        self.slots.iter().flatten()
    }

    /// Checks whether an image starting at flash address `base` is already
    /// loaded.
    pub fn owns_flash(&self, base: u32) -> bool {
        self.iter().any(|p| p.flash().base() == base)
    }

    pub fn find_app_id(&self, app_id: &AppId) -> Option<ProcessId> {
        self.iter()
            .find(|p| &p.identity().app_id == app_id)
            .map(|p| p.id())
    }

    pub fn find_short_id(&self, short_id: ShortId) -> Option<ProcessId> {
        self.iter()
            .find(|p| p.identity().short_id == short_id)
            .map(|p| p.id())
    }
}

/// Every occupied slot holds its short id, Terminated or not, until it is
/// reclaimed.
impl<const N: usize> ShortIdSet for ProcessTable<'_, N> {
    fn contains(&self, id: ShortId) -> bool {
        self.find_short_id(id).is_some()
    }

    fn len(&self) -> usize {
        ProcessTable::len(self)
    }
}
