// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Priority ordered kernel selection with per attempt bookkeeping.

use crate::attributes::{KernelAttributes, KernelEntries};
use alloc::vec::Vec;
use liberror::{Error, Result};
use vboot_storage::GptData;

/// State of a [KernelSelector].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SelectState {
    /// No candidate list has been built yet.
    Init,
    /// Ready to offer the next candidate.
    Scanning,
    /// The kernel at the given entry index was offered and its outcome is awaited.
    CandidateOffered(usize),
    /// The kernel at the given entry index booted successfully.
    Done(usize),
    /// Every candidate failed or none existed.
    Exhausted,
}

/// `KernelSelector` walks the kernel partitions of a GPT in boot order.
///
/// The order is computed once, on the first call to [KernelSelector::next_candidate()]: kernel
/// partitions that are bootable, by descending priority, ties broken by ascending entry index.
/// Attribute changes made while the selector runs do not reorder it.
#[derive(Debug, Clone)]
pub struct KernelSelector {
    state: SelectState,
    order: Vec<usize>,
    next: usize,
}

impl Default for KernelSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelSelector {
    /// Creates a selector in [SelectState::Init].
    pub fn new() -> Self {
        Self { state: SelectState::Init, order: Vec::new(), next: 0 }
    }

    /// Returns the current state.
    pub fn state(&self) -> SelectState {
        self.state
    }

    /// Returns the candidate order. Empty until the first candidate is requested.
    pub fn candidates(&self) -> &[usize] {
        &self.order[..]
    }

    fn scan(&mut self, gpt: &GptData) {
        let mut eligible = gpt
            .kernel_entries()
            .into_iter()
            .filter(|v| v.attributes.is_bootable())
            .collect::<Vec<_>>();
        // Stable sort keeps ascending index order among equal priorities.
        eligible.sort_by(|a, b| b.attributes.priority.cmp(&a.attributes.priority));
        self.order = eligible.into_iter().map(|v| v.index).collect();
        self.next = 0;
        self.state = SelectState::Scanning;
    }

    /// Offers the next candidate.
    ///
    /// Returns `Ok(None)` and enters [SelectState::Exhausted] when no candidate is left. Returns
    /// [Error::InvalidState] while an outcome is awaited or after a successful boot.
    pub fn next_candidate(&mut self, gpt: &mut GptData) -> Result<Option<usize>> {
        match self.state {
            SelectState::Init => self.scan(gpt),
            SelectState::Scanning => {}
            SelectState::Exhausted => return Ok(None),
            SelectState::CandidateOffered(_) | SelectState::Done(_) => {
                return Err(Error::InvalidState)
            }
        }
        match self.order.get(self.next) {
            Some(&idx) => {
                self.next += 1;
                self.state = SelectState::CandidateOffered(idx);
                gpt.set_current_kernel(Some(idx));
                Ok(Some(idx))
            }
            _ => {
                self.state = SelectState::Exhausted;
                gpt.set_current_kernel(None);
                Ok(None)
            }
        }
    }

    fn offered(&self) -> Result<usize> {
        match self.state {
            SelectState::CandidateOffered(idx) => Ok(idx),
            _ => Err(Error::InvalidState),
        }
    }

    fn update<F>(gpt: &mut GptData, idx: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut KernelAttributes),
    {
        let flags = gpt.entry(idx).ok_or(Error::BadIndex(idx))?.flags;
        let mut attrs = KernelAttributes::decode(flags);
        f(&mut attrs);
        gpt.set_entry_flags(idx, attrs.encode(flags)?)
    }

    /// Records that the offered kernel booted.
    ///
    /// Sets its successful flag and clears the flag on every other kernel partition. Tries are
    /// left unchanged. No further candidates are offered afterwards.
    pub fn report_success(&mut self, gpt: &mut GptData) -> Result<()> {
        let idx = self.offered()?;
        for entry in gpt.kernel_entries() {
            Self::update(gpt, entry.index, |v| v.successful = entry.index == idx)?;
        }
        self.state = SelectState::Done(idx);
        Ok(())
    }

    /// Records that the offered kernel failed to verify or boot.
    ///
    /// Consumes one try unless the partition has booted successfully before, then moves on to the
    /// next candidate.
    pub fn report_failure(&mut self, gpt: &mut GptData) -> Result<()> {
        let idx = self.offered()?;
        Self::update(gpt, idx, |v| {
            if !v.successful {
                v.tries = v.tries.saturating_sub(1);
            }
        })?;
        self.state = SelectState::Scanning;
        gpt.set_current_kernel(None);
        Ok(())
    }

    /// Moves on to the next candidate without changing the offered kernel's attributes.
    pub fn skip(&mut self, gpt: &mut GptData) -> Result<()> {
        self.offered()?;
        self.state = SelectState::Scanning;
        gpt.set_current_kernel(None);
        Ok(())
    }
}
