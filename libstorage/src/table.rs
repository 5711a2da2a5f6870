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

use crate::{
    gpt::{decode_entries, decode_header, encode_header, GptEntries, GptEntry, GptHeader},
    read_blocks_vec,
    validate::{check_entries, check_header, check_parameters, CopyState, GptConfig, GptCopy},
    write_blocks_padded, BlockInfo, BlockIo, GPT_HEADER_SECTORS, GPT_PMBR_SECTORS,
};
use liberror::{Error, GptError, Result};

/// Primary header needs to be written back.
pub const GPT_MODIFIED_HEADER1: u8 = 0x01;
/// Secondary header needs to be written back.
pub const GPT_MODIFIED_HEADER2: u8 = 0x02;
/// Primary entry array needs to be written back.
pub const GPT_MODIFIED_ENTRIES1: u8 = 0x04;
/// Secondary entry array needs to be written back.
pub const GPT_MODIFIED_ENTRIES2: u8 = 0x08;

/// One copy of the GPT as loaded from disk.
#[derive(Debug, Clone)]
pub(crate) struct CopyData {
    pub(crate) header: GptHeader,
    /// Empty if the header did not pass validation.
    pub(crate) entries: GptEntries,
    pub(crate) state: CopyState,
}

/// `GptData` holds both copies of a disk's GPT for the duration of one boot session.
///
/// It is created by [GptData::load()], brought to a consistent state by [GptData::repair()],
/// mutated through [GptData::set_entry_flags()] and persisted with [GptData::write_back()].
#[derive(Debug, Clone)]
pub struct GptData {
    pub(crate) info: BlockInfo,
    pub(crate) config: GptConfig,
    pub(crate) primary: CopyData,
    pub(crate) secondary: CopyData,
    pub(crate) modified: u8,
    current_kernel: Option<usize>,
}

/// Reads and validates the copy of the GPT at the location of `copy`.
///
/// Structural problems are recorded in the returned state. Only disk errors are returned as
/// `Err`.
fn load_copy<T: BlockIo + ?Sized>(
    io: &mut T,
    copy: GptCopy,
    info: BlockInfo,
    config: &GptConfig,
) -> Result<CopyData> {
    let lba = match copy {
        GptCopy::Primary => GPT_PMBR_SECTORS,
        GptCopy::Secondary => info.last_block()?,
    };
    let header = decode_header(&read_blocks_vec(io, lba, GPT_HEADER_SECTORS)?)?;
    let invalid = |e: GptError| -> Result<CopyData> {
        Ok(CopyData { header, entries: Default::default(), state: CopyState::Invalid(e) })
    };
    let geometry = match check_header(&header, copy, info, config) {
        Ok(v) => v,
        Err(e) => return invalid(e),
    };
    let bytes = read_blocks_vec(io, header.entries, header.entries_blocks(info.block_size)?)?;
    let entries = match decode_entries(&bytes, header.entries_count, header.entries_size) {
        Ok(v) => v,
        Err(Error::GptError(e)) => return invalid(e),
        Err(e) => return Err(e),
    };
    let state = match check_entries(&entries, &header) {
        Ok(()) => CopyState::Valid(geometry),
        Err(e) => CopyState::Invalid(e),
    };
    Ok(CopyData { header, entries, state })
}

impl GptData {
    /// Reads and validates both copies of the GPT.
    ///
    /// Returns an error if the drive parameters cannot hold a GPT or if a read fails. A copy that
    /// fails validation is not an error; its state is reported by [GptData::state()].
    pub fn load<T: BlockIo + ?Sized>(io: &mut T, config: GptConfig) -> Result<Self> {
        let info = io.info();
        check_parameters(info, &config)?;
        let primary = load_copy(io, GptCopy::Primary, info, &config)?;
        let secondary = load_copy(io, GptCopy::Secondary, info, &config)?;
        Ok(Self { info, config, primary, secondary, modified: 0, current_kernel: None })
    }

    pub(crate) fn copy(&self, copy: GptCopy) -> &CopyData {
        match copy {
            GptCopy::Primary => &self.primary,
            GptCopy::Secondary => &self.secondary,
        }
    }

    /// Returns the header of `copy` as currently held in memory.
    pub fn header(&self, copy: GptCopy) -> &GptHeader {
        &self.copy(copy).header
    }

    /// Returns the entry array of `copy`. The array is empty if the copy's header was invalid.
    pub fn entries(&self, copy: GptCopy) -> &GptEntries {
        &self.copy(copy).entries
    }

    /// Returns the validation state of `copy`.
    pub fn state(&self, copy: GptCopy) -> CopyState {
        self.copy(copy).state
    }

    /// Returns the bitmask of regions that need to be written back.
    pub fn modified(&self) -> u8 {
        self.modified
    }

    /// Returns the geometry of the disk the table was loaded from.
    pub fn block_info(&self) -> BlockInfo {
        self.info
    }

    /// Returns the limits the table was validated with.
    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Returns the `idx`th entry of the primary array.
    pub fn entry(&self, idx: usize) -> Option<GptEntry> {
        self.primary.entries.get(idx)
    }

    /// Returns the index of the kernel entry currently offered or booted.
    pub fn current_kernel(&self) -> Option<usize> {
        self.current_kernel
    }

    /// Sets the index of the kernel entry currently offered or booted.
    pub fn set_current_kernel(&mut self, idx: Option<usize>) {
        self.current_kernel = idx;
    }

    /// Overwrites the attribute flags of entry `idx`.
    ///
    /// The change is made to the primary copy, whose CRCs are recomputed, and the secondary copy
    /// is regenerated from it. All four regions are flagged for write back. Both copies must be
    /// valid, i.e. [GptData::repair()] must have succeeded.
    pub fn set_entry_flags(&mut self, idx: usize, flags: u64) -> Result<()> {
        if !self.primary.state.is_valid() || !self.secondary.state.is_valid() {
            return Err(Error::InvalidState);
        }
        if self.primary.entries.get(idx).map(|v| v.flags) == Some(flags) {
            return Ok(());
        }
        self.primary.entries.set_flags(idx, flags)?;
        self.primary.header.entries_crc = self.primary.entries.crc32();
        self.primary.header.update_crc();
        self.modified |= GPT_MODIFIED_HEADER1 | GPT_MODIFIED_ENTRIES1;
        self.regenerate_secondary()
    }

    /// Writes every region flagged as modified to `io`.
    ///
    /// Regions are written in the order primary entries, primary header, secondary entries,
    /// secondary header. A region that fails to write stays flagged and the remaining regions are
    /// still attempted. Returns the first error encountered.
    pub fn write_back<T: BlockIo + ?Sized>(&mut self, io: &mut T) -> Result<()> {
        let mut res = Ok(());
        for (mask, copy, is_header) in [
            (GPT_MODIFIED_ENTRIES1, GptCopy::Primary, false),
            (GPT_MODIFIED_HEADER1, GptCopy::Primary, true),
            (GPT_MODIFIED_ENTRIES2, GptCopy::Secondary, false),
            (GPT_MODIFIED_HEADER2, GptCopy::Secondary, true),
        ] {
            if self.modified & mask == 0 {
                continue;
            }
            let data = self.copy(copy);
            let written = match is_header {
                true => write_blocks_padded(io, data.header.current, &encode_header(&data.header)),
                _ => write_blocks_padded(io, data.header.entries, data.entries.as_bytes()),
            };
            match written {
                Ok(()) => self.modified &= !mask,
                Err(e) => res = res.and(Err(e)),
            }
        }
        res
    }

    /// Gets the unusable reason of `copy` if it is invalid.
    pub fn invalid_reason(&self, copy: GptCopy) -> Option<GptError> {
        match self.state(copy) {
            CopyState::Invalid(e) => Some(e),
            _ => None,
        }
    }
}
