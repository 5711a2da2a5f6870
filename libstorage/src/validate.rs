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

//! Structural checks applied to each GPT copy on its own.

use crate::{
    gpt::{GptEntries, GptHeader, GPT_ENTRY_SIZE, GPT_HEADER_SIZE, GPT_MAGIC, GPT_REVISION},
    BlockInfo, GPT_HEADER_SECTORS, GPT_PMBR_SECTORS, MIN_SECTOR_SIZE,
};
use liberror::{GptError, Result};

/// Identifies one of the two on-disk copies of the GPT.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GptCopy {
    /// Header at LBA 1, entries following it.
    Primary,
    /// Header at the last LBA, entries preceding it.
    Secondary,
}

/// Whether a structurally valid copy describes the disk it was read from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Geometry {
    /// The copy's location fields match the disk.
    Current,
    /// The copy is intact but its backup location does not match the disk's size, e.g. because
    /// the disk was resized.
    Stale,
}

/// Validation result of one GPT copy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopyState {
    /// Header and entries passed every check.
    Valid(Geometry),
    /// The copy failed a check.
    Invalid(GptError),
}

impl CopyState {
    /// Returns whether the copy can be used as a repair reference.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Limits applied when validating a header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GptConfig {
    /// Maximum number of entries in the entry array.
    pub max_entries: u32,
    /// Minimum number of entries in the entry array.
    pub min_entries: u32,
    /// Maximum size of a single entry in bytes.
    pub max_entry_size: u32,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self { max_entries: 128, min_entries: 16, max_entry_size: 512 }
    }
}

fn check_sector_size(block_size: u64) -> core::result::Result<(), GptError> {
    match block_size >= MIN_SECTOR_SIZE && block_size.is_power_of_two() {
        true => Ok(()),
        _ => Err(GptError::InvalidSectorSize(block_size)),
    }
}

/// Number of sectors holding `bytes` bytes. `block_size` has been checked to be non-zero.
fn sectors(bytes: u64, block_size: u64) -> u64 {
    bytes.div_ceil(block_size)
}

/// Checks that the disk can hold a GPT at all.
///
/// The sector size must be a power of two of at least 512 bytes, and the disk must fit the
/// protective MBR, both headers and two entry arrays of `config.min_entries` entries.
pub fn check_parameters(info: BlockInfo, config: &GptConfig) -> Result<()> {
    check_sector_size(info.block_size)?;
    let entries_bytes = u64::from(config.min_entries) * GPT_ENTRY_SIZE as u64;
    let min = GPT_PMBR_SECTORS + 2 * (GPT_HEADER_SECTORS + sectors(entries_bytes, info.block_size));
    match info.num_blocks < min {
        true => Err(GptError::DiskTooSmall { sectors: info.num_blocks, min }.into()),
        _ => Ok(()),
    }
}

/// Checks a GPT header read from the location of `copy`.
///
/// Returns whether the header's backup location matches the disk. Nothing here compares the
/// header with the other copy.
pub fn check_header(
    header: &GptHeader,
    copy: GptCopy,
    info: BlockInfo,
    config: &GptConfig,
) -> core::result::Result<Geometry, GptError> {
    check_sector_size(info.block_size)?;
    if header.magic != GPT_MAGIC {
        return Err(GptError::IncorrectMagic(header.magic));
    }
    if header.revision != GPT_REVISION {
        return Err(GptError::UnsupportedRevision(header.revision));
    }
    if header.size as usize != GPT_HEADER_SIZE {
        return Err(GptError::UnexpectedHeaderSize { actual: header.size, expect: GPT_HEADER_SIZE });
    }
    // The CRC is only meaningful once the size is known to be ours.
    if header.compute_crc() != header.crc32 {
        return Err(GptError::IncorrectHeaderCrc);
    }
    if header.reserved0 != 0 {
        return Err(GptError::NonZeroReserved(header.reserved0));
    }

    let entries_size = header.entries_size;
    if (entries_size as usize) < GPT_ENTRY_SIZE
        || entries_size % 8 != 0
        || entries_size > config.max_entry_size
    {
        return Err(GptError::UnexpectedEntrySize {
            actual: entries_size,
            max: config.max_entry_size,
        });
    }
    let entries_count = header.entries_count;
    if entries_count < config.min_entries || entries_count > config.max_entries {
        return Err(GptError::NumberOfEntriesOverflow {
            entries: entries_count,
            allowed: (config.min_entries, config.max_entries),
        });
    }

    // Both factors are bounded by the config, so the product fits in u64.
    let entries_sectors =
        sectors(u64::from(entries_count) * u64::from(entries_size), info.block_size);
    let last_lba = info.num_blocks.saturating_sub(GPT_HEADER_SECTORS);
    let (current, entries, first, last) =
        (header.current, header.entries, header.first, header.last);

    let my_lba = match copy {
        GptCopy::Primary => GPT_PMBR_SECTORS,
        GptCopy::Secondary => last_lba,
    };
    if current != my_lba {
        return Err(GptError::InvalidHeaderLocation { value: current, expect: my_lba });
    }

    match copy {
        GptCopy::Primary => {
            let min = GPT_PMBR_SECTORS + GPT_HEADER_SECTORS;
            let max = first.saturating_sub(entries_sectors);
            if entries < min || entries > max {
                return Err(GptError::InvalidEntriesLocation {
                    value: entries,
                    expect_range: (min, max),
                });
            }
        }
        GptCopy::Secondary => {
            let expect = my_lba.saturating_sub(entries_sectors);
            if entries != expect {
                return Err(GptError::InvalidEntriesLocation {
                    value: entries,
                    expect_range: (expect, expect),
                });
            }
        }
    }

    // Usable blocks must sit between the primary entry array and the secondary entry array.
    let usable_min = GPT_PMBR_SECTORS + GPT_HEADER_SECTORS + entries_sectors;
    let usable_max = info
        .num_blocks
        .checked_sub(GPT_HEADER_SECTORS + entries_sectors + 1)
        .ok_or(GptError::DiskTooSmall { sectors: info.num_blocks, min: usable_min })?;
    if first > last || first < usable_min || last > usable_max {
        return Err(GptError::InvalidFirstLastUsableBlock {
            first,
            last,
            range: (usable_min, usable_max),
        });
    }

    let backup = header.backup;
    let expect_backup = match copy {
        GptCopy::Primary => last_lba,
        GptCopy::Secondary => GPT_PMBR_SECTORS,
    };
    Ok(match backup == expect_backup {
        true => Geometry::Current,
        _ => Geometry::Stale,
    })
}

/// Checks an entry array against the header it was read with.
///
/// Verifies the array CRC, then that every used entry lies within the usable range, that no two
/// used entries overlap and that unique GUIDs are distinct.
pub fn check_entries(
    entries: &GptEntries,
    header: &GptHeader,
) -> core::result::Result<(), GptError> {
    if entries.crc32() != header.entries_crc {
        return Err(GptError::IncorrectEntriesCrc);
    }
    let (first, last) = (header.first, header.last);
    for (idx, entry) in entries.iter().enumerate() {
        if entry.is_unused() {
            continue;
        }
        let (start, end) = (entry.first, entry.last);
        if start < first || end > last || end < start {
            return Err(GptError::InvalidPartitionRange {
                idx,
                part_range: (start, end),
                usable_range: (first, last),
            });
        }
        for (other, e) in entries.iter().enumerate().skip(idx + 1) {
            if e.is_unused() {
                continue;
            }
            if start <= e.last && e.first <= end {
                return Err(GptError::PartitionOverlap { idx, other });
            }
            if entry.guid == e.guid {
                return Err(GptError::DuplicateUniqueGuid { idx, other });
            }
        }
    }
    Ok(())
}

/// Returns whether two headers agree on every field that is not location specific.
pub fn header_fields_same(h1: &GptHeader, h2: &GptHeader) -> bool {
    // Copy out of the packed structs before comparing.
    let a = (h1.magic, h1.revision, h1.size, h1.reserved0, h1.first, h1.last, h1.guid);
    let b = (h2.magic, h2.revision, h2.size, h2.reserved0, h2.first, h2.last, h2.guid);
    let a_entries = (h1.entries_count, h1.entries_size, h1.entries_crc);
    let b_entries = (h2.entries_count, h2.entries_size, h2.entries_crc);
    a == b && a_entries == b_entries
}
