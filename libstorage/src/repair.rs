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

//! Restores a damaged GPT copy from the intact one.

use crate::{
    table::{
        CopyData, GptData, GPT_MODIFIED_ENTRIES1, GPT_MODIFIED_ENTRIES2, GPT_MODIFIED_HEADER1,
        GPT_MODIFIED_HEADER2,
    },
    validate::{header_fields_same, CopyState, Geometry},
    GPT_HEADER_SECTORS, GPT_PMBR_SECTORS,
};
use liberror::{Error, Result};

/// Summary of what [GptData::repair()] changed.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RepairReport {
    /// The primary copy was rebuilt from the secondary.
    pub primary_restored: bool,
    /// The secondary copy was rebuilt from the primary.
    pub secondary_restored: bool,
    /// Location fields were corrected to the disk's current size.
    pub geometry_fixed: bool,
}

impl RepairReport {
    /// Returns whether anything was changed.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl GptData {
    /// Brings both copies of the GPT to a valid, identical state.
    ///
    /// * Both valid: a stale backup location is corrected. If the copies disagree, the primary is
    ///   used as reference and the secondary is rebuilt.
    /// * One valid: the other copy is rebuilt from it with its own location fields and CRCs.
    /// * None valid: returns [Error::NoGpt] and changes nothing.
    ///
    /// Rebuilt regions are flagged for [GptData::write_back()].
    pub fn repair(&mut self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let (primary, secondary) = (self.primary.state, self.secondary.state);
        if !primary.is_valid() && !secondary.is_valid() {
            return Err(Error::NoGpt);
        }

        if primary == CopyState::Valid(Geometry::Stale) {
            self.fix_primary_geometry()?;
            report.geometry_fixed = true;
        }
        if secondary == CopyState::Valid(Geometry::Stale) {
            let header = &mut self.secondary.header;
            header.backup = GPT_PMBR_SECTORS;
            header.update_crc();
            self.secondary.state = CopyState::Valid(Geometry::Current);
            self.modified |= GPT_MODIFIED_HEADER2;
            report.geometry_fixed = true;
        }

        if !primary.is_valid() {
            self.regenerate_primary()?;
            report.primary_restored = true;
            return Ok(report);
        }
        let differs = !secondary.is_valid()
            || !header_fields_same(&self.primary.header, &self.secondary.header);
        // A corrected primary always gets a matching secondary.
        if differs || primary == CopyState::Valid(Geometry::Stale) {
            self.regenerate_secondary()?;
            report.secondary_restored = differs;
        }
        Ok(report)
    }

    /// Points the primary's backup location at the disk's last block. The usable range is
    /// extended to the new end only if it covered the whole disk before.
    fn fix_primary_geometry(&mut self) -> Result<()> {
        let last_lba = self.info.last_block()?;
        let header = &mut self.primary.header;
        let entries_blocks = header.entries_blocks(self.info.block_size)?;
        let (last, backup) = (header.last, header.backup);
        let reserved = GPT_HEADER_SECTORS + entries_blocks;
        if last.checked_add(reserved) == Some(backup) {
            let new_last =
                last_lba.checked_sub(reserved).ok_or(Error::ArithmeticOverflow)?;
            header.last = last.max(new_last);
        }
        header.backup = last_lba;
        header.update_crc();
        self.primary.state = CopyState::Valid(Geometry::Current);
        self.modified |= GPT_MODIFIED_HEADER1;
        Ok(())
    }

    /// Rebuilds the secondary copy from the primary.
    pub(crate) fn regenerate_secondary(&mut self) -> Result<()> {
        let mut header = self.primary.header;
        let last_lba = self.info.last_block()?;
        let entries_blocks = header.entries_blocks(self.info.block_size)?;
        header.current = last_lba;
        header.backup = GPT_PMBR_SECTORS;
        header.entries = last_lba.checked_sub(entries_blocks).ok_or(Error::ArithmeticOverflow)?;
        header.update_crc();
        self.secondary = CopyData {
            header,
            entries: self.primary.entries.clone(),
            state: CopyState::Valid(Geometry::Current),
        };
        self.modified |= GPT_MODIFIED_HEADER2 | GPT_MODIFIED_ENTRIES2;
        Ok(())
    }

    /// Rebuilds the primary copy from the secondary. The entry array is placed directly after the
    /// header.
    pub(crate) fn regenerate_primary(&mut self) -> Result<()> {
        let mut header = self.secondary.header;
        header.current = GPT_PMBR_SECTORS;
        header.backup = self.info.last_block()?;
        header.entries = GPT_PMBR_SECTORS + GPT_HEADER_SECTORS;
        header.update_crc();
        self.primary = CopyData {
            header,
            entries: self.secondary.entries.clone(),
            state: CopyState::Valid(Geometry::Current),
        };
        self.modified |= GPT_MODIFIED_HEADER1 | GPT_MODIFIED_ENTRIES1;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        gpt::GptEntry,
        testlib::{TestBlockIo, TestDiskBuilder},
        validate::{check_entries, check_header, GptConfig, GptCopy},
        BlockIo,
    };
    use uuid::Uuid;

    const TYPE: Uuid = Uuid::from_u128(0x0fc63daf_8483_4772_8e79_3d69d8477de4);

    fn builder() -> TestDiskBuilder {
        TestDiskBuilder::new()
            .add_partition("boot_a", TYPE, 16, 1 << 48)
            .add_partition("boot_b", TYPE, 16, 2 << 48)
    }

    fn load(io: &mut TestBlockIo) -> GptData {
        GptData::load(io, GptConfig::default()).unwrap()
    }

    fn header_block(io: &TestBlockIo, lba: u64) -> usize {
        usize::try_from(lba * io.block_size).unwrap()
    }

    /// Checks that both in-memory copies are valid and carry the same partitions.
    fn assert_consistent(gpt: &GptData) {
        let info = gpt.block_info();
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            let header = gpt.header(copy);
            assert_eq!(
                check_header(header, copy, info, gpt.config()),
                Ok(Geometry::Current),
                "{:?}",
                copy
            );
            assert_eq!(check_entries(gpt.entries(copy), header), Ok(()), "{:?}", copy);
        }
        assert!(header_fields_same(gpt.header(GptCopy::Primary), gpt.header(GptCopy::Secondary)));
        assert_eq!(gpt.entries(GptCopy::Primary), gpt.entries(GptCopy::Secondary));
    }

    #[test]
    fn test_repair_nothing_to_do() {
        let mut io = builder().build();
        let mut gpt = load(&mut io);
        assert!(gpt.repair().unwrap().is_empty());
        assert_eq!(gpt.modified(), 0);
    }

    #[test]
    fn test_repair_secondary_from_primary() {
        let mut io = builder().build();
        let last = io.info().last_block().unwrap();
        let off = header_block(&io, last);
        io.storage[off + 16] ^= 1; // header crc
        let mut gpt = load(&mut io);
        assert!(!gpt.state(GptCopy::Secondary).is_valid());

        let report = gpt.repair().unwrap();
        assert_eq!(
            report,
            RepairReport { secondary_restored: true, ..Default::default() }
        );
        assert_eq!(gpt.modified(), GPT_MODIFIED_HEADER2 | GPT_MODIFIED_ENTRIES2);
        assert_consistent(&gpt);
        let (primary, secondary) = (gpt.header(GptCopy::Primary), gpt.header(GptCopy::Secondary));
        assert_eq!({ secondary.current }, last);
        assert_eq!({ secondary.backup }, 1);
        assert_eq!({ secondary.entries }, last - 32);
        assert_ne!({ primary.crc32 }, { secondary.crc32 });

        gpt.write_back(&mut io).unwrap();
        assert_eq!(io.num_writes, 2);
        let mut reloaded = load(&mut io);
        assert!(reloaded.repair().unwrap().is_empty());
    }

    #[test]
    fn test_repair_primary_from_secondary() {
        let mut io = builder().build();
        // Wipe the primary entries.
        io.storage[1024..][..512].fill(0xff);
        let mut gpt = load(&mut io);
        assert!(!gpt.state(GptCopy::Primary).is_valid());
        assert!(gpt.state(GptCopy::Secondary).is_valid());

        let report = gpt.repair().unwrap();
        assert_eq!(report, RepairReport { primary_restored: true, ..Default::default() });
        assert_eq!(gpt.modified(), GPT_MODIFIED_HEADER1 | GPT_MODIFIED_ENTRIES1);
        assert_consistent(&gpt);
        assert_eq!(gpt.entry(1).unwrap().flags, 2 << 48);

        gpt.write_back(&mut io).unwrap();
        let original = builder().build();
        assert_eq!(io.storage, original.storage);
    }

    #[test]
    fn test_repair_both_invalid() {
        let mut io = TestBlockIo::new(512, vec![0u8; 512 * 128]);
        let mut gpt = load(&mut io);
        assert_eq!(gpt.repair(), Err(Error::NoGpt));
        assert_eq!(gpt.modified(), 0);
        gpt.write_back(&mut io).unwrap();
        assert_eq!(io.num_writes, 0);
    }

    #[test]
    fn test_repair_mismatched_valid_copies() {
        // Both copies are individually valid but describe different partitions.
        let mut io = builder().build();
        let other = builder().add_partition("extra", TYPE, 8, 0).build();
        let last = io.info().last_block().unwrap();
        let start = header_block(&io, last - 32);
        io.storage[start..].clone_from_slice(&other.storage[start..]);
        let mut gpt = load(&mut io);
        assert!(gpt.state(GptCopy::Primary).is_valid());
        assert!(gpt.state(GptCopy::Secondary).is_valid());

        let report = gpt.repair().unwrap();
        assert!(report.secondary_restored);
        assert_consistent(&gpt);
        assert!(gpt.entries(GptCopy::Secondary).get(2).unwrap().is_unused());
    }

    #[test]
    fn test_repair_grown_disk() {
        let mut io = builder().build();
        let old_blocks = io.info().num_blocks;
        let old_last_usable = load(&mut io).header(GptCopy::Primary).last;
        io.storage.resize(io.storage.len() * 2, 0);
        let mut gpt = load(&mut io);
        assert_eq!(gpt.state(GptCopy::Primary), CopyState::Valid(Geometry::Stale));
        assert!(!gpt.state(GptCopy::Secondary).is_valid());

        let report = gpt.repair().unwrap();
        assert!(report.geometry_fixed);
        assert!(report.secondary_restored);
        assert_eq!(
            gpt.modified(),
            GPT_MODIFIED_HEADER1 | GPT_MODIFIED_HEADER2 | GPT_MODIFIED_ENTRIES2
        );
        assert_consistent(&gpt);
        let header = gpt.header(GptCopy::Primary);
        let new_last = old_blocks * 2 - 1;
        assert_eq!({ header.backup }, new_last);
        assert_eq!({ header.last }, old_last_usable + old_blocks);
    }

    #[test]
    fn test_repair_grown_disk_keeps_partial_usable_range() {
        let mut io = builder().build();
        let mut gpt = load(&mut io);
        // Shrink the usable range so that it no longer ends at the secondary entries.
        let header = &mut gpt.primary.header;
        header.last -= 10;
        header.update_crc();
        gpt.modified |= GPT_MODIFIED_HEADER1;
        gpt.write_back(&mut io).unwrap();
        let last_usable = gpt.header(GptCopy::Primary).last;

        io.storage.resize(io.storage.len() * 2, 0);
        let mut gpt = load(&mut io);
        assert!(gpt.repair().unwrap().geometry_fixed);
        assert_eq!({ gpt.header(GptCopy::Primary).last }, last_usable);
        assert_consistent(&gpt);
    }

    #[test]
    fn test_repair_stale_secondary_backup() {
        let mut io = builder().build();
        let mut gpt = load(&mut io);
        gpt.secondary.header.backup = 7;
        gpt.secondary.header.update_crc();
        gpt.modified |= GPT_MODIFIED_HEADER2;
        gpt.write_back(&mut io).unwrap();

        let mut gpt = load(&mut io);
        assert_eq!(gpt.state(GptCopy::Secondary), CopyState::Valid(Geometry::Stale));
        let report = gpt.repair().unwrap();
        assert_eq!(report, RepairReport { geometry_fixed: true, ..Default::default() });
        assert_eq!(gpt.modified(), GPT_MODIFIED_HEADER2);
        assert_consistent(&gpt);
    }

    #[test]
    fn test_regenerated_entry_is_exact_copy() {
        let mut io = builder().build();
        let last = io.info().last_block().unwrap();
        let off = header_block(&io, last);
        io.storage[off..][..512].fill(0);
        let mut gpt = load(&mut io);
        gpt.repair().unwrap();
        let a: Vec<GptEntry> = gpt.entries(GptCopy::Primary).iter().collect();
        let b: Vec<GptEntry> = gpt.entries(GptCopy::Secondary).iter().collect();
        assert_eq!(a, b);
    }
}
