// Copyright (C) 2024  Google LLC
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

//! Utilities for writing tests with vboot_storage, e.g. creating fake disks with a GPT.

use crate::{
    encode_entries, encode_header, BlockInfo, BlockIo, GptEntry, GptHeader, GPT_HEADER_SIZE,
    GPT_MAGIC, GPT_NAME_LEN_U16, GPT_REVISION,
};
use alloc::{collections::VecDeque, vec, vec::Vec};
use liberror::{Error, Result};
use uuid::Uuid;
use zerocopy::FromZeroes;

/// RAM backed [BlockIo] that records accesses and supports injected failures.
pub struct TestBlockIo {
    /// The storage block size in bytes.
    pub block_size: u64,
    /// The backing storage data.
    pub storage: Vec<u8>,
    /// The number of successful read calls.
    pub num_reads: usize,
    /// The number of successful write calls.
    pub num_writes: usize,
    /// Injected read errors. Each read call pops one.
    pub read_errors: VecDeque<Error>,
    /// Injected write results. Each write call pops one. Writes succeed once it is empty.
    pub write_results: VecDeque<Result<()>>,
    /// `(blk_offset, length)` of every attempted write.
    pub writes: Vec<(u64, usize)>,
}

impl TestBlockIo {
    /// Creates a new [TestBlockIo].
    pub fn new(block_size: u64, data: Vec<u8>) -> Self {
        Self {
            block_size,
            storage: data,
            num_reads: 0,
            num_writes: 0,
            read_errors: Default::default(),
            write_results: Default::default(),
            writes: Default::default(),
        }
    }

    fn range(&self, blk_offset: u64, len: usize) -> Result<core::ops::Range<usize>> {
        assert_eq!(len as u64 % self.block_size, 0, "unaligned access");
        let start = usize::try_from(blk_offset * self.block_size)?;
        let end = start.checked_add(len).ok_or(Error::ArithmeticOverflow)?;
        match end > self.storage.len() {
            true => Err(Error::BadIndex(end)),
            _ => Ok(start..end),
        }
    }
}

impl BlockIo for TestBlockIo {
    fn info(&mut self) -> BlockInfo {
        BlockInfo {
            block_size: self.block_size,
            num_blocks: self.storage.len() as u64 / self.block_size,
        }
    }

    fn read_blocks(&mut self, blk_offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.range(blk_offset, out.len())?;
        if let Some(e) = self.read_errors.pop_front() {
            return Err(e);
        }
        out.clone_from_slice(&self.storage[range]);
        self.num_reads += 1;
        Ok(())
    }

    fn write_blocks(&mut self, blk_offset: u64, data: &[u8]) -> Result<()> {
        self.writes.push((blk_offset, data.len()));
        let range = self.range(blk_offset, data.len())?;
        self.write_results.pop_front().unwrap_or(Ok(()))?;
        self.storage[range].clone_from_slice(data);
        self.num_writes += 1;
        Ok(())
    }
}

struct TestPartition {
    name: &'static str,
    part_type: Uuid,
    blocks: u64,
    attributes: u64,
}

/// Builder for a disk carrying a standard two-copy GPT.
///
/// Partitions are laid out back to back from the first usable block in the order they are added.
/// Unique partition GUIDs and the disk GUID are derived deterministically, so two builders with
/// the same configuration produce identical disks.
pub struct TestDiskBuilder {
    block_size: u64,
    num_blocks: u64,
    entries_count: u32,
    entry_size: u32,
    partitions: Vec<TestPartition>,
}

impl Default for TestDiskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDiskBuilder {
    /// The default block size in bytes.
    pub const DEFAULT_BLOCK_SIZE: u64 = 512;
    /// The default disk size in blocks.
    pub const DEFAULT_NUM_BLOCKS: u64 = 256;
    /// The disk GUID of every built disk.
    pub const DISK_GUID: Uuid = Uuid::from_u128(0x2a1e8f34_9b0c_4d6e_a5f7_0123456789ab);

    /// Creates a builder for an empty table of 128 entries.
    pub fn new() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            num_blocks: Self::DEFAULT_NUM_BLOCKS,
            entries_count: 128,
            entry_size: 128,
            partitions: vec![],
        }
    }

    /// Sets the block size.
    pub fn set_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the disk size in blocks.
    pub fn set_num_blocks(mut self, num_blocks: u64) -> Self {
        self.num_blocks = num_blocks;
        self
    }

    /// Sets the number of entry slots.
    pub fn set_entries_count(mut self, entries_count: u32) -> Self {
        self.entries_count = entries_count;
        self
    }

    /// Sets the on-disk size of one entry.
    pub fn set_entry_size(mut self, entry_size: u32) -> Self {
        self.entry_size = entry_size;
        self
    }

    /// Appends a partition of `blocks` blocks with the given type GUID and attribute flags.
    pub fn add_partition(
        mut self,
        name: &'static str,
        part_type: Uuid,
        blocks: u64,
        attributes: u64,
    ) -> Self {
        self.partitions.push(TestPartition { name, part_type, blocks, attributes });
        self
    }

    /// Returns the unique GUID assigned to the `idx`th added partition.
    pub fn unique_guid(idx: usize) -> Uuid {
        Uuid::from_u128(0x8c3f_0000_0000_4000_8000_0000_0000_0000 | (idx as u128 + 1))
    }

    /// Builds the raw disk image.
    pub fn build_data(&self) -> Vec<u8> {
        let bs = self.block_size;
        let entries_bytes = u64::from(self.entries_count) * u64::from(self.entry_size);
        let entries_blocks = entries_bytes.div_ceil(bs);
        let last_lba = self.num_blocks - 1;

        let mut entries = vec![GptEntry::new_zeroed(); self.entries_count as usize];
        let mut next = 2 + entries_blocks;
        for (idx, (part, entry)) in self.partitions.iter().zip(entries.iter_mut()).enumerate() {
            entry.part_type = part.part_type.to_bytes_le();
            entry.guid = Self::unique_guid(idx).to_bytes_le();
            entry.first = next;
            entry.last = next + part.blocks - 1;
            entry.flags = part.attributes;
            assert!(part.name.encode_utf16().count() < GPT_NAME_LEN_U16);
            for (dst, c) in entry.name.iter_mut().zip(part.name.encode_utf16()) {
                *dst = c;
            }
            next += part.blocks;
        }
        let entries = encode_entries(&entries, self.entry_size).unwrap();

        let mut primary = GptHeader {
            magic: GPT_MAGIC,
            revision: GPT_REVISION,
            size: GPT_HEADER_SIZE as u32,
            current: 1,
            backup: last_lba,
            first: 2 + entries_blocks,
            last: last_lba - entries_blocks - 1,
            guid: Self::DISK_GUID.to_bytes_le(),
            entries: 2,
            entries_count: self.entries_count,
            entries_size: self.entry_size,
            entries_crc: entries.crc32(),
            ..Default::default()
        };
        assert!(next <= primary.last + 1, "partitions do not fit");
        primary.update_crc();
        let mut secondary = primary;
        secondary.current = last_lba;
        secondary.backup = 1;
        secondary.entries = last_lba - entries_blocks;
        secondary.update_crc();

        let mut data = vec![0u8; (bs * self.num_blocks) as usize];
        // Protective MBR: one partition record of type 0xEE and the boot signature.
        data[446 + 4] = 0xee;
        data[510] = 0x55;
        data[511] = 0xaa;
        let at = |lba: u64| (lba * bs) as usize;
        data[at(1)..][..GPT_HEADER_SIZE].clone_from_slice(&encode_header(&primary));
        data[at(2)..][..entries.as_bytes().len()].clone_from_slice(entries.as_bytes());
        data[at(last_lba - entries_blocks)..][..entries.as_bytes().len()]
            .clone_from_slice(entries.as_bytes());
        data[at(last_lba)..][..GPT_HEADER_SIZE].clone_from_slice(&encode_header(&secondary));
        data
    }

    /// Builds a [TestBlockIo] backed by the disk image.
    pub fn build(&self) -> TestBlockIo {
        TestBlockIo::new(self.block_size, self.build_data())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CopyState, Geometry, GptConfig, GptCopy, GptData};

    const TYPE: Uuid = Uuid::from_u128(0x0fc63daf_8483_4772_8e79_3d69d8477de4);

    #[test]
    fn test_built_disk_is_valid() {
        for (block_size, num_blocks, entry_size) in
            [(512, 256, 128), (4096, 64, 128), (512, 512, 256)]
        {
            let mut io = TestDiskBuilder::new()
                .set_block_size(block_size)
                .set_num_blocks(num_blocks)
                .set_entry_size(entry_size)
                .add_partition("a", TYPE, 4, 0)
                .build();
            let gpt = GptData::load(&mut io, GptConfig::default()).unwrap();
            assert_eq!(gpt.state(GptCopy::Primary), CopyState::Valid(Geometry::Current));
            assert_eq!(gpt.state(GptCopy::Secondary), CopyState::Valid(Geometry::Current));
            assert_eq!(gpt.entry(0).unwrap().unique_guid(), TestDiskBuilder::unique_guid(0));
            assert_eq!(gpt.header(GptCopy::Primary).disk_guid(), TestDiskBuilder::DISK_GUID);
        }
    }

    #[test]
    fn test_injected_write_failure() {
        let mut io = TestBlockIo::new(512, vec![0u8; 2048]);
        io.write_results.push_back(Err(Error::WriteProtected));
        assert_eq!(io.write_blocks(0, &[1u8; 512]), Err(Error::WriteProtected));
        assert_eq!(io.num_writes, 0);
        io.write_blocks(0, &[1u8; 512]).unwrap();
        assert_eq!(io.num_writes, 1);
        assert_eq!(io.writes, [(0, 512), (0, 512)]);
    }
}
