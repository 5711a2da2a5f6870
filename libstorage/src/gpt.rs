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

//! Binary layout of the GPT header and partition entry records.

use alloc::{vec, vec::Vec};
use core::mem::size_of;
use crc32fast::Hasher;
use liberror::{Error, GptError, Result};
use static_assertions::const_assert;
use uuid::Uuid;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// Records are cast from disk bytes in place, which is only correct on little endian targets.
const_assert!(cfg!(target_endian = "little"));

/// Length of a GUID in bytes.
pub const GPT_GUID_LEN: usize = 16;
/// The maximum number of UTF-16 characters in a GPT partition name, including termination.
pub const GPT_NAME_LEN_U16: usize = 36;
/// GPT header magic bytes ("EFI PART" in ASCII).
pub const GPT_MAGIC: u64 = 0x5452415020494645;
/// The only supported header revision (1.0).
pub const GPT_REVISION: u32 = 0x0001_0000;

/// The top-level GPT header.
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct GptHeader {
    /// Magic bytes; must be [GPT_MAGIC].
    pub magic: u64,
    /// Header version.
    pub revision: u32,
    /// Header size in bytes.
    pub size: u32,
    /// CRC of the first `size` bytes, calculated with this field zeroed.
    pub crc32: u32,
    /// Reserved; must be set to 0.
    pub reserved0: u32,
    /// The on-disk block location of this header.
    pub current: u64,
    /// The on-disk block location of the other header.
    pub backup: u64,
    /// First usable block for partition contents.
    pub first: u64,
    /// Last usable block for partition contents (inclusive).
    pub last: u64,
    /// Disk GUID.
    pub guid: [u8; GPT_GUID_LEN],
    /// Starting block for the partition entries array.
    pub entries: u64,
    /// Number of partition entries.
    pub entries_count: u32,
    /// The size of each partition entry in bytes.
    pub entries_size: u32,
    /// CRC of the partition entries array.
    pub entries_crc: u32,
}

/// Size of the GPT header structure in bytes.
pub const GPT_HEADER_SIZE: usize = size_of::<GptHeader>();
const_assert!(GPT_HEADER_SIZE == 92);

// core::mem::offset_of!(GptHeader, crc32) on a packed struct is rejected by older toolchains. We
// pre-compute the value here.
const GPT_CRC32_OFFSET: usize = 16;

impl GptHeader {
    /// Computes the header CRC32 with the `crc32` field treated as zero.
    pub fn compute_crc(&self) -> u32 {
        let bytes = self.as_bytes();
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..GPT_CRC32_OFFSET]);
        hasher.update(&[0u8; size_of::<u32>()]);
        hasher.update(&bytes[GPT_CRC32_OFFSET + size_of::<u32>()..]);
        hasher.finalize()
    }

    /// Update the header crc32 value.
    pub fn update_crc(&mut self) {
        self.crc32 = self.compute_crc();
    }

    /// Returns the size in bytes of the partition entry array described by this header.
    pub fn entries_bytes(&self) -> Result<u64> {
        u64::from(self.entries_count)
            .checked_mul(self.entries_size.into())
            .ok_or(Error::ArithmeticOverflow)
    }

    /// Returns the number of blocks occupied by the partition entry array.
    pub fn entries_blocks(&self, block_size: u64) -> Result<u64> {
        match block_size {
            0 => Err(Error::InvalidInput),
            v => Ok(self.entries_bytes()?.div_ceil(v)),
        }
    }

    /// Returns the disk GUID.
    pub fn disk_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.guid)
    }
}

/// Decodes a header from the start of `bytes`.
///
/// Only the length is checked. Field validation is done by `check_header()`.
pub fn decode_header(bytes: &[u8]) -> Result<GptHeader> {
    GptHeader::read_from_prefix(bytes).ok_or(Error::BufferTooSmall(Some(GPT_HEADER_SIZE)))
}

/// Encodes a header into its on-disk byte layout.
pub fn encode_header(header: &GptHeader) -> [u8; GPT_HEADER_SIZE] {
    let mut res = [0u8; GPT_HEADER_SIZE];
    res.clone_from_slice(header.as_bytes());
    res
}

/// GptEntry is the partition entry data structure in the GPT.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct GptEntry {
    /// Partition type GUID.
    pub part_type: [u8; GPT_GUID_LEN],
    /// Unique partition GUID.
    pub guid: [u8; GPT_GUID_LEN],
    /// First block.
    pub first: u64,
    /// Last block (inclusive).
    pub last: u64,
    /// Partition flags.
    pub flags: u64,
    /// Partition name in UTF-16.
    pub name: [u16; GPT_NAME_LEN_U16],
}

/// Size of the GPT entry structure in bytes, which is also the minimum on-disk entry size.
pub const GPT_ENTRY_SIZE: usize = size_of::<GptEntry>();
const_assert!(GPT_ENTRY_SIZE == 128);

const GPT_ENTRY_FLAGS_OFFSET: usize = 48;

impl GptEntry {
    /// Return the partition entry size in blocks.
    pub fn blocks(&self) -> Result<u64> {
        // Must perform "+1" first before subtracting `self.first`. Otherwise if partition size is
        // zero, where `self.first > self.last`, arithmetic will overflow.
        self.last
            .checked_add(1)
            .and_then(|v| v.checked_sub(self.first))
            .ok_or(Error::ArithmeticOverflow)
    }

    /// Returns whether this slot is unused. An all-zero type GUID marks an unused slot.
    pub fn is_unused(&self) -> bool {
        self.part_type == [0u8; GPT_GUID_LEN]
    }

    /// Returns the partition type GUID.
    pub fn type_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.part_type)
    }

    /// Returns the unique partition GUID.
    pub fn unique_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.guid)
    }

    /// Decode the partition name into a string. A length N utf16 string can be at most 2N utf8
    /// bytes. Therefore, a safe size of `buffer` is 2*GPT_NAME_LEN_U16 = 72.
    pub fn name_to_str<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a str> {
        let mut index = 0;
        let name = self.name;
        for c in char::decode_utf16(name) {
            match c.unwrap_or(char::REPLACEMENT_CHARACTER) {
                '\0' => break,
                c if c.len_utf8() <= buffer[index..].len() => {
                    index += c.encode_utf8(&mut buffer[index..]).len()
                }
                _ => return Err(Error::InvalidInput), // Not enough space in `buffer`.
            }
        }
        Ok(core::str::from_utf8(&buffer[..index]).map_err(|_| Error::InvalidInput)?)
    }
}

impl core::fmt::Display for GptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Format: partition name: "abc", [first, last]: [123, 456]
        let mut name_conversion_buffer = [0u8; GPT_NAME_LEN_U16 * 2];
        let name = self.name_to_str(&mut name_conversion_buffer).map_err(|_| core::fmt::Error)?;
        let (first, last) = (self.first, self.last);
        write!(f, "partition name: \"{}\", [first, last]: [{}, {}]", name, first, last)
    }
}

/// `GptEntries` owns the raw bytes of a partition entry array.
///
/// Entries may be larger than [GptEntry] on disk. The bytes past the structure are kept as read,
/// so that encoding an unmodified array reproduces the input exactly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GptEntries {
    data: Vec<u8>,
    entry_size: usize,
}

impl GptEntries {
    /// Returns the number of entry slots, used or not.
    pub fn len(&self) -> usize {
        match self.entry_size {
            0 => 0,
            v => self.data.len() / v,
        }
    }

    /// Returns whether there are no entry slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the on-disk size of one entry.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Returns a copy of the `idx`th entry.
    pub fn get(&self, idx: usize) -> Option<GptEntry> {
        let off = idx.checked_mul(self.entry_size)?;
        GptEntry::read_from_prefix(self.data.get(off..)?.get(..self.entry_size)?)
    }

    /// Returns an iterator over all entry slots, including unused ones.
    pub fn iter(&self) -> impl Iterator<Item = GptEntry> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }

    /// Overwrites the attribute flags of the `idx`th entry, leaving every other byte untouched.
    pub fn set_flags(&mut self, idx: usize, flags: u64) -> Result<()> {
        if idx >= self.len() {
            return Err(Error::BadIndex(idx));
        }
        let off = idx * self.entry_size + GPT_ENTRY_FLAGS_OFFSET;
        self.data[off..][..size_of::<u64>()].clone_from_slice(&flags.to_le_bytes());
        Ok(())
    }

    /// Returns the raw bytes of the array.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    /// Computes the CRC32 of the array.
    pub fn crc32(&self) -> u32 {
        crc32(&self.data)
    }
}

/// Decodes `count` entries of `entry_size` bytes each from the start of `bytes`.
pub fn decode_entries(bytes: &[u8], count: u32, entry_size: u32) -> Result<GptEntries> {
    let entry_size = usize::try_from(entry_size)?;
    if entry_size < GPT_ENTRY_SIZE || entry_size % 8 != 0 {
        return Err(GptError::UnexpectedEntrySize {
            actual: entry_size.try_into()?,
            max: u32::MAX,
        }
        .into());
    }
    let total = usize::try_from(count)?.checked_mul(entry_size).ok_or(Error::ArithmeticOverflow)?;
    let data = bytes.get(..total).ok_or(Error::GptError(GptError::EntriesTruncated))?;
    Ok(GptEntries { data: data.to_vec(), entry_size })
}

/// Encodes `entries` into an entry array with `entry_size` bytes per record. Bytes past the
/// [GptEntry] structure are zero.
pub fn encode_entries(entries: &[GptEntry], entry_size: u32) -> Result<GptEntries> {
    let entry_size = usize::try_from(entry_size)?;
    if entry_size < GPT_ENTRY_SIZE || entry_size % 8 != 0 {
        return Err(Error::InvalidInput);
    }
    let total = entries.len().checked_mul(entry_size).ok_or(Error::ArithmeticOverflow)?;
    let mut data = vec![0u8; total];
    for (chunk, entry) in data.chunks_exact_mut(entry_size).zip(entries) {
        chunk[..GPT_ENTRY_SIZE].clone_from_slice(entry.as_bytes());
    }
    Ok(GptEntries { data, entry_size })
}

/// Computes the standard CRC32 (reflected polynomial 0xEDB88320) used by GPT.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
