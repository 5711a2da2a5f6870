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

//! Disk access and GUID Partition Table handling for verified boot.
//!
//! The library reads both copies of a disk's GPT, validates each copy on its own, repairs a
//! damaged copy from the intact one and writes modified copies back. It never performs IO on its
//! own: all sector access goes through a caller provided [BlockIo].
//!
//! # Examples
//!
//! ```rust
//! use liberror::Result;
//! use vboot_storage::{BlockInfo, BlockIo, GptConfig, GptData};
//!
//! /// Mocks a block device using a buffer.
//! pub struct RamBlockIo {
//!     storage: std::vec::Vec<u8>,
//! }
//!
//! impl BlockIo for RamBlockIo {
//!     fn info(&mut self) -> BlockInfo {
//!         BlockInfo { block_size: 512, num_blocks: self.storage.len() as u64 / 512 }
//!     }
//!
//!     fn read_blocks(&mut self, blk_offset: u64, out: &mut [u8]) -> Result<()> {
//!         let start = (blk_offset * 512) as usize;
//!         Ok(out.clone_from_slice(&self.storage[start..][..out.len()]))
//!     }
//!
//!     fn write_blocks(&mut self, blk_offset: u64, data: &[u8]) -> Result<()> {
//!         let start = (blk_offset * 512) as usize;
//!         Ok(self.storage[start..][..data.len()].clone_from_slice(data))
//!     }
//! }
//!
//! let mut io = RamBlockIo { storage: vec![0u8; 64 * 1024] };
//! let mut gpt = GptData::load(&mut io, GptConfig::default()).unwrap();
//! // A blank disk has no valid copy.
//! assert!(gpt.repair().is_err());
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{vec, vec::Vec};
use liberror::{Error, Result};

mod gpt;
pub use gpt::{
    crc32, decode_entries, decode_header, encode_entries, encode_header, GptEntries, GptEntry,
    GptHeader, GPT_ENTRY_SIZE, GPT_GUID_LEN, GPT_HEADER_SIZE, GPT_MAGIC, GPT_NAME_LEN_U16,
    GPT_REVISION,
};

mod validate;
pub use validate::{
    check_entries, check_header, check_parameters, header_fields_same, CopyState, Geometry,
    GptConfig, GptCopy,
};

mod repair;
pub use repair::RepairReport;

mod table;
pub use table::{
    GptData, GPT_MODIFIED_ENTRIES1, GPT_MODIFIED_ENTRIES2, GPT_MODIFIED_HEADER1,
    GPT_MODIFIED_HEADER2,
};

#[cfg(any(test, feature = "testlib"))]
pub mod testlib;

/// Number of sectors occupied by the protective MBR.
pub const GPT_PMBR_SECTORS: u64 = 1;
/// Number of sectors occupied by one GPT header.
pub const GPT_HEADER_SECTORS: u64 = 1;
/// Smallest supported sector size in bytes.
pub const MIN_SECTOR_SIZE: u64 = 512;

/// `BlockInfo` contains information for a block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Native block size of the block device.
    pub block_size: u64,
    /// Total number of blocks of the block device.
    pub num_blocks: u64,
}

impl BlockInfo {
    /// Computes the total size in bytes of the block device.
    pub fn total_size(&self) -> Result<u64> {
        self.block_size.checked_mul(self.num_blocks).ok_or(Error::ArithmeticOverflow)
    }

    /// Returns the block address of the last block.
    pub fn last_block(&self) -> Result<u64> {
        self.num_blocks.checked_sub(1).ok_or(Error::ArithmeticOverflow)
    }

    /// Returns the number of blocks needed to hold `bytes` bytes.
    pub fn blocks_for(&self, bytes: u64) -> Result<u64> {
        if self.block_size == 0 {
            return Err(Error::InvalidInput);
        }
        Ok(bytes.div_ceil(self.block_size))
    }

    /// Returns the size in bytes of `blocks` blocks.
    pub fn bytes_for(&self, blocks: u64) -> Result<usize> {
        let bytes = blocks.checked_mul(self.block_size).ok_or(Error::ArithmeticOverflow)?;
        Ok(usize::try_from(bytes)?)
    }
}

/// `BlockIo` is the disk accessor consumed by this library.
///
/// Implementations must report failures as errors. A read that cannot be satisfied must never
/// zero-fill `out` and return success.
pub trait BlockIo {
    /// Gets the `BlockInfo` for this block device
    fn info(&mut self) -> BlockInfo;

    /// Read blocks of data from the block device
    ///
    /// # Args
    ///
    /// * `blk_offset`: Offset in number of blocks.
    ///
    /// * `out`: Buffer to store the read data. Callers of this method ensure that `out.len()` is
    ///   a multiple of `block_size`.
    ///
    /// # Returns
    ///
    /// Returns Ok(()) if exactly out.len() number of bytes are read.
    fn read_blocks(&mut self, blk_offset: u64, out: &mut [u8]) -> Result<()>;

    /// Write blocks of data to the block device
    ///
    /// # Args
    ///
    /// * `blk_offset`: Offset in number of blocks.
    ///
    /// * `data`: Data to write. Callers of this method ensure that `data.len()` is a multiple of
    ///   `block_size`.
    ///
    /// # Returns
    ///
    /// Returns Ok(()) if exactly data.len() number of bytes are written.
    fn write_blocks(&mut self, blk_offset: u64, data: &[u8]) -> Result<()>;
}

impl<T: BlockIo + ?Sized> BlockIo for &mut T {
    fn info(&mut self) -> BlockInfo {
        (**self).info()
    }

    fn read_blocks(&mut self, blk_offset: u64, out: &mut [u8]) -> Result<()> {
        (**self).read_blocks(blk_offset, out)
    }

    fn write_blocks(&mut self, blk_offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_blocks(blk_offset, data)
    }
}

/// Checks that `[blk_offset, blk_offset + blocks)` is inside the device.
fn check_range(info: BlockInfo, blk_offset: u64, blocks: u64) -> Result<()> {
    let end = blk_offset.checked_add(blocks).ok_or(Error::ArithmeticOverflow)?;
    match end > info.num_blocks {
        true => Err(Error::BadIndex(usize::try_from(end).unwrap_or(usize::MAX))),
        _ => Ok(()),
    }
}

/// Reads `blocks` blocks starting at `blk_offset` into a newly allocated buffer.
pub fn read_blocks_vec<T: BlockIo + ?Sized>(
    io: &mut T,
    blk_offset: u64,
    blocks: u64,
) -> Result<Vec<u8>> {
    let info = io.info();
    check_range(info, blk_offset, blocks)?;
    let mut out = vec![0u8; info.bytes_for(blocks)?];
    io.read_blocks(blk_offset, &mut out)?;
    Ok(out)
}

/// Writes `data` at `blk_offset`, zero padding the last block if `data` is not block aligned.
pub fn write_blocks_padded<T: BlockIo + ?Sized>(
    io: &mut T,
    blk_offset: u64,
    data: &[u8],
) -> Result<()> {
    let info = io.info();
    let blocks = info.blocks_for(u64::try_from(data.len())?)?;
    check_range(info, blk_offset, blocks)?;
    let size = info.bytes_for(blocks)?;
    match size == data.len() {
        true => io.write_blocks(blk_offset, data),
        _ => {
            let mut padded = vec![0u8; size];
            padded[..data.len()].clone_from_slice(data);
            io.write_blocks(blk_offset, &padded)
        }
    }
}
