// Copyright 2024, The Android Open Source Project
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

//! Unified error type library
//!
//! This crate defines a common error type for the verified boot storage and kernel selection
//! libraries, so that disk access, GPT parsing and kernel selection errors compose with `?`
//! without conversion boilerplate.
//!
//! GPT validation reasons are grouped in the nested [GptError]. A reason carries a payload only
//! when the payload helps debugging once the error is logged.
//!
//! New error variants should be inserted alphabetically.

#![cfg_attr(not(test), no_std)]

use core::num::TryFromIntError;

/// Gpt related errors.
///
/// These are the reasons a single GPT copy (header plus entry array) is classified as invalid.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GptError {
    /// Disk size is not enough to accommodate the minimum GPT layout.
    DiskTooSmall {
        /// Total sectors of the disk.
        sectors: u64,
        /// Minimum number of sectors required.
        min: u64,
    },
    /// Two used partition entries share the same unique GUID.
    DuplicateUniqueGuid {
        /// Index of the first entry (0-based).
        idx: usize,
        /// Index of the second entry (0-based).
        other: usize,
    },
    /// GPT entries buffer is too small for the expected number of entries.
    EntriesTruncated,
    /// GPT entries CRC doesn't match.
    IncorrectEntriesCrc,
    /// GPT header CRC is not correct.
    IncorrectHeaderCrc,
    /// GPT header MAGIC is not correct.
    IncorrectMagic(u64),
    /// The starting block of the entry array is not where this copy requires it.
    InvalidEntriesLocation {
        /// The entry start block value.
        value: u64,
        /// Expected range, inclusive.
        expect_range: (u64, u64),
    },
    /// Invalid first and last usable block in the GPT header.
    InvalidFirstLastUsableBlock {
        /// The value of first usable block in the GPT header.
        first: u64,
        /// The value of last usable block in the GPT header.
        last: u64,
        /// Expected range inclusive.
        range: (u64, u64),
    },
    /// The header's own location field does not name the block it was read from.
    InvalidHeaderLocation {
        /// The value of the current LBA field.
        value: u64,
        /// The block the header was read from.
        expect: u64,
    },
    /// Partition range is invalid.
    InvalidPartitionRange {
        /// Partition index (0-based).
        idx: usize,
        /// Range of the partition, inclusive.
        part_range: (u64, u64),
        /// Range of usable block, inclusive.
        usable_range: (u64, u64),
    },
    /// The disk's sector size is unsupported.
    InvalidSectorSize(u64),
    /// Reserved header field is not zero.
    NonZeroReserved(u32),
    /// Number of entries outside of the allowed range.
    NumberOfEntriesOverflow {
        /// Actual number of entries,
        entries: u32,
        /// Allowed range, inclusive.
        allowed: (u32, u32),
    },
    /// Two used partition entries overlap.
    PartitionOverlap {
        /// Index of the first entry (0-based).
        idx: usize,
        /// Index of the overlapping entry (0-based).
        other: usize,
    },
    /// Unexpected GPT entry size.
    UnexpectedEntrySize {
        /// The actual entry size in the GPT header.
        actual: u32,
        /// Maximum allowed size. Sizes must also be at least 128 and a multiple of 8.
        max: u32,
    },
    /// Unexpected GPT header size.
    UnexpectedHeaderSize {
        /// The actual header size in the GPT header.
        actual: u32,
        /// The expected size.
        expect: usize,
    },
    /// Unsupported GPT header revision.
    UnsupportedRevision(u32),
}

impl GptError {
    /// Returns the coarse reason class of the error: bad signature, bad CRC, bad size or bad range.
    pub fn reason(&self) -> GptErrorReason {
        match self {
            Self::IncorrectMagic(_) | Self::UnsupportedRevision(_) | Self::NonZeroReserved(_) => {
                GptErrorReason::BadSignature
            }
            Self::IncorrectHeaderCrc | Self::IncorrectEntriesCrc => GptErrorReason::BadCrc,
            Self::UnexpectedHeaderSize { .. }
            | Self::UnexpectedEntrySize { .. }
            | Self::NumberOfEntriesOverflow { .. }
            | Self::EntriesTruncated
            | Self::InvalidSectorSize(_) => GptErrorReason::BadSize,
            Self::DiskTooSmall { .. }
            | Self::DuplicateUniqueGuid { .. }
            | Self::InvalidEntriesLocation { .. }
            | Self::InvalidFirstLastUsableBlock { .. }
            | Self::InvalidHeaderLocation { .. }
            | Self::InvalidPartitionRange { .. }
            | Self::PartitionOverlap { .. } => GptErrorReason::BadRange,
        }
    }
}

/// Coarse classification of [GptError].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GptErrorReason {
    /// Signature, revision or reserved fields are wrong.
    BadSignature,
    /// Header or entry array checksum mismatch.
    BadCrc,
    /// Header size, entry size or entry count is out of bounds.
    BadSize,
    /// A block address or partition range is inconsistent.
    BadRange,
}

/// Common, universal error type
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A checked arithmetic operation has overflowed.
    ArithmeticOverflow,
    /// An operation attempted to access data outside of the valid range.
    /// Includes the problematic index.
    BadIndex(usize),
    /// Generic BlockIO error.
    BlockIoError,
    /// The provided buffer is too small.
    /// If Some(n), provides the minimum required buffer size.
    BufferTooSmall(Option<usize>),
    /// A relevant device encountered an error.
    DeviceError,
    /// GPT related errors.
    GptError(GptError),
    /// At least one parameter fails preconditions.
    InvalidInput,
    /// A state machine has entered an invalid state.
    InvalidState,
    /// Neither copy of the GUID Partition Table is valid.
    NoGpt,
    /// Kernel selection ran out of candidates without a successful boot.
    NoBootableKernel,
    /// The requested element (e.g. device, partition, or value) was not found.
    NotFound,
    /// An image was rejected because its version is below the stored rollback version.
    RollbackViolation,
    /// The device cannot be written to.
    WriteProtected,
}

impl From<GptError> for Error {
    fn from(val: GptError) -> Self {
        Self::GptError(val)
    }
}

impl From<TryFromIntError> for Error {
    fn from(_: TryFromIntError) -> Self {
        Self::ArithmeticOverflow
    }
}

// `thiserror` is not available in `no_std`, so `Display` is written out.
impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

impl core::fmt::Display for GptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({:?})", self, self.reason())
    }
}

/// Helper type alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_try_from_int_error() {
        let e: Error = u8::try_from(256u32).unwrap_err().into();
        assert_eq!(e, Error::ArithmeticOverflow);
    }

    #[test]
    fn test_from_gpt_error() {
        let e: Error = GptError::IncorrectHeaderCrc.into();
        assert_eq!(e, Error::GptError(GptError::IncorrectHeaderCrc));
    }

    #[test]
    fn test_display() {
        let e: Error = GptError::IncorrectHeaderCrc.into();
        assert_eq!(std::format!("{}", e), "GptError(\n    IncorrectHeaderCrc,\n)");
        assert_eq!(std::format!("{}", GptError::IncorrectHeaderCrc), "IncorrectHeaderCrc (BadCrc)");
    }

    #[test]
    fn test_gpt_error_reason() {
        assert_eq!(GptError::IncorrectMagic(0).reason(), GptErrorReason::BadSignature);
        assert_eq!(GptError::IncorrectEntriesCrc.reason(), GptErrorReason::BadCrc);
        assert_eq!(
            GptError::UnexpectedHeaderSize { actual: 93, expect: 92 }.reason(),
            GptErrorReason::BadSize
        );
        assert_eq!(
            GptError::PartitionOverlap { idx: 0, other: 1 }.reason(),
            GptErrorReason::BadRange
        );
    }
}
