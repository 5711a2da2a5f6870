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

use alloc::vec::Vec;
use liberror::{Error, Result};
use static_assertions::const_assert;
use uuid::Uuid;
use vboot_storage::{GptData, GptEntry};

/// Partition type GUID of ChromeOS kernel partitions.
pub const CHROMEOS_KERNEL_TYPE: Uuid = Uuid::from_u128(0xfe3a2a5d_4f32_41a7_b725_accc3285a309);

// Kernel specific bits of the GPT entry attribute field.
const PRIORITY_OFFSET: u64 = 48;
const PRIORITY_MASK: u64 = 0xf;
const TRIES_OFFSET: u64 = 52;
const TRIES_MASK: u64 = 0xf;
const SUCCESSFUL_OFFSET: u64 = 56;
const SUCCESSFUL_MASK: u64 = 0x1;

const_assert!(PRIORITY_OFFSET + 4 == TRIES_OFFSET);
const_assert!(TRIES_OFFSET + 4 == SUCCESSFUL_OFFSET);
const_assert!(SUCCESSFUL_OFFSET < 64);

/// Highest priority value.
pub const MAX_PRIORITY: u8 = PRIORITY_MASK as u8;
/// Highest tries value.
pub const MAX_TRIES: u8 = TRIES_MASK as u8;

// Helper function for extracting values from a bit field.
fn get_field(base: u64, offset: u64, mask: u64) -> u8 {
    ((base >> offset) & mask) as u8
}

// Helper function for replacing a bit field. Bits outside the field are returned unchanged.
fn set_field(base: u64, val: u8, offset: u64, mask: u64) -> u64 {
    (base & !(mask << offset)) | ((u64::from(val) & mask) << offset)
}

/// Boot metadata of a kernel partition.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KernelAttributes {
    /// 0 to 15. Higher is preferred, 0 means never boot.
    pub priority: u8,
    /// Remaining boot attempts, 0 to 15.
    pub tries: u8,
    /// Set once the OS confirmed a successful boot.
    pub successful: bool,
}

impl KernelAttributes {
    /// Decodes the kernel attributes from a raw GPT attribute field.
    pub fn decode(raw: u64) -> Self {
        Self {
            priority: get_field(raw, PRIORITY_OFFSET, PRIORITY_MASK),
            tries: get_field(raw, TRIES_OFFSET, TRIES_MASK),
            successful: get_field(raw, SUCCESSFUL_OFFSET, SUCCESSFUL_MASK) == 1,
        }
    }

    /// Encodes the attributes into `raw`, preserving all bits outside the kernel fields.
    ///
    /// Returns [Error::InvalidInput] if priority or tries do not fit their field.
    pub fn encode(&self, raw: u64) -> Result<u64> {
        if self.priority > MAX_PRIORITY || self.tries > MAX_TRIES {
            return Err(Error::InvalidInput);
        }
        let raw = set_field(raw, self.priority, PRIORITY_OFFSET, PRIORITY_MASK);
        let raw = set_field(raw, self.tries, TRIES_OFFSET, TRIES_MASK);
        Ok(set_field(raw, self.successful.into(), SUCCESSFUL_OFFSET, SUCCESSFUL_MASK))
    }

    /// Returns whether the partition may be selected for boot.
    pub fn is_bootable(&self) -> bool {
        self.priority > 0 && (self.tries > 0 || self.successful)
    }
}

/// Checks whether `entry` is a kernel partition.
pub fn is_kernel_type(entry: &GptEntry) -> bool {
    !entry.is_unused() && entry.type_guid() == CHROMEOS_KERNEL_TYPE
}

/// A kernel partition found in the GPT.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelEntry {
    /// Index in the partition entry array.
    pub index: usize,
    /// The raw entry.
    pub entry: GptEntry,
    /// The decoded kernel attributes.
    pub attributes: KernelAttributes,
}

/// Lists kernel partitions of a GPT.
pub trait KernelEntries {
    /// Returns all kernel partitions in entry array order.
    fn kernel_entries(&self) -> Vec<KernelEntry>;
}

impl KernelEntries for GptData {
    fn kernel_entries(&self) -> Vec<KernelEntry> {
        self.entries(vboot_storage::GptCopy::Primary)
            .iter()
            .enumerate()
            .filter(|(_, e)| is_kernel_type(e))
            .map(|(index, entry)| KernelEntry {
                index,
                entry,
                attributes: KernelAttributes::decode(entry.flags),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vboot_storage::testlib::TestDiskBuilder;
    use vboot_storage::GptConfig;

    #[test]
    fn test_decode() {
        let raw = (1u64 << 56) | (3u64 << 52) | (12u64 << 48) | 0xdead;
        assert_eq!(
            KernelAttributes::decode(raw),
            KernelAttributes { priority: 12, tries: 3, successful: true }
        );
        assert_eq!(KernelAttributes::decode(0), KernelAttributes::default());
    }

    #[test]
    fn test_encode_preserves_other_bits() {
        let raw = 0xffff_ffff_ffff_ffffu64;
        let attrs = KernelAttributes { priority: 1, tries: 0, successful: false };
        let encoded = attrs.encode(raw).unwrap();
        assert_eq!(encoded, 0xfe01_ffff_ffff_ffff);
        assert_eq!(KernelAttributes::decode(encoded), attrs);
    }

    #[test]
    fn test_encode_out_of_range() {
        let attrs = KernelAttributes { priority: 16, tries: 0, successful: false };
        assert_eq!(attrs.encode(0), Err(Error::InvalidInput));
        let attrs = KernelAttributes { priority: 0, tries: 16, successful: false };
        assert_eq!(attrs.encode(0), Err(Error::InvalidInput));
    }

    #[test]
    fn test_is_bootable() {
        let attrs = |priority, tries, successful| KernelAttributes { priority, tries, successful };
        assert!(attrs(1, 1, false).is_bootable());
        assert!(attrs(1, 0, true).is_bootable());
        assert!(!attrs(1, 0, false).is_bootable());
        assert!(!attrs(0, 15, true).is_bootable());
    }

    #[test]
    fn test_kernel_entries() {
        let other = Uuid::from_u128(0x3cb8e202_3b7e_47dd_8a3c_7ff2a13cfcec);
        let mut io = TestDiskBuilder::new()
            .add_partition("kern_a", CHROMEOS_KERNEL_TYPE, 8, 0x0015_0000_0000_0000)
            .add_partition("root_a", other, 8, 0)
            .add_partition("kern_b", CHROMEOS_KERNEL_TYPE, 8, 0x0100_0000_0000_0000)
            .build();
        let gpt = GptData::load(&mut io, GptConfig::default()).unwrap();
        let kernels = gpt.kernel_entries();
        assert_eq!(kernels.iter().map(|v| v.index).collect::<Vec<_>>(), [0, 2]);
        assert_eq!(
            kernels[0].attributes,
            KernelAttributes { priority: 5, tries: 1, successful: false }
        );
        assert_eq!(
            kernels[1].attributes,
            KernelAttributes { priority: 0, tries: 0, successful: true }
        );
    }
}
