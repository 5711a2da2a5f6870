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
    attributes::{is_kernel_type, KernelAttributes},
    select::{KernelSelector, SelectState},
    vboot_println, Ops,
};
use liberror::{Error, Result};
use uuid::Uuid;
use vboot_storage::{BlockInfo, BlockIo, CopyState, GptConfig, GptCopy, GptData};

/// Describes a kernel partition offered for boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelCandidate {
    /// Index of the partition in the entry array.
    pub index: usize,
    /// First block of the partition.
    pub start_lba: u64,
    /// Size of the partition in blocks.
    pub num_sectors: u64,
    /// Block size of the disk.
    pub block_size: u64,
    /// Unique GUID of the partition.
    pub unique_guid: Uuid,
    /// Kernel attributes at the time the candidate was offered.
    pub attributes: KernelAttributes,
}

/// [BlockIo] adapter that retries a failed read once.
struct RetryReads<'a, T: Ops + ?Sized>(&'a mut T);

impl<T: Ops + ?Sized> BlockIo for RetryReads<'_, T> {
    fn info(&mut self) -> BlockInfo {
        self.0.info()
    }

    fn read_blocks(&mut self, blk_offset: u64, out: &mut [u8]) -> Result<()> {
        match self.0.read_blocks(blk_offset, out) {
            Err(e) => {
                vboot_println!(self.0, "Read at block {} failed: {:?}, retrying.", blk_offset, e);
                self.0.read_blocks(blk_offset, out)
            }
            v => v,
        }
    }

    fn write_blocks(&mut self, blk_offset: u64, data: &[u8]) -> Result<()> {
        self.0.write_blocks(blk_offset, data)
    }
}

/// `Session` owns the GPT of the boot disk for one kernel selection cycle.
///
/// A session is opened with [Session::open()], hands out kernel candidates with
/// [Session::next_kernel()], takes the outcome of each through [Session::mark_kernel_successful()],
/// [Session::mark_kernel_invalid()] or [Session::skip_kernel()], and persists changes with
/// [Session::close()].
pub struct Session<'a, T: Ops + ?Sized> {
    ops: &'a mut T,
    gpt: GptData,
    selector: KernelSelector,
}

impl<'a, T: Ops + ?Sized> Session<'a, T> {
    /// Loads, validates and repairs the GPT of `ops`.
    ///
    /// A failed read is retried once before it is returned. Returns [Error::NoGpt] if neither
    /// copy of the GPT is valid, in which case nothing is written.
    pub fn open(ops: &'a mut T, config: GptConfig) -> Result<Self> {
        let mut gpt = GptData::load(&mut RetryReads(&mut *ops), config)?;
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            match gpt.state(copy) {
                CopyState::Invalid(e) => vboot_println!(ops, "{:?} GPT is invalid: {}", copy, e),
                CopyState::Valid(g) => vboot_println!(ops, "{:?} GPT is valid ({:?}).", copy, g),
            }
        }
        let report = match gpt.repair() {
            Ok(v) => v,
            Err(e) => {
                vboot_println!(ops, "No valid GPT: {:?}", e);
                return Err(e);
            }
        };
        if report.primary_restored {
            vboot_println!(ops, "Restored primary GPT from secondary.");
        }
        if report.secondary_restored {
            vboot_println!(ops, "Restored secondary GPT from primary.");
        }
        if report.geometry_fixed {
            vboot_println!(ops, "Corrected GPT location fields to the disk size.");
        }
        Ok(Self { ops, gpt, selector: KernelSelector::new() })
    }

    /// Returns the GPT.
    pub fn gpt(&self) -> &GptData {
        &self.gpt
    }

    /// Returns the platform ops the session was opened with.
    pub fn ops(&mut self) -> &mut T {
        &mut *self.ops
    }

    /// Returns the selection state.
    pub fn state(&self) -> SelectState {
        self.selector.state()
    }

    /// Offers the next kernel partition to boot.
    ///
    /// Returns [Error::NoBootableKernel] once every candidate has been tried, and
    /// [Error::InvalidState] if the outcome of the previous candidate has not been reported.
    pub fn next_kernel(&mut self) -> Result<KernelCandidate> {
        let Some(index) = self.selector.next_candidate(&mut self.gpt)? else {
            vboot_println!(self.ops, "No bootable kernel left.");
            return Err(Error::NoBootableKernel);
        };
        let entry = self.gpt.entry(index).ok_or(Error::BadIndex(index))?;
        let candidate = KernelCandidate {
            index,
            start_lba: entry.first,
            num_sectors: entry.blocks()?,
            block_size: self.gpt.block_info().block_size,
            unique_guid: entry.unique_guid(),
            attributes: KernelAttributes::decode(entry.flags),
        };
        vboot_println!(
            self.ops,
            "Offering kernel {} ({}) priority={} tries={} successful={}",
            index,
            entry,
            candidate.attributes.priority,
            candidate.attributes.tries,
            candidate.attributes.successful
        );
        Ok(candidate)
    }

    fn check_offered(&self, candidate: &KernelCandidate) -> Result<()> {
        match self.selector.state() {
            SelectState::CandidateOffered(idx) if idx == candidate.index => Ok(()),
            _ => Err(Error::InvalidState),
        }
    }

    /// Records that `candidate` verified and is booting.
    pub fn mark_kernel_successful(&mut self, candidate: &KernelCandidate) -> Result<()> {
        self.check_offered(candidate)?;
        self.selector.report_success(&mut self.gpt)?;
        vboot_println!(self.ops, "Kernel {} marked successful.", candidate.index);
        Ok(())
    }

    /// Records that `candidate` failed verification or boot.
    pub fn mark_kernel_invalid(&mut self, candidate: &KernelCandidate) -> Result<()> {
        self.check_offered(candidate)?;
        self.selector.report_failure(&mut self.gpt)?;
        let tries =
            self.gpt.entry(candidate.index).map(|v| KernelAttributes::decode(v.flags).tries);
        vboot_println!(self.ops, "Kernel {} failed, tries left: {:?}", candidate.index, tries);
        Ok(())
    }

    /// Moves past `candidate` without recording an outcome, e.g. when it could not be read.
    pub fn skip_kernel(&mut self, candidate: &KernelCandidate) -> Result<()> {
        self.check_offered(candidate)?;
        self.selector.skip(&mut self.gpt)?;
        vboot_println!(self.ops, "Kernel {} skipped.", candidate.index);
        Ok(())
    }

    /// Overwrites the kernel attributes of partition `index`.
    ///
    /// Returns [Error::NotFound] if the partition is not a kernel partition. The change takes
    /// effect on the disk at [Session::close()] and on selection order in the next session.
    pub fn set_kernel_attributes(&mut self, index: usize, attrs: KernelAttributes) -> Result<()> {
        let entry = self.gpt.entry(index).ok_or(Error::BadIndex(index))?;
        if !is_kernel_type(&entry) {
            return Err(Error::NotFound);
        }
        self.gpt.set_entry_flags(index, attrs.encode(entry.flags)?)
    }

    /// Returns the unique GUID of the kernel currently offered or booted.
    pub fn current_kernel_unique_guid(&self) -> Option<Uuid> {
        self.gpt.entry(self.gpt.current_kernel()?).map(|v| v.unique_guid())
    }

    /// Writes modified GPT regions back to disk and ends the session.
    ///
    /// Regions that fail to write are retried once. A remaining failure is returned, but the
    /// caller may continue to boot: the next session detects and repairs the stale copy.
    pub fn close(mut self) -> Result<()> {
        if self.gpt.modified() == 0 {
            return Ok(());
        }
        let Err(e) = self.gpt.write_back(&mut *self.ops) else {
            vboot_println!(self.ops, "GPT written back.");
            return Ok(());
        };
        vboot_println!(self.ops, "GPT write back failed: {:?}, retrying.", e);
        let res = self.gpt.write_back(&mut *self.ops);
        if let Err(e) = res {
            vboot_println!(
                self.ops,
                "GPT write back failed: {:?}, regions left: {:#x}",
                e,
                self.gpt.modified()
            );
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{attributes::CHROMEOS_KERNEL_TYPE, VerifyResult};
    use vboot_storage::testlib::{TestBlockIo, TestDiskBuilder};

    struct TestOps {
        io: TestBlockIo,
        log: String,
    }

    impl BlockIo for TestOps {
        fn info(&mut self) -> BlockInfo {
            self.io.info()
        }

        fn read_blocks(&mut self, blk_offset: u64, out: &mut [u8]) -> Result<()> {
            self.io.read_blocks(blk_offset, out)
        }

        fn write_blocks(&mut self, blk_offset: u64, data: &[u8]) -> Result<()> {
            self.io.write_blocks(blk_offset, data)
        }
    }

    impl Ops for TestOps {
        fn verify_kernel(
            &mut self,
            _: &KernelCandidate,
            _: &crate::RollbackContext,
        ) -> VerifyResult {
            VerifyResult::SignatureInvalid
        }

        fn console(&mut self) -> Option<&mut dyn core::fmt::Write> {
            Some(&mut self.log)
        }
    }

    fn attrs(priority: u8, tries: u8, successful: bool) -> u64 {
        KernelAttributes { priority, tries, successful }.encode(0).unwrap()
    }

    fn test_ops() -> TestOps {
        let io = TestDiskBuilder::new()
            .add_partition("kern_a", CHROMEOS_KERNEL_TYPE, 16, attrs(1, 2, false))
            .add_partition("kern_b", CHROMEOS_KERNEL_TYPE, 8, attrs(2, 1, false))
            .build();
        TestOps { io, log: String::new() }
    }

    #[test]
    fn test_open_retries_read_once() {
        let mut ops = test_ops();
        ops.io.read_errors.push_back(Error::BlockIoError);
        let session = Session::open(&mut ops, GptConfig::default()).unwrap();
        assert_eq!(session.state(), SelectState::Init);
        assert!(ops.log.contains("retrying"));
    }

    #[test]
    fn test_open_read_fails_twice() {
        let mut ops = test_ops();
        ops.io.read_errors.push_back(Error::BlockIoError);
        ops.io.read_errors.push_back(Error::BlockIoError);
        assert!(matches!(Session::open(&mut ops, GptConfig::default()), Err(Error::BlockIoError)));
    }

    #[test]
    fn test_open_no_gpt() {
        let mut ops =
            TestOps { io: TestBlockIo::new(512, vec![0u8; 512 * 64]), log: String::new() };
        assert!(matches!(Session::open(&mut ops, GptConfig::default()), Err(Error::NoGpt)));
        assert_eq!(ops.io.num_writes, 0);
        assert!(ops.log.contains("No valid GPT"));
    }

    #[test]
    fn test_candidate_descriptor() {
        let mut ops = test_ops();
        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        let candidate = session.next_kernel().unwrap();
        assert_eq!(
            candidate,
            KernelCandidate {
                index: 1,
                start_lba: 34 + 16,
                num_sectors: 8,
                block_size: 512,
                unique_guid: TestDiskBuilder::unique_guid(1),
                attributes: KernelAttributes { priority: 2, tries: 1, successful: false },
            }
        );
        assert_eq!(session.current_kernel_unique_guid(), Some(TestDiskBuilder::unique_guid(1)));
        assert_eq!(session.state(), SelectState::CandidateOffered(1));
        assert_eq!(session.next_kernel(), Err(Error::InvalidState));
    }

    #[test]
    fn test_report_wrong_candidate() {
        let mut ops = test_ops();
        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        let mut candidate = session.next_kernel().unwrap();
        candidate.index = 0;
        assert_eq!(session.mark_kernel_successful(&candidate), Err(Error::InvalidState));
    }

    #[test]
    fn test_exhausted_session_persists_tries() {
        let mut ops = test_ops();
        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        while let Ok(candidate) = session.next_kernel() {
            session.mark_kernel_invalid(&candidate).unwrap();
        }
        assert_eq!(session.state(), SelectState::Exhausted);
        assert_eq!(session.current_kernel_unique_guid(), None);
        session.close().unwrap();
        assert!(ops.log.contains("No bootable kernel left."));

        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        assert_eq!(
            session.gpt().entry(0).map(|v| KernelAttributes::decode(v.flags)),
            Some(KernelAttributes { priority: 1, tries: 1, successful: false })
        );
        // Entry 1 is out of tries.
        assert_eq!(session.next_kernel().map(|v| v.index), Ok(0));
    }

    #[test]
    fn test_set_kernel_attributes() {
        let mut ops = test_ops();
        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        let attrs = KernelAttributes { priority: 9, tries: 15, successful: false };
        session.set_kernel_attributes(0, attrs).unwrap();
        assert_eq!(session.set_kernel_attributes(5, attrs), Err(Error::NotFound));
        assert_eq!(session.set_kernel_attributes(500, attrs), Err(Error::BadIndex(500)));
        session.close().unwrap();

        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        assert_eq!(session.next_kernel().unwrap().attributes, attrs);
    }

    #[test]
    fn test_close_retries_failed_write() {
        let mut ops = test_ops();
        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        let candidate = session.next_kernel().unwrap();
        session.mark_kernel_successful(&candidate).unwrap();
        session.ops().io.write_results.push_back(Err(Error::BlockIoError));
        session.close().unwrap();
        assert!(ops.log.contains("retrying"));
        assert_eq!(ops.io.num_writes, 4);
    }

    #[test]
    fn test_close_failure_is_reported() {
        let mut ops = test_ops();
        let mut session = Session::open(&mut ops, GptConfig::default()).unwrap();
        let candidate = session.next_kernel().unwrap();
        session.mark_kernel_invalid(&candidate).unwrap();
        for _ in 0..8 {
            session.ops().io.write_results.push_back(Err(Error::BlockIoError));
        }
        assert_eq!(session.close(), Err(Error::BlockIoError));
        assert!(ops.log.contains("regions left: 0xf"));
    }

    #[test]
    fn test_close_without_changes_writes_nothing() {
        let mut ops = test_ops();
        let session = Session::open(&mut ops, GptConfig::default()).unwrap();
        session.close().unwrap();
        assert_eq!(ops.io.num_writes, 0);
    }
}
