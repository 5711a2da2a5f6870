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

//! Kernel partition selection for verified boot.
//!
//! Kernel partitions carry a priority, a remaining tries count and a successful flag in their
//! GPT attribute bits. A [Session] loads and repairs the disk's GPT, offers kernel partitions in
//! priority order, records the outcome of each boot attempt in the attribute bits and writes the
//! table back. [load_kernel()] drives a complete session, including rollback protection through a
//! [RollbackStore].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt::Write;
use vboot_storage::BlockIo;

mod attributes;
pub use attributes::{
    is_kernel_type, KernelAttributes, KernelEntries, KernelEntry, CHROMEOS_KERNEL_TYPE,
    MAX_PRIORITY, MAX_TRIES,
};

mod select;
pub use select::{KernelSelector, SelectState};

mod session;
pub use session::{KernelCandidate, Session};

mod rollback;
pub use rollback::{KernelVersions, RollbackContext, RollbackStore, VersionKind};

mod load;
pub use load::{load_kernel, BootMode, LoadParams, LoadedKernel};

/// Outcome of verifying a kernel candidate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// The kernel image is correctly signed. Carries the versions found in the image.
    Success(KernelVersions),
    /// The image failed signature or format verification.
    SignatureInvalid,
    /// The image could not be read.
    IoError,
}

/// `Ops` provides the platform services needed to select a kernel.
pub trait Ops: BlockIo {
    /// Verifies the kernel image in the partition described by `candidate`.
    ///
    /// `ctx` carries the boot mode and the minimum versions the image must satisfy. Rollback
    /// checks on the returned versions are done by the caller.
    fn verify_kernel(&mut self, candidate: &KernelCandidate, ctx: &RollbackContext)
        -> VerifyResult;

    /// Returns an optional console writer for logging.
    fn console(&mut self) -> Option<&mut dyn Write> {
        None
    }
}

/// Prints a line to the console of an [Ops] implementation, if it has one.
///
/// Console errors are ignored.
#[macro_export]
macro_rules! vboot_println {
    ( $ops:expr, $( $x:expr ),* $(,)? ) => {
        match $ops.console() {
            Some(f) => {
                let _ = core::fmt::Write::write_fmt(f, format_args!($($x,)*));
                let _ = core::fmt::Write::write_str(f, "\n");
            }
            _ => {}
        }
    };
}
