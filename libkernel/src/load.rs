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

//! Complete kernel selection flow with rollback protection.

use crate::{
    rollback::{KernelVersions, RollbackContext, RollbackStore, VersionKind},
    session::{KernelCandidate, Session},
    vboot_println, Ops, VerifyResult,
};
use liberror::Result;
use vboot_storage::GptConfig;

/// Boot mode of the current boot.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum BootMode {
    /// Verified boot with rollback protection.
    #[default]
    Normal,
    /// Developer mode. Rollback protection is not enforced.
    Developer,
    /// Recovery mode. Rollback protection is not enforced and versions stay unlocked.
    Recovery,
}

/// Parameters of [load_kernel()].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LoadParams {
    /// Boot mode.
    pub boot_mode: BootMode,
    /// GPT validation limits.
    pub gpt: GptConfig,
}

/// The kernel selected by [load_kernel()].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoadedKernel {
    /// The partition that verified and is to be booted.
    pub candidate: KernelCandidate,
    /// Versions found in the kernel image.
    pub versions: KernelVersions,
}

/// Selects, verifies and marks a kernel partition to boot.
///
/// Kernel partitions are offered to [Ops::verify_kernel()] in boot order. An image with an
/// invalid signature, or with versions below the stored rollback versions in normal mode, is
/// marked invalid and costs a try. An image that cannot be read is skipped. The first image that
/// passes is marked successful.
///
/// The GPT is written back before returning, whatever the outcome. A write back failure is logged
/// and otherwise ignored. In normal mode the stored kernel versions are then rolled forward to the
/// booted image's versions and locked.
///
/// Returns [liberror::Error::NoBootableKernel] if no partition passes, in which case the boot flow
/// should enter recovery.
pub fn load_kernel<T, R>(ops: &mut T, rollback: &mut R, params: &LoadParams) -> Result<LoadedKernel>
where
    T: Ops + ?Sized,
    R: RollbackStore + ?Sized,
{
    let ctx = RollbackContext::load(rollback, params.boot_mode)?;
    let mut session = Session::open(ops, params.gpt)?;
    let res = select(&mut session, &ctx);
    if let Err(e) = session.close() {
        vboot_println!(ops, "Ignoring GPT write back failure: {:?}", e);
    }
    let loaded = res?;

    let versions = loaded.versions;
    if ctx.needs_roll_forward(versions) {
        vboot_println!(
            ops,
            "Rolling kernel versions forward from {:?} to {:?}",
            ctx.stored,
            versions
        );
        rollback.write_stored_version(VersionKind::KernelKey, versions.key_version)?;
        rollback.write_stored_version(VersionKind::Kernel, versions.kernel_version)?;
    }
    if params.boot_mode == BootMode::Normal {
        rollback.lock_stored_version(VersionKind::KernelKey)?;
        rollback.lock_stored_version(VersionKind::Kernel)?;
    }
    Ok(loaded)
}

fn select<T: Ops + ?Sized>(
    session: &mut Session<'_, T>,
    ctx: &RollbackContext,
) -> Result<LoadedKernel> {
    loop {
        let candidate = session.next_kernel()?;
        match session.ops().verify_kernel(&candidate, ctx) {
            VerifyResult::Success(versions) => match ctx.check(versions) {
                Ok(()) => {
                    session.mark_kernel_successful(&candidate)?;
                    return Ok(LoadedKernel { candidate, versions });
                }
                Err(e) => {
                    vboot_println!(
                        session.ops(),
                        "Kernel {} versions {:?} rejected: {:?}",
                        candidate.index,
                        versions,
                        e
                    );
                    session.mark_kernel_invalid(&candidate)?;
                }
            },
            VerifyResult::SignatureInvalid => {
                vboot_println!(session.ops(), "Kernel {} failed verification.", candidate.index);
                session.mark_kernel_invalid(&candidate)?;
            }
            VerifyResult::IoError => {
                vboot_println!(session.ops(), "Kernel {} could not be read.", candidate.index);
                session.skip_kernel(&candidate)?;
            }
        }
    }
}
