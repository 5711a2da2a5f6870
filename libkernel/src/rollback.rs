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

use crate::load::BootMode;
use liberror::{Error, Result};

/// Identifies a rollback counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VersionKind {
    /// Firmware signing key version.
    FirmwareKey,
    /// Firmware body version.
    Firmware,
    /// Kernel signing key version.
    KernelKey,
    /// Kernel body version.
    Kernel,
}

/// Tamper resistant storage of minimum allowed image versions.
pub trait RollbackStore {
    /// Reads the stored version of `kind`.
    fn get_stored_version(&mut self, kind: VersionKind) -> Result<u16>;

    /// Writes the stored version of `kind`.
    fn write_stored_version(&mut self, kind: VersionKind, version: u16) -> Result<()>;

    /// Locks `kind` against further writes until the next reset.
    fn lock_stored_version(&mut self, kind: VersionKind) -> Result<()>;
}

/// Versions carried by a signed kernel image.
///
/// Ordering compares the key version first.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersions {
    /// Version of the key that signed the kernel.
    pub key_version: u16,
    /// Version of the kernel itself.
    pub kernel_version: u16,
}

/// Rollback state of one boot attempt, passed explicitly to verification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RollbackContext {
    /// The boot mode of this attempt.
    pub boot_mode: BootMode,
    /// Minimum versions a kernel must carry. Only enforced in [BootMode::Normal].
    pub stored: KernelVersions,
}

impl RollbackContext {
    /// Creates a context, reading the stored kernel versions from `store` in normal mode.
    ///
    /// Developer and recovery mode do not enforce rollback protection and do not access `store`.
    pub fn load(store: &mut (impl RollbackStore + ?Sized), boot_mode: BootMode) -> Result<Self> {
        let stored = match boot_mode {
            BootMode::Normal => KernelVersions {
                key_version: store.get_stored_version(VersionKind::KernelKey)?,
                kernel_version: store.get_stored_version(VersionKind::Kernel)?,
            },
            _ => Default::default(),
        };
        Ok(Self { boot_mode, stored })
    }

    /// Checks `versions` against the stored minimum.
    pub fn check(&self, versions: KernelVersions) -> Result<()> {
        match self.boot_mode == BootMode::Normal && versions < self.stored {
            true => Err(Error::RollbackViolation),
            _ => Ok(()),
        }
    }

    /// Returns whether booting `versions` should roll the stored versions forward.
    pub fn needs_roll_forward(&self, versions: KernelVersions) -> bool {
        self.boot_mode == BootMode::Normal && versions > self.stored
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mockall::{mock, predicate::eq};

    mock! {
        pub Store {}
        impl RollbackStore for Store {
            fn get_stored_version(&mut self, kind: VersionKind) -> Result<u16>;
            fn write_stored_version(&mut self, kind: VersionKind, version: u16) -> Result<()>;
            fn lock_stored_version(&mut self, kind: VersionKind) -> Result<()>;
        }
    }

    fn versions(key_version: u16, kernel_version: u16) -> KernelVersions {
        KernelVersions { key_version, kernel_version }
    }

    #[test]
    fn test_load_normal_reads_store() {
        let mut store = MockStore::new();
        store.expect_get_stored_version().with(eq(VersionKind::KernelKey)).return_const(Ok(2));
        store.expect_get_stored_version().with(eq(VersionKind::Kernel)).return_const(Ok(5));
        let ctx = RollbackContext::load(&mut store, BootMode::Normal).unwrap();
        assert_eq!(ctx.stored, versions(2, 5));
    }

    #[test]
    fn test_load_developer_skips_store() {
        let mut store = MockStore::new();
        store.expect_get_stored_version().never();
        let ctx = RollbackContext::load(&mut store, BootMode::Developer).unwrap();
        assert_eq!(ctx.stored, KernelVersions::default());
    }

    #[test]
    fn test_load_error() {
        let mut store = MockStore::new();
        store.expect_get_stored_version().return_const(Err(Error::DeviceError));
        assert_eq!(RollbackContext::load(&mut store, BootMode::Normal), Err(Error::DeviceError));
    }

    #[test]
    fn test_check() {
        let ctx = RollbackContext { boot_mode: BootMode::Normal, stored: versions(2, 5) };
        assert_eq!(ctx.check(versions(1, 9)), Err(Error::RollbackViolation));
        assert_eq!(ctx.check(versions(2, 4)), Err(Error::RollbackViolation));
        assert_eq!(ctx.check(versions(2, 5)), Ok(()));
        assert_eq!(ctx.check(versions(3, 0)), Ok(()));
        assert!(!ctx.needs_roll_forward(versions(2, 5)));
        assert!(ctx.needs_roll_forward(versions(2, 6)));
        assert!(ctx.needs_roll_forward(versions(3, 0)));

        let ctx = RollbackContext { boot_mode: BootMode::Recovery, stored: versions(2, 5) };
        assert_eq!(ctx.check(versions(0, 0)), Ok(()));
        assert!(!ctx.needs_roll_forward(versions(9, 9)));
    }
}
