//! Tentative local updates that roll back when the remote call fails.

use crate::error::AppError;
use parking_lot::RwLock;
use std::future::Future;
use tracing::debug;

/// A tentative change applied to `slot`, holding the value it replaced.
///
/// The lock is only held while applying or restoring, never across the
/// remote call.
pub struct OptimisticUpdate<'a, T: Clone> {
    slot: &'a RwLock<T>,
    pre_image: T,
}

impl<'a, T: Clone> OptimisticUpdate<'a, T> {
    pub fn begin(slot: &'a RwLock<T>, tentative: impl FnOnce(&mut T)) -> Self {
        let mut current = slot.write();
        let pre_image = current.clone();
        tentative(&mut current);
        Self { slot, pre_image }
    }

    pub fn pre_image(&self) -> &T {
        &self.pre_image
    }

    pub fn commit(self) {}

    pub fn rollback(self) {
        *self.slot.write() = self.pre_image;
    }

    /// Applies `tentative`, awaits `remote`, and restores the pre-image if
    /// `remote` fails.
    pub async fn apply<R, Fut>(
        slot: &'a RwLock<T>,
        tentative: impl FnOnce(&mut T),
        remote: Fut,
    ) -> Result<R, AppError>
    where
        Fut: Future<Output = Result<R, AppError>>,
    {
        let update = Self::begin(slot, tentative);
        match remote.await {
            Ok(value) => {
                update.commit();
                Ok(value)
            }
            Err(error) => {
                debug!(%error, "remote call failed, restoring pre-image");
                update.rollback();
                Err(error)
            }
        }
    }
}
