/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use core::ops::{Deref, DerefMut};

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use log::trace;

/// The stack lock.
///
/// Wraps the whole stack state so that the only way to reach it from a
/// foreign thread is through [`StackLock::lock`] or [`StackLock::try_lock`].
/// Dropping the returned guard unlocks the stack.
pub struct StackLock<T> {
    state: Mutex<T>,
}

impl<T> StackLock<T> {
    pub const fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Block until the stack can be locked.
    ///
    /// A panic on another thread while it held the lock does not wedge the
    /// stack: the state is handed out as-is.
    pub fn lock(&self) -> StackGuard<'_, T> {
        trace!("Locking stack");

        StackGuard(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Lock the stack only if no other thread currently holds it.
    pub fn try_lock(&self) -> Option<StackGuard<'_, T>> {
        match self.state.try_lock() {
            Ok(guard) => Some(StackGuard(guard)),
            Err(TryLockError::Poisoned(poisoned)) => Some(StackGuard(poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn into_inner(self) -> T {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct StackGuard<'a, T>(MutexGuard<'a, T>);

impl<T> StackGuard<'_, T> {
    /// Explicitly release the stack lock.
    pub fn unlock(self) {
        trace!("Unlocking stack");
    }
}

impl<T> Deref for StackGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for StackGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
