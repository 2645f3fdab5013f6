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

use embassy_sync::channel::{Channel, TryReceiveError};

use log::{debug, warn};

use crate::error::{Error, ErrorCode};

use super::StdRawMutex;

/// A unit of work deferred onto the stack's own thread.
pub type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A thread-safe queue of work items that only the stack's event loop drains.
///
/// Any thread (including callbacks from platform code) may post work with
/// [`WorkQueue::schedule_work`]. Items run in FIFO order, one at a time, with
/// exclusive access to the stack state, so they never overlap with packet
/// processing or with each other.
pub struct WorkQueue<S, const N: usize> {
    channel: Channel<StdRawMutex, Work<S>, N>,
}

impl<S, const N: usize> WorkQueue<S, N> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Post `work` for execution on the stack thread.
    ///
    /// Fails with `ResourceExhausted` when the queue is full; the work is
    /// dropped in that case.
    pub fn schedule_work<F>(&self, work: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.channel.try_send(Box::new(work)).map_err(|_| {
            warn!("Work queue full, dropping work item");
            ErrorCode::ResourceExhausted.into()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    /// Run every queued item against `state`. Returns the number of items run.
    ///
    /// Must only be called from the stack's event loop.
    pub fn drain(&self, state: &mut S) -> usize {
        let mut count = 0;

        loop {
            match self.channel.try_receive() {
                Ok(work) => {
                    work(state);
                    count += 1;
                }
                Err(TryReceiveError::Empty) => break,
            }
        }

        if count > 0 {
            debug!("Ran {} scheduled work item(s)", count);
        }

        count
    }
}

impl<S, const N: usize> Default for WorkQueue<S, N> {
    fn default() -> Self {
        Self::new()
    }
}
