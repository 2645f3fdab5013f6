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

//! Synchronization primitives for the single-threaded stack discipline.
//!
//! All session, exchange and interaction-model state is touched only by the
//! thread that currently holds the [`StackLock`]. Other threads either take
//! the lock, or post closures onto a [`WorkQueue`] that the stack's event loop
//! drains between packets.

pub use raw::*;
pub use stack_lock::*;
pub use work_queue::*;

mod raw;
mod stack_lock;
mod work_queue;
