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

//! A fixed-capacity object pool with generational handles.
//!
//! Sessions, exchanges and interaction handlers all live in pools of this
//! kind. Allocation never grows the pool: when every slot is taken, `alloc`
//! hands the value back to the caller, which decides whether to evict or to
//! reject the new work.
//!
//! A slot's generation is bumped each time it is freed, so a stale handle to
//! a recycled slot is detected instead of silently aliasing the new occupant.

use core::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    index: u16,
    gen: u16,
}

impl PoolHandle {
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub const fn generation(&self) -> u16 {
        self.gen
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.gen)
    }
}

struct Slot<T> {
    gen: u16,
    value: Option<T>,
}

pub struct Pool<T, const N: usize> {
    slots: heapless::Vec<Slot<T>, N>,
    used: usize,
}

impl<T, const N: usize> Pool<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
            used: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == N
    }

    /// Place `value` into the lowest free slot.
    ///
    /// On exhaustion the value is returned untouched.
    pub fn alloc(&mut self, value: T) -> Result<PoolHandle, T> {
        if let Some(index) = self.slots.iter().position(|slot| slot.value.is_none()) {
            let slot = &mut self.slots[index];
            slot.value = Some(value);
            self.used += 1;

            return Ok(PoolHandle {
                index: index as u16,
                gen: slot.gen,
            });
        }

        if self.slots.is_full() {
            return Err(value);
        }

        let index = self.slots.len();
        // Cannot fail, capacity was checked above
        let _ = self.slots.push(Slot {
            gen: 0,
            value: Some(value),
        });
        self.used += 1;

        Ok(PoolHandle {
            index: index as u16,
            gen: 0,
        })
    }

    pub fn free(&mut self, handle: PoolHandle) -> Option<T> {
        let slot = self.slot_mut(handle)?;
        let value = slot.value.take();
        slot.gen = slot.gen.wrapping_add(1);
        self.used -= 1;

        value
    }

    pub fn contains(&self, handle: PoolHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: PoolHandle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.gen == handle.gen)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: PoolHandle) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|slot| slot.value.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    PoolHandle {
                        index: index as u16,
                        gen: slot.gen,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PoolHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let gen = slot.gen;
            slot.value.as_mut().map(|value| {
                (
                    PoolHandle {
                        index: index as u16,
                        gen,
                    },
                    value,
                )
            })
        })
    }

    /// Handles of all occupied slots matching `f`, collected up front so that
    /// the caller may free them while walking the result.
    pub fn handles_where<F>(&self, mut f: F) -> heapless::Vec<PoolHandle, N>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter()
            .filter(|(_, value)| f(value))
            .map(|(handle, _)| handle)
            .collect()
    }

    fn slot_mut(&mut self, handle: PoolHandle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.gen == handle.gen && slot.value.is_some())
    }
}

impl<T, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Pool;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool = Pool::<u32, 3>::new();

        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        let _c = pool.alloc(3).unwrap();
        assert!(pool.is_full());
        assert_eq!(pool.alloc(4), Err(4));

        assert_eq!(pool.free(b), Some(2));
        let d = pool.alloc(5).unwrap();
        assert_eq!(d.index(), b.index());
        assert_ne!(d, b);

        assert_eq!(pool.get(a), Some(&1));
        assert_eq!(pool.get(d), Some(&5));
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut pool = Pool::<&str, 2>::new();

        let a = pool.alloc("first").unwrap();
        pool.free(a);
        assert!(pool.get(a).is_none());
        assert!(pool.free(a).is_none());

        let b = pool.alloc("second").unwrap();
        assert_eq!(a.index(), b.index());
        assert!(pool.get_mut(a).is_none());
        assert_eq!(pool.len(), 1);
    }
}
