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

//! Key-value persistence.
//!
//! Everything the stack persists is a TLV record stored under a short string
//! key. Platforms provide the backing store through [`KvStore`].

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, ErrorCode};

pub trait KvStore {
    /// Reads the value stored under `key` into `buf`, returning the filled
    /// part, or `None` if there is no such key.
    fn load<'b>(&self, key: &str, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, Error>;

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> Result<(), Error>;
}

impl<T: KvStore + ?Sized> KvStore for &mut T {
    fn load<'b>(&self, key: &str, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, Error> {
        (**self).load(key, buf)
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        (**self).store(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        (**self).remove(key)
    }
}

pub mod keys {
    use core::fmt::Write;

    pub type Key = heapless::String<32>;

    pub const FABRIC_LIST: &str = "g/fl";
    pub const SUBSCRIPTION_INDEX: &str = "g/sri";

    pub fn fabric(fab_idx: u8) -> Key {
        let mut key = Key::new();
        // Cannot overflow the key capacity
        let _ = write!(key, "f/{:x}/n", fab_idx);
        key
    }

    pub fn subscriptions(fab_idx: u8, node_id: u64) -> Key {
        let mut key = Key::new();
        let _ = write!(key, "f/{:x}/su/{:x}", fab_idx, node_id);
        key
    }
}

/// A volatile store, for tests and for devices without flash.
#[derive(Debug, Default)]
pub struct MemKvStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl KvStore for MemKvStore {
    fn load<'b>(&self, key: &str, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, Error> {
        let Some(value) = self.entries.get(key) else {
            return Ok(None);
        };

        let dst = buf.get_mut(..value.len()).ok_or(ErrorCode::NoSpace)?;
        dst.copy_from_slice(value);

        Ok(Some(dst))
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.entries.insert(key.into(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Stores each key as a file in a directory.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        info!("Persisting to {}", dir.display());

        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key.replace('/', "_"))
    }
}

impl KvStore for FileKvStore {
    fn load<'b>(&self, key: &str, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, Error> {
        let mut file = match fs::File::open(self.path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => Err(e)?,
        };

        let len = file.metadata()?.len() as usize;
        let buf = buf.get_mut(..len).ok_or(ErrorCode::NoSpace)?;
        file.read_exact(buf)?;

        debug!("Key {}: loaded {} bytes", key, len);

        Ok(Some(buf))
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut file = fs::File::create(self.path(key))?;
        file.write_all(value)?;

        debug!("Key {}: stored {} bytes", key, value.len());

        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
