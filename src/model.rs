// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The minimal resource model used by the transfer engine.
//!
//! Full object and bucket metadata modeling belongs to the layers above this
//! crate. The engine only needs the fields involved in finalizing an upload
//! and validating its integrity.

/// The finalized remote resource description.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct Object {
    /// The name of the object.
    pub name: String,
    /// The name of the bucket containing the object.
    pub bucket: String,
    /// The content generation of the object.
    pub generation: i64,
    /// The total size of the object, in bytes.
    pub size: i64,
    /// The checksums reported by the service.
    pub checksums: Option<ObjectChecksums>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name<T: Into<String>>(mut self, v: T) -> Self {
        self.name = v.into();
        self
    }

    pub fn set_bucket<T: Into<String>>(mut self, v: T) -> Self {
        self.bucket = v.into();
        self
    }

    pub fn set_generation<T: Into<i64>>(mut self, v: T) -> Self {
        self.generation = v.into();
        self
    }

    pub fn set_size<T: Into<i64>>(mut self, v: T) -> Self {
        self.size = v.into();
        self
    }

    pub fn set_checksums(mut self, v: ObjectChecksums) -> Self {
        self.checksums = Some(v);
        self
    }
}

/// Message used for storing full (not subrange) object checksums.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ObjectChecksums {
    /// CRC32C digest of the object data, if known.
    pub crc32c: Option<u32>,
}

impl ObjectChecksums {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_crc32c<T: Into<u32>>(mut self, v: T) -> Self {
        self.crc32c = Some(v.into());
        self
    }
}
