// Copyright 2025 Viewgraph (https://github.com/viewgraph/viewgraph)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Record keys for the normalized store.
//!
//! Every record in the store is addressed by a [`RecordKey`]. Entities that
//! carry a global `id` use it directly, so the same entity observed through
//! different queries lands on the same record. Records without a global id
//! get a synthesized key derived from the path that reached them, which makes
//! repeated normalization of the same payload deterministic.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Key of the synthetic root record that anchors every query payload.
pub const ROOT_KEY: &str = "client:root";

/// Identifier of a normalized record.
///
/// Keys are interned behind an `Arc<str>` so cloning them while building
/// dependency sets and reference lists is a pointer bump, not an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(Arc<str>);

impl RecordKey {
    /// Key of the client root record.
    pub fn root() -> Self {
        RecordKey(Arc::from(ROOT_KEY))
    }

    /// Key for an entity with a globally unique id.
    pub fn global(id: impl AsRef<str>) -> Self {
        RecordKey(Arc::from(id.as_ref()))
    }

    /// Synthesized key for a singular child record without a global id:
    /// `<parent>:<storage key>`.
    pub fn child_of(parent: &RecordKey, storage_key: &str) -> Self {
        RecordKey(Arc::from(format!("{}:{}", parent.0, storage_key).as_str()))
    }

    /// Synthesized key for an element of a plural field without a global id:
    /// `<parent>:<storage key>:<index>`.
    pub fn element_of(parent: &RecordKey, storage_key: &str, index: usize) -> Self {
        RecordKey(Arc::from(
            format!("{}:{}:{}", parent.0, storage_key, index).as_str(),
        ))
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == ROOT_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey(Arc::from(value))
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey(Arc::from(value.as_str()))
    }
}

impl Serialize for RecordKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(RecordKey::from(raw))
    }
}
