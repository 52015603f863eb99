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

//! Error taxonomy shared by every viewgraph crate.
//!
//! Failures stay local to the read or write they occur in: a transport
//! error aborts its fetch before the store is touched, a merge conflict is
//! reported on the commit receipt while the write wins, and read-side
//! problems surface on the resolution that observed them. Everything is
//! `Clone` so the same error can be fanned out to several subscribers.

use std::fmt;

use thiserror::Error;

use crate::key::RecordKey;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, ViewgraphError>;

/// Shape class of a store field value, used when reporting conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    Null,
    Scalar,
    Ref,
    RefList,
}

impl fmt::Display for ValueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueClass::Null => "null",
            ValueClass::Scalar => "scalar",
            ValueClass::Ref => "reference",
            ValueClass::RefList => "reference list",
        };
        f.write_str(name)
    }
}

/// A non-fatal shape conflict observed while merging a write.
///
/// The incoming value replaced the existing one (last write wins); the
/// warning travels on the commit receipt so subscribers can see it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeWarning {
    pub key: RecordKey,
    pub field: String,
    pub existing: ValueClass,
    pub incoming: ValueClass,
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field '{}' on record '{}' changed class from {} to {}",
            self.field, self.key, self.existing, self.incoming
        )
    }
}

/// A field a resolution needed but the store does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MissingField {
    pub key: RecordKey,
    pub field: String,
}

/// Failures raised by transports.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no response staged for operation '{0}'")]
    NoResponse(String),
}

/// The workspace-wide error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ViewgraphError {
    /// A fetch failed before any data reached the store.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A write changed the shape class of an existing field.
    #[error("normalization conflict: {0}")]
    Normalization(MergeWarning),

    /// A resolution needed a field the store does not hold.
    #[error("missing field '{}' on record '{}'", .0.field, .0.key)]
    MissingField(MissingField),

    /// A record's stored shape contradicts the selection reading it.
    #[error("type mismatch on record '{key}': expected {expected}, found {actual}")]
    TypeMismatch {
        key: RecordKey,
        expected: String,
        actual: String,
    },

    /// A reference points at a record that is not in the store.
    #[error("unknown entity key '{0}'")]
    UnknownEntityKey(RecordKey),

    /// A spread names a fragment nobody registered.
    #[error("fragment '{0}' is not registered")]
    UnknownFragment(String),

    /// A descriptor failed to parse or is internally inconsistent.
    #[error("invalid descriptor: {0}")]
    Descriptor(String),
}

impl ViewgraphError {
    pub fn descriptor(err: serde_json::Error) -> Self {
        ViewgraphError::Descriptor(err.to_string())
    }
}
