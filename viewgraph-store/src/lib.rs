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

//! # Viewgraph Store
//!
//! The normalized record store and its write path.
//!
//! - [`store`] - the flat record table, generation counter, and commit
//!   sealing
//! - [`record`] - individual records and the field-level merge rules
//! - [`normalizer`] - turns response payloads into record writes
//! - [`connection`] - cursor-connection records and incremental page merges
//! - [`gc`] - mark-sweep collection driven by retained selectors
//!
//! The store is single-writer by construction: every function that mutates
//! takes `&mut RecordStore`, and the client crate serializes writers behind
//! one lock. Reads take `&RecordStore` and can be shared freely.

pub mod connection;
pub mod gc;
pub mod normalizer;
pub mod record;
pub mod store;

pub use connection::{
    ConnectionSnapshot, EdgeSnapshot, IncomingEdge, MergeDirection, PageInfoPatch,
    PageInfoSnapshot,
};
pub use gc::{RetainedSelector, SelectorSource, SweepStats};
pub use normalizer::{normalize_response, NormalizeOutcome};
pub use record::{Record, StoreValue};
pub use store::{CommitReceipt, MergeOutcome, RecordStore, StoreStats, WriteOutcome};

pub use viewgraph_core::{Result, ViewgraphError};
