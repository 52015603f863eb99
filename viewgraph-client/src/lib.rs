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

//! # Viewgraph Client
//!
//! The read path and the facade over the normalized store.
//!
//! - [`client`] - the [`Client`]: execute, watch, page, retain, collect
//! - [`resolver`] - fragment resolution with memoized subtree sharing
//! - [`view`] - denormalized, immutable views handed to callers
//! - [`transport`] - the seam to whatever executes operations
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use viewgraph_client::{Client, StaticTransport};
//! use viewgraph_core::{
//!     FragmentSpec, OperationSpec, RecordKey, Selection, VariableBindings,
//! };
//!
//! let transport = Arc::new(StaticTransport::new());
//! let client = Arc::new(Client::new(transport.clone()));
//!
//! let query = Arc::new(OperationSpec::from_json(json!({
//!     "name": "TraceQuery",
//!     "selections": [{
//!         "kind": "LinkedField",
//!         "name": "trace",
//!         "selections": [
//!             {"kind": "ScalarField", "name": "id"},
//!             {"kind": "ScalarField", "name": "name"}
//!         ]
//!     }]
//! })).unwrap());
//! let fragment = client.register_fragment(
//!     FragmentSpec::new("TraceHeader", "Trace")
//!         .with_selections(vec![Selection::scalar("name")]),
//! );
//!
//! transport.stage_response(
//!     &query,
//!     VariableBindings::new(),
//!     json!({"trace": {"id": "t1", "name": "checkout", "__typename": "Trace"}}),
//! );
//! client.execute(&query, VariableBindings::new()).unwrap();
//!
//! let watcher = client.watch_fragment(
//!     &fragment,
//!     RecordKey::global("t1"),
//!     VariableBindings::new(),
//! );
//! assert_eq!(
//!     watcher.data().expect("resolved").string("name"),
//!     Some("checkout"),
//! );
//! ```

pub mod client;
pub mod resolver;
mod subscriptions;
pub mod transport;
pub mod view;

pub use client::{
    Client, ClientConfig, ConnectionWatcher, FetchTicket, FragmentWatcher, PageDirection,
    QueryRetention,
};
pub use resolver::{FragmentResolver, FragmentSubtree, MemoKey, Resolution, ViewMemo};
pub use transport::{QueryTransport, StaticTransport};
pub use view::{View, ViewRecord, ViewValue};

pub use viewgraph_core::{Result, TransportError, ViewgraphError};
