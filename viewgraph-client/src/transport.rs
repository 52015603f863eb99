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

//! The seam between the cache and whatever actually executes operations.
//!
//! The engine is synchronous; async transports integrate through
//! [`Client::begin_fetch`](crate::Client::begin_fetch) and
//! [`Client::complete_fetch`](crate::Client::complete_fetch) instead of
//! implementing this trait with blocking waits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use viewgraph_core::{OperationSpec, QueryRequest, TransportError, VariableBindings};

/// Executes an operation and returns the response payload root.
pub trait QueryTransport: Send + Sync {
    fn execute(&self, request: &QueryRequest) -> Result<Value, TransportError>;
}

/// Transport backed by staged responses, keyed by request fingerprint.
///
/// Responses for the same request are served in the order staged.
#[derive(Default)]
pub struct StaticTransport {
    responses: Mutex<HashMap<u64, VecDeque<Value>>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        StaticTransport::default()
    }

    /// Queues a payload for a request already in hand.
    pub fn stage(&self, request: &QueryRequest, payload: Value) {
        self.responses
            .lock()
            .entry(request.fingerprint())
            .or_default()
            .push_back(payload);
    }

    /// Queues a payload for the request `(operation, variables)` would
    /// produce.
    pub fn stage_response(
        &self,
        operation: &Arc<OperationSpec>,
        variables: VariableBindings,
        payload: Value,
    ) {
        let request = QueryRequest::new(Arc::clone(operation), variables);
        self.stage(&request, payload);
    }

    /// Number of staged payloads not yet consumed.
    pub fn pending(&self) -> usize {
        self.responses.lock().values().map(VecDeque::len).sum()
    }
}

impl QueryTransport for StaticTransport {
    fn execute(&self, request: &QueryRequest) -> Result<Value, TransportError> {
        self.responses
            .lock()
            .get_mut(&request.fingerprint())
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::NoResponse(request.operation_name().to_string()))
    }
}
