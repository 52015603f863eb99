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

//! The client facade: execute operations, watch fragments, page
//! connections, retain query trees, collect garbage.
//!
//! One `RwLock<RecordStore>` guards the record table. Commits take the
//! write lock and apply their receipt to the subscription registry before
//! releasing it, so watchers observe invalidations in commit order.
//! Resolutions take the read lock; watch registration happens under the
//! same read lock that produced the resolution, which closes the window
//! where a commit could land between resolving and subscribing.
//!
//! Lock order is store first, registries second. Nothing acquires the
//! store lock while holding a registry shard.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::{debug, warn};
use viewgraph_core::{
    FragmentRegistry, FragmentSpec, LinkedField, MissingField, OperationSpec, QueryRequest,
    RecordKey, Result, Selection, TransportError, TypeHierarchy, VariableBindings,
    ViewgraphError,
};
use viewgraph_store::{
    connection, gc, normalize_response, CommitReceipt, ConnectionSnapshot, EdgeSnapshot,
    PageInfoSnapshot, RecordStore, RetainedSelector, StoreStats, SweepStats,
};

use crate::resolver::{FragmentResolver, Resolution, ViewMemo};
use crate::subscriptions::{SubscriptionId, SubscriptionRegistry};
use crate::transport::QueryTransport;
use crate::view::{View, ViewRecord};

/// Page size used by [`ConnectionWatcher::load_more`] when the connection
/// field carries no `first`/`last` argument.
const DEFAULT_PAGE_SIZE: u64 = 10;

/// Tuning knobs for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum number of memoized fragment subtrees.
    pub view_memo_capacity: u64,
    /// How long a memoized subtree may be served. Generations already
    /// keep the memo correct; the TTL only bounds memory held by
    /// generations nothing resolves against anymore.
    pub view_memo_ttl: Duration,
    /// Interface/union implementations, for narrowing records whose
    /// abstract markers were never fetched.
    pub type_hierarchy: Option<TypeHierarchy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            view_memo_capacity: 8192,
            view_memo_ttl: Duration::from_secs(120),
            type_hierarchy: None,
        }
    }
}

impl ClientConfig {
    pub fn with_view_memo_capacity(mut self, capacity: u64) -> Self {
        self.view_memo_capacity = capacity;
        self
    }

    pub fn with_view_memo_ttl(mut self, ttl: Duration) -> Self {
        self.view_memo_ttl = ttl;
        self
    }

    pub fn with_type_hierarchy(mut self, hierarchy: TypeHierarchy) -> Self {
        self.type_hierarchy = Some(hierarchy);
        self
    }
}

/// An operation fetch that has been announced but not yet completed.
///
/// Produced by [`Client::begin_fetch`]; settled by
/// [`Client::complete_fetch`] or walked away from with
/// [`Client::abandon_fetch`].
#[derive(Debug)]
pub struct FetchTicket {
    request: QueryRequest,
    deduplicated: bool,
}

impl FetchTicket {
    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// True when an identical fetch was already in flight and this ticket
    /// joined it instead of starting another.
    pub fn is_deduplicated(&self) -> bool {
        self.deduplicated
    }
}

struct InFlightFetch {
    request: QueryRequest,
    subscribers: usize,
}

/// The normalized cache and everything that reads or writes it.
pub struct Client {
    store: RwLock<RecordStore>,
    registry: Arc<FragmentRegistry>,
    subscriptions: SubscriptionRegistry,
    transport: Arc<dyn QueryTransport>,
    retained: DashMap<u64, RetainedSelector>,
    in_flight: DashMap<u64, InFlightFetch>,
    view_memo: ViewMemo,
    hierarchy: Option<TypeHierarchy>,
    next_retention: AtomicU64,
}

impl Client {
    pub fn new(transport: Arc<dyn QueryTransport>) -> Client {
        Client::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn QueryTransport>, config: ClientConfig) -> Client {
        let view_memo = moka::sync::Cache::builder()
            .max_capacity(config.view_memo_capacity)
            .time_to_live(config.view_memo_ttl)
            .build();
        Client {
            store: RwLock::new(RecordStore::new()),
            registry: Arc::new(FragmentRegistry::new()),
            subscriptions: SubscriptionRegistry::default(),
            transport,
            retained: DashMap::new(),
            in_flight: DashMap::new(),
            view_memo,
            hierarchy: config.type_hierarchy,
            next_retention: AtomicU64::new(1),
        }
    }

    /// Registers a fragment so spreads can resolve it by name.
    pub fn register_fragment(&self, spec: FragmentSpec) -> Arc<FragmentSpec> {
        self.registry.register(spec)
    }

    pub fn fragment(&self, name: &str) -> Option<Arc<FragmentSpec>> {
        self.registry.get(name)
    }

    /// Executes an operation on the transport and commits its response.
    pub fn execute(
        &self,
        operation: &Arc<OperationSpec>,
        variables: VariableBindings,
    ) -> Result<CommitReceipt> {
        let request = QueryRequest::new(Arc::clone(operation), variables);
        let payload = self.transport.execute(&request)?;
        self.commit_payload(&request, payload)
    }

    /// Normalizes a response payload into the store as one commit.
    pub fn commit_payload(&self, request: &QueryRequest, payload: Value) -> Result<CommitReceipt> {
        let mut store = self.store.write();
        let outcome = normalize_response(
            &mut store,
            &self.registry,
            &RecordKey::root(),
            &request.operation().selections,
            request.variables(),
            &payload,
        )?;
        let receipt = store.seal_commit(outcome.written, outcome.warnings);
        for warning in &receipt.warnings {
            warn!(
                key = %warning.key,
                field = warning.field.as_str(),
                "incoming field conflicts with stored value class"
            );
        }
        // receipts apply under the write lock so staleness follows commit
        // order
        self.subscriptions.apply_receipt(&receipt);
        debug!(
            operation = request.operation_name(),
            generation = receipt.generation,
            changed = receipt.changed.len(),
            "committed response"
        );
        Ok(receipt)
    }

    /// Announces a fetch, joining an identical one when it is already in
    /// flight.
    pub fn begin_fetch(
        &self,
        operation: &Arc<OperationSpec>,
        variables: VariableBindings,
    ) -> FetchTicket {
        let request = QueryRequest::new(Arc::clone(operation), variables);
        let mut deduplicated = false;
        self.in_flight
            .entry(request.fingerprint())
            .and_modify(|fetch| {
                fetch.subscribers += 1;
                deduplicated = true;
            })
            .or_insert_with(|| InFlightFetch {
                request: request.clone(),
                subscribers: 1,
            });
        debug!(
            operation = request.operation_name(),
            fingerprint = request.fingerprint(),
            deduplicated,
            "fetch begun"
        );
        FetchTicket {
            request,
            deduplicated,
        }
    }

    /// Walks away from a fetch without settling it. When every subscriber
    /// abandons, the eventual response is discarded instead of committed.
    pub fn abandon_fetch(&self, ticket: &FetchTicket) {
        if let Some(mut fetch) = self.in_flight.get_mut(&ticket.request.fingerprint()) {
            fetch.subscribers = fetch.subscribers.saturating_sub(1);
        }
    }

    /// Settles a fetch. Returns `Ok(None)` when the fetch was already
    /// settled or nobody is left waiting for it.
    pub fn complete_fetch(
        &self,
        ticket: &FetchTicket,
        result: std::result::Result<Value, TransportError>,
    ) -> Result<Option<CommitReceipt>> {
        let Some((_, fetch)) = self.in_flight.remove(&ticket.request.fingerprint()) else {
            return Ok(None);
        };
        if fetch.subscribers == 0 {
            debug!(
                operation = ticket.request.operation_name(),
                "all subscribers abandoned the fetch, discarding response"
            );
            return Ok(None);
        }
        let payload = result?;
        self.commit_payload(&ticket.request, payload).map(Some)
    }

    /// Pins everything an operation reaches so collection keeps it.
    pub fn retain(
        self: &Arc<Self>,
        operation: &Arc<OperationSpec>,
        variables: VariableBindings,
    ) -> QueryRetention {
        let selector = RetainedSelector::operation(Arc::clone(operation), variables);
        let id = self.next_retention.fetch_add(1, Ordering::Relaxed);
        self.retained.insert(id, selector);
        QueryRetention {
            client: Arc::clone(self),
            id,
            active: true,
        }
    }

    /// Resolves a fragment and subscribes to commits that invalidate it.
    ///
    /// The watcher also acts as a GC root for everything the fragment
    /// reaches from `entity`.
    pub fn watch_fragment(
        self: &Arc<Self>,
        fragment: &Arc<FragmentSpec>,
        entity: RecordKey,
        variables: VariableBindings,
    ) -> FragmentWatcher {
        let mut variables = variables;
        variables.apply_defaults(&fragment.argument_definitions);
        let selector =
            RetainedSelector::fragment(Arc::clone(fragment), entity.clone(), variables.clone());
        let (resolution, id) = {
            let store = self.store.read();
            let resolution = self.resolve_locked(&store, fragment, &entity, &variables);
            let id = self.subscriptions.register(
                selector,
                resolution.dependencies.clone(),
                resolution.generation,
            );
            (resolution, id)
        };
        if !resolution.errors.is_empty() {
            self.subscriptions.push_errors(id, resolution.errors.clone());
        }
        FragmentWatcher {
            client: Arc::clone(self),
            id,
            fragment: Arc::clone(fragment),
            entity,
            variables,
            current: Mutex::new(resolution),
        }
    }

    /// Watches a fragment that selects a connection and exposes paging
    /// over it. `pagination` is the operation `load_more` executes; it
    /// receives the watcher's variables plus the cursor bounds.
    pub fn watch_connection(
        self: &Arc<Self>,
        fragment: &Arc<FragmentSpec>,
        entity: RecordKey,
        variables: VariableBindings,
        pagination: Arc<OperationSpec>,
    ) -> Result<ConnectionWatcher> {
        let mut variables = variables;
        variables.apply_defaults(&fragment.argument_definitions);
        let Some(field) = find_connection_field(&fragment.selections) else {
            return Err(ViewgraphError::Descriptor(format!(
                "fragment '{}' has no connection field",
                fragment.name
            )));
        };
        let connection_key = RecordKey::child_of(
            &entity,
            &connection::connection_storage_key(field, &variables),
        );
        let page_size = ["first", "last"]
            .iter()
            .find_map(|name| field.args.iter().find(|arg| arg.name() == *name))
            .and_then(|arg| arg.resolve(&variables))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let inner = self.watch_fragment(fragment, entity, variables);
        Ok(ConnectionWatcher {
            inner,
            connection_key,
            pagination,
            page_size,
        })
    }

    /// One-shot resolution without subscribing.
    pub fn resolve_fragment(
        &self,
        fragment: &Arc<FragmentSpec>,
        entity: &RecordKey,
        variables: &VariableBindings,
    ) -> Resolution {
        let store = self.store.read();
        self.resolve_locked(&store, fragment, entity, variables)
    }

    /// Sweeps every record not reachable from a retained operation or a
    /// live watcher.
    pub fn collect_garbage(&self) -> SweepStats {
        self.run_gc()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.read().stats()
    }

    /// Runs `f` against the store under the read lock.
    pub fn read_store<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        f(&self.store.read())
    }

    fn resolve_locked(
        &self,
        store: &RecordStore,
        fragment: &Arc<FragmentSpec>,
        entity: &RecordKey,
        variables: &VariableBindings,
    ) -> Resolution {
        let mut resolver =
            FragmentResolver::new(store, &self.registry).with_memo(&self.view_memo);
        if let Some(hierarchy) = &self.hierarchy {
            resolver = resolver.with_hierarchy(hierarchy);
        }
        resolver.resolve(fragment, entity, variables)
    }

    fn run_gc(&self) -> SweepStats {
        // write lock first: watchers register under the read lock, so the
        // selector set cannot move underneath the sweep
        let mut store = self.store.write();
        let mut roots: Vec<RetainedSelector> = self
            .retained
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        roots.extend(self.subscriptions.selectors());
        gc::collect(&mut store, &self.registry, &roots)
    }
}

/// Keeps an operation's subgraph alive until disposed or dropped.
pub struct QueryRetention {
    client: Arc<Client>,
    id: u64,
    active: bool,
}

impl QueryRetention {
    /// Releases the retention and sweeps whatever it alone kept alive.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.client.retained.remove(&self.id);
        self.client.run_gc();
    }
}

impl Drop for QueryRetention {
    fn drop(&mut self) {
        self.release();
    }
}

/// A live fragment resolution that knows when commits made it stale.
pub struct FragmentWatcher {
    client: Arc<Client>,
    id: SubscriptionId,
    fragment: Arc<FragmentSpec>,
    entity: RecordKey,
    variables: VariableBindings,
    current: Mutex<Resolution>,
}

impl FragmentWatcher {
    /// True when a commit since the last resolution touched a dependency.
    pub fn is_stale(&self) -> bool {
        self.client.subscriptions.is_stale(self.id)
    }

    /// Re-resolves when stale. Returns whether a refresh happened.
    pub fn refresh_if_stale(&self) -> bool {
        if !self.is_stale() {
            return false;
        }
        let resolution = {
            let store = self.client.store.read();
            let resolution =
                self.client
                    .resolve_locked(&store, &self.fragment, &self.entity, &self.variables);
            self.client.subscriptions.mark_resolved(
                self.id,
                resolution.dependencies.clone(),
                resolution.generation,
            );
            resolution
        };
        if !resolution.errors.is_empty() {
            self.client
                .subscriptions
                .push_errors(self.id, resolution.errors.clone());
        }
        *self.current.lock() = resolution;
        true
    }

    /// The current resolution's view arena.
    pub fn view(&self) -> View {
        self.current.lock().view.clone()
    }

    /// The resolved entity record, possibly partial; `None` when nothing
    /// resolved at all. Pair with [`is_missing_data`](Self::is_missing_data).
    pub fn data(&self) -> Option<Arc<ViewRecord>> {
        self.current.lock().data().cloned()
    }

    pub fn is_missing_data(&self) -> bool {
        self.current.lock().is_missing_data
    }

    pub fn generation(&self) -> u64 {
        self.current.lock().generation
    }

    pub fn dependencies(&self) -> HashSet<RecordKey> {
        self.current.lock().dependencies.clone()
    }

    pub fn missing(&self) -> Vec<MissingField> {
        self.current.lock().missing.clone()
    }

    /// Refreshes if needed, then takes every error queued since the last
    /// drain: resolution errors plus normalization warnings routed here.
    pub fn drain_errors(&self) -> Vec<ViewgraphError> {
        self.refresh_if_stale();
        self.client.subscriptions.drain_errors(self.id)
    }

    pub fn entity(&self) -> &RecordKey {
        &self.entity
    }

    pub fn fragment_name(&self) -> &str {
        &self.fragment.name
    }
}

impl Drop for FragmentWatcher {
    fn drop(&mut self) {
        self.client.subscriptions.deregister(self.id);
        self.client.run_gc();
    }
}

/// Which end of a connection to extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Forward,
    Backward,
}

/// A fragment watcher specialized to a connection field, with paging.
pub struct ConnectionWatcher {
    inner: FragmentWatcher,
    connection_key: RecordKey,
    pagination: Arc<OperationSpec>,
    page_size: u64,
}

impl ConnectionWatcher {
    pub fn edges(&self) -> Vec<EdgeSnapshot> {
        self.snapshot().edges
    }

    pub fn page_info(&self) -> PageInfoSnapshot {
        self.snapshot().page_info
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.refresh_if_stale();
        self.inner
            .client
            .read_store(|store| connection::snapshot(store, &self.connection_key))
            .unwrap_or_default()
    }

    pub fn connection_key(&self) -> &RecordKey {
        &self.connection_key
    }

    pub fn view(&self) -> View {
        self.inner.view()
    }

    pub fn data(&self) -> Option<Arc<ViewRecord>> {
        self.inner.data()
    }

    pub fn is_missing_data(&self) -> bool {
        self.inner.is_missing_data()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.is_stale()
    }

    pub fn drain_errors(&self) -> Vec<ViewgraphError> {
        self.inner.drain_errors()
    }

    /// Fetches the next page in `direction` and merges it into the
    /// connection. Returns `Ok(None)` when the stored page info says
    /// there is nothing further, or when no cursor to anchor on exists
    /// yet.
    pub fn load_more(&self, direction: PageDirection) -> Result<Option<CommitReceipt>> {
        let info = self.page_info();
        let mut variables = self.inner.variables.clone();
        match direction {
            PageDirection::Forward => {
                if !info.has_next_page {
                    return Ok(None);
                }
                let Some(cursor) = info.end_cursor else {
                    return Ok(None);
                };
                variables.unset("last");
                variables.unset("before");
                variables.set("first", json!(self.page_size));
                variables.set("after", json!(cursor));
            }
            PageDirection::Backward => {
                if !info.has_previous_page {
                    return Ok(None);
                }
                let Some(cursor) = info.start_cursor else {
                    return Ok(None);
                };
                variables.unset("first");
                variables.unset("after");
                variables.set("last", json!(self.page_size));
                variables.set("before", json!(cursor));
            }
        }
        self.inner
            .client
            .execute(&self.pagination, variables)
            .map(Some)
    }
}

/// Finds the connection field a fragment selects, looking through inline
/// fragments but not across spread boundaries.
fn find_connection_field(selections: &[Selection]) -> Option<&LinkedField> {
    for selection in selections {
        match selection {
            Selection::LinkedField(field) if field.is_connection() => return Some(field),
            Selection::InlineFragment(fragment) => {
                if let Some(field) = find_connection_field(&fragment.selections) {
                    return Some(field);
                }
            }
            _ => {}
        }
    }
    None
}
