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

//! Cursor-connection state and page merging.
//!
//! A connection lives in the store as ordinary records:
//!
//! ```text
//! parent.__connection(<key>)(<filters>)  ->  Ref(connection record)
//! connection.edges                       ->  RefList(edge records)
//! connection.pageInfo                    ->  Ref(page-info record)
//! edge.cursor / edge.node                ->  Scalar / Ref(node)
//! ```
//!
//! Pages merge by cursor position: a forward page splices in after the edge
//! holding its `after` cursor, a backward page before its `before` cursor,
//! and a page whose anchor is unknown lands at the corresponding end. Edge
//! keys derive from node identity, so a node that is fetched twice keeps
//! its original position while its cursor and fields refresh in place -
//! which is also what makes out-of-order page arrivals commute.

use std::collections::HashSet;

use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, warn};
use viewgraph_core::{storage_key, Argument, LinkedField, RecordKey, VariableBindings};

use crate::record::{Record, StoreValue};
use crate::store::{MergeOutcome, RecordStore};

pub const EDGES: &str = "edges";
pub const NODE: &str = "node";
pub const CURSOR: &str = "cursor";
pub const PAGE_INFO: &str = "pageInfo";
pub const HAS_NEXT_PAGE: &str = "hasNextPage";
pub const HAS_PREVIOUS_PAGE: &str = "hasPreviousPage";
pub const START_CURSOR: &str = "startCursor";
pub const END_CURSOR: &str = "endCursor";

/// How an incoming page relates to the edges already in the store, derived
/// from the pagination arguments the page was fetched with.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDirection {
    /// No cursor argument: the page replaces the connection.
    Initial,
    /// Fetched with `after`: splice in after the anchor edge.
    Forward { after: String },
    /// Fetched with `before`: splice in before the anchor edge.
    Backward { before: String },
}

/// Derives the merge direction from a connection field's arguments.
pub fn merge_direction(args: &[Argument], variables: &VariableBindings) -> MergeDirection {
    let after = resolve_cursor_arg(args, variables, "after");
    let before = resolve_cursor_arg(args, variables, "before");
    match (after, before) {
        (Some(after), None) => MergeDirection::Forward { after },
        (None, Some(before)) => MergeDirection::Backward { before },
        (Some(after), Some(_)) => {
            warn!("connection fetched with both 'after' and 'before'; merging forward");
            MergeDirection::Forward { after }
        }
        (None, None) => MergeDirection::Initial,
    }
}

fn resolve_cursor_arg(
    args: &[Argument],
    variables: &VariableBindings,
    name: &str,
) -> Option<String> {
    args.iter()
        .find(|arg| arg.name() == name)
        .and_then(|arg| arg.resolve(variables))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Storage key of a connection field on its parent record.
///
/// Pagination arguments are deliberately excluded: every page of
/// `spans(first:2, after:"b")` must land on the same connection. Only the
/// directive's declared filter arguments participate, so differently
/// filtered connections stay separate.
pub fn connection_storage_key(field: &LinkedField, variables: &VariableBindings) -> String {
    let Some(directive) = &field.connection else {
        return field.storage_key(variables);
    };
    let base = format!("__connection({})", directive.key);
    let filtered: Vec<Argument> = field
        .args
        .iter()
        .filter(|arg| directive.filters.iter().any(|name| name == arg.name()))
        .cloned()
        .collect();
    storage_key(&base, &filtered, variables)
}

/// Key of an edge record, derived from the strongest identity available.
///
/// Node id first (dedup by entity), then cursor, then page position. Only
/// id- and cursor-keyed edges deduplicate across pages; position keys are a
/// last resort for id-less, cursor-less servers.
pub fn edge_key(
    connection: &RecordKey,
    node_id: Option<&str>,
    cursor: Option<&str>,
    index: usize,
) -> RecordKey {
    if let Some(id) = node_id {
        return RecordKey::child_of(connection, &format!("edge({id})"));
    }
    if let Some(cursor) = cursor {
        return RecordKey::child_of(connection, &format!("edge({cursor})"));
    }
    RecordKey::child_of(connection, &format!("edge:{index}"))
}

/// One edge of an incoming page, with its node already normalized.
#[derive(Debug, Clone)]
pub struct IncomingEdge {
    pub edge: RecordKey,
    pub node: Option<RecordKey>,
    pub cursor: Option<String>,
}

/// Presence-aware page-info fields from one payload. `None` means the
/// payload did not carry the field; a present `Value::Null` cursor is a
/// real observation and clears the endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageInfoPatch {
    pub has_next_page: Option<bool>,
    pub has_previous_page: Option<bool>,
    pub start_cursor: Option<Value>,
    pub end_cursor: Option<Value>,
}

/// Merges one page into a connection.
///
/// Writes the edge records, splices the edge list by direction, and folds
/// the page-info fields the direction owns: a forward page refreshes
/// `hasNextPage`/`endCursor`, a backward page `hasPreviousPage`/
/// `startCursor`, an initial page all four. Re-merging the same page is a
/// no-op.
pub fn merge_page(
    store: &mut RecordStore,
    connection_key: &RecordKey,
    direction: MergeDirection,
    incoming: Vec<IncomingEdge>,
    page_info: PageInfoPatch,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    // refresh edge records first so dedup and anchors see current cursors
    for edge in &incoming {
        let mut patch = Record::new();
        if let Some(cursor) = &edge.cursor {
            patch.set(CURSOR, StoreValue::Scalar(Value::String(cursor.clone())));
        }
        match &edge.node {
            Some(node) => patch.set(NODE, StoreValue::Ref(node.clone())),
            None => patch.set(NODE, StoreValue::Null),
        }
        let write = store.write(edge.edge.clone(), patch);
        outcome.absorb(edge.edge.clone(), write);
    }

    let existing: Vec<Option<RecordKey>> = store
        .get(connection_key)
        .and_then(|record| record.get(EDGES))
        .and_then(StoreValue::as_links)
        .map(<[Option<RecordKey>]>::to_vec)
        .unwrap_or_default();
    let merged = splice_edges(store, existing, &incoming, &direction);

    let page_info_key = RecordKey::child_of(connection_key, PAGE_INFO);
    let info_patch = page_info_record_patch(&direction, &page_info);
    let write = store.write(page_info_key.clone(), info_patch);
    outcome.absorb(page_info_key.clone(), write);

    let mut connection_patch = Record::new();
    connection_patch.set(EDGES, StoreValue::RefList(merged));
    connection_patch.set(PAGE_INFO, StoreValue::Ref(page_info_key));
    let write = store.write(connection_key.clone(), connection_patch);
    outcome.absorb(connection_key.clone(), write);

    debug!(
        connection = %connection_key,
        incoming = incoming.len(),
        changed = outcome.changed.len(),
        "merged connection page"
    );
    outcome
}

fn splice_edges(
    store: &RecordStore,
    existing: Vec<Option<RecordKey>>,
    incoming: &[IncomingEdge],
    direction: &MergeDirection,
) -> Vec<Option<RecordKey>> {
    if let MergeDirection::Initial = direction {
        return incoming.iter().map(|edge| Some(edge.edge.clone())).collect();
    }

    let present: HashSet<&RecordKey> = existing.iter().flatten().collect();
    let fresh: SmallVec<[Option<RecordKey>; 8]> = incoming
        .iter()
        .filter(|edge| !present.contains(&edge.edge))
        .map(|edge| Some(edge.edge.clone()))
        .collect();
    drop(present);

    let insert_at = match direction {
        MergeDirection::Forward { after } => anchor_position(store, &existing, after)
            .map(|index| index + 1)
            .unwrap_or(existing.len()),
        MergeDirection::Backward { before } => {
            anchor_position(store, &existing, before).unwrap_or(0)
        }
        MergeDirection::Initial => unreachable!("handled above"),
    };

    let mut merged = existing;
    merged.splice(insert_at..insert_at, fresh);
    merged
}

/// Index of the existing edge whose stored cursor equals `cursor`.
fn anchor_position(
    store: &RecordStore,
    existing: &[Option<RecordKey>],
    cursor: &str,
) -> Option<usize> {
    existing.iter().position(|slot| {
        slot.as_ref()
            .is_some_and(|key| edge_cursor(store, key).as_deref() == Some(cursor))
    })
}

fn edge_cursor(store: &RecordStore, edge: &RecordKey) -> Option<String> {
    store
        .get(edge)?
        .get(CURSOR)?
        .as_scalar()?
        .as_str()
        .map(str::to_owned)
}

fn page_info_record_patch(direction: &MergeDirection, info: &PageInfoPatch) -> Record {
    let mut patch = Record::new();
    let scalar_or_null = |value: &Value| {
        if value.is_null() {
            StoreValue::Null
        } else {
            StoreValue::Scalar(value.clone())
        }
    };

    let forward = matches!(direction, MergeDirection::Initial | MergeDirection::Forward { .. });
    let backward = matches!(direction, MergeDirection::Initial | MergeDirection::Backward { .. });

    if forward {
        if let Some(flag) = info.has_next_page {
            patch.set(HAS_NEXT_PAGE, StoreValue::Scalar(Value::Bool(flag)));
        }
        if let Some(cursor) = &info.end_cursor {
            patch.set(END_CURSOR, scalar_or_null(cursor));
        }
    }
    if backward {
        if let Some(flag) = info.has_previous_page {
            patch.set(HAS_PREVIOUS_PAGE, StoreValue::Scalar(Value::Bool(flag)));
        }
        if let Some(cursor) = &info.start_cursor {
            patch.set(START_CURSOR, scalar_or_null(cursor));
        }
    }
    patch
}

/// One edge as currently stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSnapshot {
    pub edge: RecordKey,
    pub cursor: Option<String>,
    pub node: Option<RecordKey>,
}

/// Page-info as currently stored; absent fields read as their zero values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageInfoSnapshot {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

/// Denormalized view of a connection's current state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub edges: Vec<EdgeSnapshot>,
    pub page_info: PageInfoSnapshot,
}

/// Reads a connection's edges and page-info out of the store. Returns
/// `None` while the connection has never been fetched.
pub fn snapshot(store: &RecordStore, connection_key: &RecordKey) -> Option<ConnectionSnapshot> {
    let record = store.get(connection_key)?;

    let edges = record
        .get(EDGES)
        .and_then(StoreValue::as_links)
        .map(|links| {
            links
                .iter()
                .flatten()
                .map(|edge| EdgeSnapshot {
                    edge: edge.clone(),
                    cursor: edge_cursor(store, edge),
                    node: store
                        .get(edge)
                        .and_then(|record| record.get(NODE))
                        .and_then(StoreValue::as_link)
                        .cloned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let page_info = record
        .get(PAGE_INFO)
        .and_then(StoreValue::as_link)
        .and_then(|key| store.get(key))
        .map(|info| {
            let flag = |field: &str| {
                info.get(field)
                    .and_then(StoreValue::as_scalar)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            };
            let cursor = |field: &str| {
                info.get(field)
                    .and_then(StoreValue::as_scalar)
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            };
            PageInfoSnapshot {
                has_next_page: flag(HAS_NEXT_PAGE),
                has_previous_page: flag(HAS_PREVIOUS_PAGE),
                start_cursor: cursor(START_CURSOR),
                end_cursor: cursor(END_CURSOR),
            }
        })
        .unwrap_or_default();

    Some(ConnectionSnapshot { edges, page_info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection() -> RecordKey {
        RecordKey::child_of(
            &RecordKey::global("project:1"),
            "__connection(SpanTable_spans)",
        )
    }

    fn page(connection: &RecordKey, ids: &[&str]) -> Vec<IncomingEdge> {
        ids.iter()
            .map(|id| IncomingEdge {
                edge: edge_key(connection, Some(id), None, 0),
                node: Some(RecordKey::global(*id)),
                cursor: Some(format!("cur:{id}")),
            })
            .collect()
    }

    fn info(
        has_next: Option<bool>,
        end: Option<&str>,
        has_prev: Option<bool>,
        start: Option<&str>,
    ) -> PageInfoPatch {
        PageInfoPatch {
            has_next_page: has_next,
            has_previous_page: has_prev,
            start_cursor: start.map(|c| json!(c)),
            end_cursor: end.map(|c| json!(c)),
        }
    }

    fn node_ids(store: &RecordStore, connection: &RecordKey) -> Vec<String> {
        snapshot(store, connection)
            .expect("connection exists")
            .edges
            .iter()
            .map(|edge| edge.node.as_ref().expect("node").as_str().to_owned())
            .collect()
    }

    #[test]
    fn test_direction_resolution() {
        let vars = VariableBindings::new().bind("cursor", json!("b"));
        let forward = vec![
            Argument::literal("first", json!(2)),
            Argument::variable("after", "cursor"),
        ];
        assert_eq!(
            merge_direction(&forward, &vars),
            MergeDirection::Forward { after: "b".into() }
        );

        let backward = vec![Argument::literal("before", json!("a"))];
        assert_eq!(
            merge_direction(&backward, &vars),
            MergeDirection::Backward { before: "a".into() }
        );

        let initial = vec![Argument::literal("first", json!(2))];
        assert_eq!(merge_direction(&initial, &vars), MergeDirection::Initial);

        // unbound cursor variable falls back to an initial load
        let unbound = vec![Argument::variable("after", "missing")];
        assert_eq!(merge_direction(&unbound, &vars), MergeDirection::Initial);
    }

    #[test]
    fn test_storage_key_ignores_pagination_args() {
        use viewgraph_core::ConnectionDirective;

        let field = LinkedField::new("spans")
            .with_args(vec![
                Argument::variable("first", "first"),
                Argument::variable("after", "after"),
                Argument::variable("filter", "filter"),
            ])
            .with_connection(ConnectionDirective::new("SpanTable_spans").with_filters(vec![
                "filter".to_string(),
            ]));

        let page_one = VariableBindings::new()
            .bind("first", json!(2))
            .bind("filter", json!("llm"));
        let page_two = VariableBindings::new()
            .bind("first", json!(2))
            .bind("after", json!("b"))
            .bind("filter", json!("llm"));
        assert_eq!(
            connection_storage_key(&field, &page_one),
            connection_storage_key(&field, &page_two)
        );
        assert_eq!(
            connection_storage_key(&field, &page_one),
            r#"__connection(SpanTable_spans)(filter:"llm")"#
        );

        // a different filter value is a different connection
        let other_filter = VariableBindings::new().bind("filter", json!("retriever"));
        assert_ne!(
            connection_storage_key(&field, &page_one),
            connection_storage_key(&field, &other_filter)
        );
    }

    #[test]
    fn test_initial_merge_then_forward_append() {
        let mut store = RecordStore::new();
        let conn = connection();

        merge_page(
            &mut store,
            &conn,
            MergeDirection::Initial,
            page(&conn, &["a", "b"]),
            info(Some(true), Some("cur:b"), Some(false), Some("cur:a")),
        );
        assert_eq!(node_ids(&store, &conn), vec!["a", "b"]);

        merge_page(
            &mut store,
            &conn,
            MergeDirection::Forward { after: "cur:b".into() },
            page(&conn, &["c", "d"]),
            info(Some(false), Some("cur:d"), None, None),
        );
        assert_eq!(node_ids(&store, &conn), vec!["a", "b", "c", "d"]);

        let snap = snapshot(&store, &conn).expect("connection");
        assert!(!snap.page_info.has_next_page);
        assert_eq!(snap.page_info.end_cursor.as_deref(), Some("cur:d"));
        // backward endpoints were owned by the initial page and survive
        assert!(!snap.page_info.has_previous_page);
        assert_eq!(snap.page_info.start_cursor.as_deref(), Some("cur:a"));
    }

    #[test]
    fn test_backward_prepend() {
        let mut store = RecordStore::new();
        let conn = connection();

        merge_page(
            &mut store,
            &conn,
            MergeDirection::Initial,
            page(&conn, &["c", "d"]),
            info(Some(false), Some("cur:d"), Some(true), Some("cur:c")),
        );
        merge_page(
            &mut store,
            &conn,
            MergeDirection::Backward { before: "cur:c".into() },
            page(&conn, &["a", "b"]),
            info(None, None, Some(false), Some("cur:a")),
        );

        assert_eq!(node_ids(&store, &conn), vec!["a", "b", "c", "d"]);
        let snap = snapshot(&store, &conn).expect("connection");
        assert!(!snap.page_info.has_previous_page);
        assert_eq!(snap.page_info.start_cursor.as_deref(), Some("cur:a"));
        assert_eq!(snap.page_info.end_cursor.as_deref(), Some("cur:d"));
    }

    #[test]
    fn test_duplicate_edge_keeps_position_and_refreshes_cursor() {
        let mut store = RecordStore::new();
        let conn = connection();

        merge_page(
            &mut store,
            &conn,
            MergeDirection::Initial,
            page(&conn, &["a", "b", "c"]),
            PageInfoPatch::default(),
        );

        // "b" comes back in a later page with a rotated cursor
        let mut refetch = page(&conn, &["b", "d"]);
        refetch[0].cursor = Some("cur:b2".into());
        merge_page(
            &mut store,
            &conn,
            MergeDirection::Forward { after: "cur:c".into() },
            refetch,
            PageInfoPatch::default(),
        );

        assert_eq!(node_ids(&store, &conn), vec!["a", "b", "c", "d"]);
        let snap = snapshot(&store, &conn).expect("connection");
        assert_eq!(snap.edges[1].cursor.as_deref(), Some("cur:b2"));
    }

    #[test]
    fn test_unknown_anchor_lands_at_the_end() {
        let mut store = RecordStore::new();
        let conn = connection();

        merge_page(
            &mut store,
            &conn,
            MergeDirection::Initial,
            page(&conn, &["a", "b"]),
            PageInfoPatch::default(),
        );
        // anchor "cur:z" was never stored: forward page appends
        merge_page(
            &mut store,
            &conn,
            MergeDirection::Forward { after: "cur:z".into() },
            page(&conn, &["e"]),
            PageInfoPatch::default(),
        );
        // and a backward page with an unknown anchor prepends
        merge_page(
            &mut store,
            &conn,
            MergeDirection::Backward { before: "cur:y".into() },
            page(&conn, &["x"]),
            PageInfoPatch::default(),
        );
        assert_eq!(node_ids(&store, &conn), vec!["x", "a", "b", "e"]);
    }

    #[test]
    fn test_out_of_order_forward_pages_commute() {
        let conn = connection();
        let initial = || (MergeDirection::Initial, page(&conn, &["a", "b"]));
        let p1 = || {
            (
                MergeDirection::Forward { after: "cur:b".into() },
                page(&conn, &["c", "d"]),
            )
        };
        let p2 = || {
            (
                MergeDirection::Forward { after: "cur:d".into() },
                page(&conn, &["e", "f"]),
            )
        };

        let mut in_order = RecordStore::new();
        for (direction, edges) in [initial(), p1(), p2()] {
            merge_page(&mut in_order, &conn, direction, edges, PageInfoPatch::default());
        }

        let mut out_of_order = RecordStore::new();
        for (direction, edges) in [initial(), p2(), p1()] {
            merge_page(
                &mut out_of_order,
                &conn,
                direction,
                edges,
                PageInfoPatch::default(),
            );
        }

        let expected = vec!["a", "b", "c", "d", "e", "f"];
        assert_eq!(node_ids(&in_order, &conn), expected);
        assert_eq!(node_ids(&out_of_order, &conn), expected);
    }

    #[test]
    fn test_forward_and_backward_pages_commute() {
        let conn = connection();
        let initial = || (MergeDirection::Initial, page(&conn, &["m", "n"]));
        let forward = || {
            (
                MergeDirection::Forward { after: "cur:n".into() },
                page(&conn, &["o"]),
            )
        };
        let backward = || {
            (
                MergeDirection::Backward { before: "cur:m".into() },
                page(&conn, &["k", "l"]),
            )
        };

        let mut fwd_first = RecordStore::new();
        for (direction, edges) in [initial(), forward(), backward()] {
            merge_page(&mut fwd_first, &conn, direction, edges, PageInfoPatch::default());
        }
        let mut bwd_first = RecordStore::new();
        for (direction, edges) in [initial(), backward(), forward()] {
            merge_page(&mut bwd_first, &conn, direction, edges, PageInfoPatch::default());
        }

        let expected = vec!["k", "l", "m", "n", "o"];
        assert_eq!(node_ids(&fwd_first, &conn), expected);
        assert_eq!(node_ids(&bwd_first, &conn), expected);
    }

    #[test]
    fn test_remerging_a_page_is_a_noop() {
        let mut store = RecordStore::new();
        let conn = connection();

        merge_page(
            &mut store,
            &conn,
            MergeDirection::Initial,
            page(&conn, &["a", "b"]),
            info(Some(true), Some("cur:b"), None, None),
        );
        let first = merge_page(
            &mut store,
            &conn,
            MergeDirection::Forward { after: "cur:b".into() },
            page(&conn, &["c"]),
            info(Some(false), Some("cur:c"), None, None),
        );
        assert!(!first.changed.is_empty());

        let again = merge_page(
            &mut store,
            &conn,
            MergeDirection::Forward { after: "cur:b".into() },
            page(&conn, &["c"]),
            info(Some(false), Some("cur:c"), None, None),
        );
        assert!(again.changed.is_empty());
        assert!(again.warnings.is_empty());
        assert_eq!(node_ids(&store, &conn), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_before_any_fetch_is_none() {
        let store = RecordStore::new();
        assert!(snapshot(&store, &connection()).is_none());
    }

    #[test]
    fn test_edge_key_identity_preference() {
        let conn = connection();
        let by_id = edge_key(&conn, Some("span:1"), Some("cur:1"), 0);
        assert!(by_id.as_str().ends_with("edge(span:1)"));

        let by_cursor = edge_key(&conn, None, Some("cur:1"), 0);
        assert!(by_cursor.as_str().ends_with("edge(cur:1)"));

        let by_index = edge_key(&conn, None, None, 3);
        assert!(by_index.as_str().ends_with("edge:3"));
    }
}
