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

//! End-to-end flows through the client facade: fetch, watch, page,
//! retain, collect.

use std::sync::Arc;

use serde_json::{json, Value};
use viewgraph_client::{Client, PageDirection, StaticTransport, ViewgraphError};
use viewgraph_core::{
    Argument, ConnectionDirective, FragmentSpec, FragmentSpread, LinkedField, OperationSpec,
    RecordKey, Selection, VariableBindings, VariableDefinition,
};

fn harness() -> (Arc<Client>, Arc<StaticTransport>) {
    let transport = Arc::new(StaticTransport::new());
    let client = Arc::new(Client::new(transport.clone()));
    (client, transport)
}

/// `TraceQuery($id)`: one trace with its root span.
fn trace_query() -> Arc<OperationSpec> {
    Arc::new(
        OperationSpec::new("TraceQuery")
            .with_argument(VariableDefinition::new("id"))
            .with_selections(vec![Selection::LinkedField(
                LinkedField::new("trace")
                    .with_args(vec![Argument::variable("id", "id")])
                    .with_selections(vec![
                        Selection::scalar("id"),
                        Selection::scalar("__typename"),
                        Selection::scalar("name"),
                        Selection::LinkedField(LinkedField::new("rootSpan").with_selections(
                            vec![
                                Selection::scalar("id"),
                                Selection::scalar("__typename"),
                                Selection::scalar("label"),
                            ],
                        )),
                    ]),
            )]),
    )
}

fn trace_payload(trace_id: &str, name: &str, span_id: &str, label: &str) -> Value {
    json!({
        "trace": {
            "id": trace_id,
            "__typename": "Trace",
            "name": name,
            "rootSpan": {"id": span_id, "__typename": "Span", "label": label}
        }
    })
}

fn fetch_trace(
    client: &Arc<Client>,
    transport: &StaticTransport,
    query: &Arc<OperationSpec>,
    trace_id: &str,
    name: &str,
    span_id: &str,
    label: &str,
) {
    let variables = VariableBindings::new().bind("id", json!(trace_id));
    transport.stage_response(
        query,
        variables.clone(),
        trace_payload(trace_id, name, span_id, label),
    );
    client.execute(query, variables).expect("commit");
}

#[test]
fn test_watchers_track_commits_in_dependency_scope() {
    let (client, transport) = harness();
    let query = trace_query();
    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root");

    let fragment = client.register_fragment(
        FragmentSpec::new("TraceHeader", "Trace").with_selections(vec![Selection::scalar("name")]),
    );
    let watcher =
        client.watch_fragment(&fragment, RecordKey::global("t1"), VariableBindings::new());
    assert!(!watcher.is_stale());
    let before = watcher.data().expect("resolved");
    assert_eq!(before.string("name"), Some("checkout"));

    // a commit touching the watched record marks the watcher stale while
    // the view already handed out stays immutable
    fetch_trace(&client, &transport, &query, "t1", "checkout v2", "s1", "root");
    assert!(watcher.is_stale());
    assert_eq!(before.string("name"), Some("checkout"));

    assert!(watcher.refresh_if_stale());
    assert!(!watcher.is_stale());
    assert_eq!(
        watcher.data().expect("resolved").string("name"),
        Some("checkout v2")
    );

    // a commit entirely outside the dependency set leaves it fresh
    fetch_trace(&client, &transport, &query, "t2", "other", "s9", "root");
    assert!(!watcher.is_stale());
    assert!(!watcher.refresh_if_stale());
}

#[test]
fn test_watchers_share_memoized_subtrees() {
    let (client, transport) = harness();
    let query = trace_query();
    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root");

    client.register_fragment(
        FragmentSpec::new("SpanRow", "Span").with_selections(vec![Selection::scalar("label")]),
    );
    let by_root_span = client.register_fragment(
        FragmentSpec::new("TraceRootSpan", "Trace").with_selections(vec![Selection::LinkedField(
            LinkedField::new("rootSpan").with_selections(vec![Selection::FragmentSpread(
                FragmentSpread::new("SpanRow"),
            )]),
        )]),
    );
    let by_detail = client.register_fragment(
        FragmentSpec::new("TraceDetail", "Trace").with_selections(vec![
            Selection::scalar("name"),
            Selection::LinkedField(LinkedField::new("rootSpan").with_selections(vec![
                Selection::FragmentSpread(FragmentSpread::new("SpanRow")),
            ])),
        ]),
    );

    let entity = RecordKey::global("t1");
    let first = client.watch_fragment(&by_root_span, entity.clone(), VariableBindings::new());
    let second = client.watch_fragment(&by_detail, entity.clone(), VariableBindings::new());
    let third = client.watch_fragment(&by_root_span, entity, VariableBindings::new());

    // same fragment, same entity, same variables: the whole resolution is
    // shared
    assert!(Arc::ptr_eq(
        &first.data().expect("resolved"),
        &third.data().expect("resolved"),
    ));

    // different enclosing fragments still share the spread subtree
    let span_key = RecordKey::global("s1");
    let first_view = first.view();
    let second_view = second.view();
    let from_first = first_view.record(&span_key).expect("span in first view");
    let from_second = second_view.record(&span_key).expect("span in second view");
    assert!(Arc::ptr_eq(from_first, from_second));

    // a commit on the shared record invalidates every holder
    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root v2");
    assert!(first.is_stale());
    assert!(second.is_stale());
    assert!(third.is_stale());
    assert!(first.refresh_if_stale());
    assert_eq!(
        first.view().record(&span_key).expect("span").string("label"),
        Some("root v2")
    );
}

/// Shared selection shape for the `spans` connection field.
fn spans_selections() -> Vec<Selection> {
    vec![
        Selection::LinkedField(LinkedField::new("edges").plural().with_selections(vec![
            Selection::scalar("cursor"),
            Selection::LinkedField(LinkedField::new("node").with_selections(vec![
                Selection::scalar("id"),
                Selection::scalar("__typename"),
                Selection::scalar("label"),
            ])),
        ])),
        Selection::LinkedField(LinkedField::new("pageInfo").with_selections(vec![
            Selection::scalar("hasNextPage"),
            Selection::scalar("endCursor"),
        ])),
    ]
}

/// `TraceSpansQuery($id, $first, $after)`: one page of a trace's spans.
fn spans_query() -> Arc<OperationSpec> {
    Arc::new(
        OperationSpec::new("TraceSpansQuery")
            .with_argument(VariableDefinition::new("id"))
            .with_argument(VariableDefinition::new("first").with_default(json!(2)))
            .with_argument(VariableDefinition::new("after"))
            .with_selections(vec![Selection::LinkedField(
                LinkedField::new("trace")
                    .with_args(vec![Argument::variable("id", "id")])
                    .with_selections(vec![
                        Selection::scalar("id"),
                        Selection::scalar("__typename"),
                        Selection::LinkedField(
                            LinkedField::new("spans")
                                .with_args(vec![
                                    Argument::variable("first", "first"),
                                    Argument::variable("after", "after"),
                                ])
                                .with_connection(ConnectionDirective::new("TraceSpans_spans"))
                                .with_selections(spans_selections()),
                        ),
                    ]),
            )]),
    )
}

fn spans_fragment() -> FragmentSpec {
    FragmentSpec::new("TraceSpans", "Trace")
        .with_argument(VariableDefinition::new("count").with_default(json!(2)))
        .with_argument(VariableDefinition::new("cursor"))
        .with_selections(vec![Selection::LinkedField(
            LinkedField::new("spans")
                .with_args(vec![
                    Argument::variable("first", "count"),
                    Argument::variable("after", "cursor"),
                ])
                .with_connection(ConnectionDirective::new("TraceSpans_spans"))
                .with_selections(spans_selections()),
        )])
}

fn span_page(ids: &[(&str, &str)], has_next: bool) -> Value {
    let edges: Vec<Value> = ids
        .iter()
        .map(|(id, cursor)| {
            json!({
                "cursor": cursor,
                "node": {"id": id, "__typename": "Span", "label": format!("span {id}")}
            })
        })
        .collect();
    let end_cursor = ids.last().map(|(_, cursor)| json!(cursor)).unwrap_or(Value::Null);
    json!({
        "trace": {
            "id": "t1",
            "__typename": "Trace",
            "spans": {
                "edges": edges,
                "pageInfo": {"hasNextPage": has_next, "endCursor": end_cursor}
            }
        }
    })
}

#[test]
fn test_connection_watcher_pages_forward_to_exhaustion() {
    let (client, transport) = harness();
    let query = spans_query();
    let initial_vars = VariableBindings::new().bind("id", json!("t1"));
    transport.stage_response(
        &query,
        initial_vars.clone(),
        span_page(&[("s1", "c1"), ("s2", "c2")], true),
    );
    client.execute(&query, initial_vars).expect("initial page");

    let fragment = client.register_fragment(spans_fragment());
    let watcher = client
        .watch_connection(
            &fragment,
            RecordKey::global("t1"),
            VariableBindings::new().bind("id", json!("t1")),
            query.clone(),
        )
        .expect("fragment selects a connection");

    assert_eq!(
        watcher.connection_key().as_str(),
        "t1:__connection(TraceSpans_spans)"
    );
    let edges = watcher.edges();
    assert_eq!(edges.len(), 2);
    assert_eq!(edges[0].node, Some(RecordKey::global("s1")));
    assert_eq!(edges[1].cursor.as_deref(), Some("c2"));
    assert!(watcher.page_info().has_next_page);

    // the next page rides the watcher's variables plus the cursor bounds
    let page_vars = VariableBindings::new()
        .bind("id", json!("t1"))
        .bind("count", json!(2))
        .bind("first", json!(2))
        .bind("after", json!("c2"));
    transport.stage_response(&query, page_vars, span_page(&[("s3", "c3"), ("s4", "c4")], false));

    let receipt = watcher
        .load_more(PageDirection::Forward)
        .expect("page fetch")
        .expect("a page was fetched");
    assert!(!receipt.is_noop());

    let edges = watcher.edges();
    assert_eq!(edges.len(), 4);
    let nodes: Vec<_> = edges
        .iter()
        .map(|edge| edge.node.as_ref().map(RecordKey::as_str).unwrap_or(""))
        .collect();
    assert_eq!(nodes, vec!["s1", "s2", "s3", "s4"]);
    assert!(!watcher.page_info().has_next_page);
    assert_eq!(watcher.page_info().end_cursor.as_deref(), Some("c4"));

    // exhausted: no further fetch is attempted
    assert!(watcher
        .load_more(PageDirection::Forward)
        .expect("no fetch")
        .is_none());
    assert_eq!(transport.pending(), 0);
}

#[test]
fn test_refetched_pages_deduplicate_by_node() {
    let (client, transport) = harness();
    let query = spans_query();
    let initial_vars = VariableBindings::new().bind("id", json!("t1"));
    transport.stage_response(
        &query,
        initial_vars.clone(),
        span_page(&[("s1", "c1"), ("s2", "c2")], true),
    );
    client.execute(&query, initial_vars.clone()).expect("initial page");

    // the server resends s2 (fresher cursor) along with s3
    let page_vars = VariableBindings::new()
        .bind("id", json!("t1"))
        .bind("first", json!(2))
        .bind("after", json!("c2"));
    transport.stage_response(
        &query,
        page_vars.clone(),
        span_page(&[("s2", "c2b"), ("s3", "c3")], false),
    );
    client.execute(&query, page_vars).expect("overlapping page");

    let fragment = client.register_fragment(spans_fragment());
    let watcher = client
        .watch_connection(
            &fragment,
            RecordKey::global("t1"),
            VariableBindings::new().bind("id", json!("t1")),
            query.clone(),
        )
        .expect("fragment selects a connection");

    let edges = watcher.edges();
    let nodes: Vec<_> = edges
        .iter()
        .map(|edge| edge.node.as_ref().map(RecordKey::as_str).unwrap_or(""))
        .collect();
    assert_eq!(nodes, vec!["s1", "s2", "s3"]);
    // the resent edge kept its position and refreshed its cursor
    assert_eq!(edges[1].cursor.as_deref(), Some("c2b"));
}

#[test]
fn test_released_retentions_let_records_collect() {
    let (client, transport) = harness();
    let query = trace_query();
    let vars_first = VariableBindings::new().bind("id", json!("t1"));
    let vars_second = VariableBindings::new().bind("id", json!("t2"));

    let hold_first = client.retain(&query, vars_first.clone());
    let hold_second = client.retain(&query, vars_second.clone());
    // both traces share the same root span
    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root");
    fetch_trace(&client, &transport, &query, "t2", "billing", "s1", "root");
    assert_eq!(client.store_stats().record_count, 4);

    // releasing one sweeps its exclusive records; the shared span stays
    hold_first.dispose();
    assert_eq!(client.store_stats().record_count, 3);
    client.read_store(|store| {
        assert!(store.get(&RecordKey::global("t1")).is_none());
        assert!(store.get(&RecordKey::global("t2")).is_some());
        assert!(store.get(&RecordKey::global("s1")).is_some());
    });

    // releasing the last retention leaves only the root
    hold_second.dispose();
    assert_eq!(client.store_stats().record_count, 1);
}

#[test]
fn test_live_watchers_retain_their_subgraph() {
    let (client, transport) = harness();
    let query = trace_query();
    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root");

    let fragment = client.register_fragment(
        FragmentSpec::new("TraceRootSpan", "Trace").with_selections(vec![Selection::LinkedField(
            LinkedField::new("rootSpan").with_selections(vec![Selection::scalar("label")]),
        )]),
    );
    let watcher =
        client.watch_fragment(&fragment, RecordKey::global("t1"), VariableBindings::new());

    // nothing is retained except the watcher, which anchors t1 and s1
    let stats = client.collect_garbage();
    assert_eq!(stats.swept, 0);
    assert_eq!(client.store_stats().record_count, 3);

    drop(watcher);
    assert_eq!(client.store_stats().record_count, 1);
}

#[test]
fn test_merge_conflicts_reach_dependent_watchers() {
    let (client, transport) = harness();
    let query = trace_query();
    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root");

    let fragment = client.register_fragment(
        FragmentSpec::new("TraceHeader", "Trace").with_selections(vec![Selection::scalar("name")]),
    );
    let watcher =
        client.watch_fragment(&fragment, RecordKey::global("t1"), VariableBindings::new());
    assert!(watcher.drain_errors().is_empty());

    // a second operation sends `name` as an object where a scalar lives
    let conflicting = Arc::new(
        OperationSpec::new("TraceNameObjectQuery")
            .with_argument(VariableDefinition::new("id"))
            .with_selections(vec![Selection::LinkedField(
                LinkedField::new("trace")
                    .with_args(vec![Argument::variable("id", "id")])
                    .with_selections(vec![
                        Selection::scalar("id"),
                        Selection::LinkedField(
                            LinkedField::new("name")
                                .with_selections(vec![Selection::scalar("id")]),
                        ),
                    ]),
            )]),
    );
    let variables = VariableBindings::new().bind("id", json!("t1"));
    transport.stage_response(
        &conflicting,
        variables.clone(),
        json!({"trace": {"id": "t1", "name": {"id": "n1"}}}),
    );
    let receipt = client.execute(&conflicting, variables).expect("commit");
    assert_eq!(receipt.warnings.len(), 1);

    let errors = watcher.drain_errors();
    assert!(errors
        .iter()
        .any(|error| matches!(error, ViewgraphError::Normalization(_))));
    // the refresh also sees the now-mismatched stored shape
    assert!(errors
        .iter()
        .any(|error| matches!(error, ViewgraphError::TypeMismatch { .. })));
    assert!(watcher.drain_errors().is_empty());
}

#[test]
fn test_fetch_commits_while_any_subscriber_remains() {
    let (client, _) = harness();
    let query = trace_query();
    let variables = VariableBindings::new().bind("id", json!("t1"));

    let first = client.begin_fetch(&query, variables.clone());
    let second = client.begin_fetch(&query, variables);
    assert!(second.is_deduplicated());

    client.abandon_fetch(&second);
    let receipt = client
        .complete_fetch(&first, Ok(trace_payload("t1", "checkout", "s1", "root")))
        .expect("commit")
        .expect("one subscriber remains");
    assert_eq!(receipt.generation, 1);
}

#[test]
fn test_watching_before_fetching_converges_after_the_commit() {
    let (client, transport) = harness();
    let query = trace_query();

    let fragment = client.register_fragment(
        FragmentSpec::new("TraceHeader", "Trace").with_selections(vec![Selection::scalar("name")]),
    );
    let watcher =
        client.watch_fragment(&fragment, RecordKey::global("t1"), VariableBindings::new());
    assert!(watcher.is_missing_data());
    assert!(watcher.data().is_none());

    fetch_trace(&client, &transport, &query, "t1", "checkout", "s1", "root");
    assert!(watcher.is_stale());
    assert!(watcher.refresh_if_stale());
    assert_eq!(
        watcher.data().expect("resolved").string("name"),
        Some("checkout")
    );
}
