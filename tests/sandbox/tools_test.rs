//! Store-backed tool bindings as seen from sandboxed code.

use std::sync::Arc;

use straylight::sandbox::value::Value;
use straylight::sandbox::Sandbox;
use straylight::store::KnowledgeStore;
use straylight::types::{PageNode, ParagraphKind, Role};

fn seeded_store() -> Arc<KnowledgeStore> {
    let store = KnowledgeStore::create_disposable().expect("store");
    store.append_page_nodes(
        "doc-1",
        0,
        vec![
            PageNode::Section {
                id: "s1".to_owned(),
                parent_id: None,
                description: "Payment terms".to_owned(),
            },
            PageNode::Paragraph {
                id: "p1".to_owned(),
                parent_id: Some("s1".to_owned()),
                level: ParagraphKind::Paragraph,
                content: format!(
                    "Invoices are payable net thirty (30) days. {}",
                    "Additional boilerplate follows. ".repeat(20)
                ),
                continuation: false,
            },
        ],
    );
    store.append_message(Role::User, "earlier question about payment".to_owned(), 5, None);
    Arc::new(store)
}

fn get_map(value: &Value) -> &std::collections::BTreeMap<String, Value> {
    match value {
        Value::Map(map) => map,
        other => panic!("expected map, got {other:?}"),
    }
}

#[test]
fn search_page_nodes_finds_content() {
    let mut sandbox = Sandbox::new(seeded_store(), "q1");
    let outcome = sandbox.run("(count (search-page-nodes \"net thirty\"))");
    assert_eq!(outcome.result, Value::Int(1));
}

#[test]
fn listing_truncates_long_content_but_get_returns_it_whole() {
    let store = seeded_store();
    let full_len = store
        .get_page_node("p1")
        .expect("node")
        .node
        .content_text()
        .expect("content")
        .chars()
        .count();
    assert!(full_len > 200, "fixture long enough to truncate");

    let mut sandbox = Sandbox::new(store, "q1");

    let listed = sandbox.run("(count (get (first (list-page-nodes \"doc-1\")) \"node\"))");
    assert!(listed.error.is_none());

    // Listed content is capped at 200 chars (plus ellipsis).
    let outcome = sandbox.run(
        "(count (get (get (first (search-page-nodes \"net thirty\")) \"node\") \"content\"))",
    );
    let Value::Int(listed_len) = outcome.result else {
        panic!("expected int, got {:?}", outcome.result);
    };
    assert!(listed_len <= 203, "listing shows truncated content");

    // get-page-node returns full text.
    let outcome = sandbox.run("(count (get (get (get-page-node \"p1\") \"node\") \"content\"))");
    let Value::Int(got_len) = outcome.result else {
        panic!("expected int, got {:?}", outcome.result);
    };
    assert_eq!(got_len, i64::try_from(full_len).expect("fits"));
}

#[test]
fn learnings_round_trip_through_tools() {
    let mut sandbox = Sandbox::new(seeded_store(), "q1");

    let stored = sandbox.run("(def l (store-learning \"check the TOC first\" \"navigation\"))");
    assert!(stored.error.is_none());

    let found = sandbox.run("(count (search-learnings \"toc\"))");
    assert_eq!(found.result, Value::Int(1));

    // Vote it down enough times to decay it, through the tool surface.
    let decayed = sandbox.run(
        "(def lid (get l \"id\"))\n\
         (vote-learning lid false) (vote-learning lid false) (vote-learning lid false)\n\
         (vote-learning lid false) (vote-learning lid false) (vote-learning lid false)\n\
         (count (search-learnings \"toc\"))",
    );
    assert_eq!(decayed.result, Value::Int(0));

    let stats = sandbox.run("(learning-stats)");
    let map = get_map(&stats.result);
    assert_eq!(map.get("decayed"), Some(&Value::Int(1)));
}

#[test]
fn history_tools_read_the_message_log() {
    let mut sandbox = Sandbox::new(seeded_store(), "q1");
    let outcome = sandbox.run("(count (get-history 10))");
    assert_eq!(outcome.result, Value::Int(1));
    let outcome = sandbox.run("(count (search-history \"payment\" 10))");
    assert_eq!(outcome.result, Value::Int(1));
    let outcome = sandbox.run("(get (history-stats) \"total\")");
    assert_eq!(outcome.result, Value::Int(1));
}

#[test]
fn locals_are_summarised_in_listing_but_returned_whole() {
    let mut sandbox = Sandbox::new(seeded_store(), "q1");
    sandbox.run("(def big (range 50))");
    sandbox.run("(def small [1 2 3])");

    let listing = sandbox.run("(list-locals)");
    let map = get_map(&listing.result);

    // Large collections collapse to a summary map.
    let big_entry = get_map(map.get("big").expect("big listed"));
    assert_eq!(big_entry.get("count"), Some(&Value::Int(50)));
    assert!(big_entry.contains_key("preview"));

    // Small ones are shown as-is.
    assert!(matches!(map.get("small"), Some(Value::List(items)) if items.len() == 3));

    // get-local always returns the full value.
    let full = sandbox.run("(count (get-local \"big\"))");
    assert_eq!(full.result, Value::Int(50));
}

#[test]
fn tool_results_compose_with_builtins() {
    let mut sandbox = Sandbox::new(seeded_store(), "q1");
    let outcome = sandbox.run(
        "(map (fn [n] (get (get n \"node\") \"id\")) (list-page-nodes \"doc-1\" 0))",
    );
    let Value::List(ids) = outcome.result else {
        panic!("expected list, got {:?}", outcome.result);
    };
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&Value::Str("s1".to_owned())));
}

#[test]
fn entity_tools_report_empty_stats_on_a_fresh_store() {
    let mut sandbox = Sandbox::new(seeded_store(), "q1");
    let outcome = sandbox.run("(get (entity-stats) \"total\")");
    assert_eq!(outcome.result, Value::Int(0));
    let outcome = sandbox.run("(list-entities)");
    assert_eq!(outcome.result, Value::List(Vec::new()));
}
