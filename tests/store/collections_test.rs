//! Collection CRUD, filters and substring search.

use chrono::Utc;
use uuid::Uuid;

use straylight::store::{EntityFilter, KnowledgeStore, NodeFilter, StoreError};
use straylight::types::{
    Entity, EntityKind, ExampleRecord, PageNode, ParagraphKind, Relationship, Role, TocEntry,
    TocLevel,
};

fn store() -> KnowledgeStore {
    KnowledgeStore::create_disposable().expect("disposable store")
}

fn paragraph(id: &str, content: &str) -> PageNode {
    PageNode::Paragraph {
        id: id.to_owned(),
        parent_id: None,
        level: ParagraphKind::Paragraph,
        content: content.to_owned(),
        continuation: false,
    }
}

fn entity(name: &str, kind: EntityKind, doc: &str) -> Entity {
    Entity {
        id: Uuid::new_v4(),
        name: name.to_owned(),
        kind,
        description: format!("{name} appears in {doc}"),
        document_id: doc.to_owned(),
        page: Some(0),
        section: None,
        created_at: Utc::now(),
        extensions: serde_json::Map::new(),
    }
}

#[test]
fn page_node_search_is_case_insensitive_substring() {
    let store = store();
    store.append_page_nodes(
        "doc-1",
        0,
        vec![
            paragraph("n1", "The Termination clause allows sixty days notice."),
            paragraph("n2", "Payment is due in thirty days."),
        ],
    );

    let hits = store.search_page_nodes("termination", &NodeFilter::default());
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].node.id(), "n1");

    // Blank query falls back to the plain list.
    let all = store.search_page_nodes("  ", &NodeFilter::default());
    assert_eq!(all.len(), 2);
}

#[test]
fn node_filters_apply_equality() {
    let store = store();
    store.append_page_nodes("doc-1", 0, vec![paragraph("a", "alpha")]);
    store.append_page_nodes("doc-1", 1, vec![paragraph("b", "beta")]);
    store.append_page_nodes("doc-2", 0, vec![paragraph("c", "gamma")]);

    let doc1 = store.list_page_nodes(&NodeFilter {
        document_id: Some("doc-1".to_owned()),
        page: None,
    });
    assert_eq!(doc1.len(), 2);

    let doc1_p1 = store.list_page_nodes(&NodeFilter {
        document_id: Some("doc-1".to_owned()),
        page: Some(1),
    });
    assert_eq!(doc1_p1.len(), 1);
    assert_eq!(doc1_p1[0].node.id(), "b");
}

#[test]
fn document_summaries_count_pages_and_nodes() {
    let store = store();
    store.append_page_nodes("doc-1", 0, vec![paragraph("a", "x"), paragraph("b", "y")]);
    store.append_page_nodes("doc-1", 2, vec![paragraph("c", "z")]);
    store.append_toc_entries(
        "doc-1",
        vec![TocEntry {
            id: "t1".to_owned(),
            parent_id: None,
            title: "Intro".to_owned(),
            description: None,
            target_page: Some(0),
            target_section_id: None,
            level: TocLevel::L1,
        }],
    );

    let docs = store.list_documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].pages, 3); // highest page index + 1
    assert_eq!(docs[0].nodes, 3);
    assert_eq!(docs[0].toc_entries, 1);
}

#[test]
fn relationships_require_resolvable_endpoints() {
    let store = store();
    let acme = entity("Acme Corp", EntityKind::Organization, "doc-1");
    let bolt = entity("Bolt LLC", EntityKind::Party, "doc-1");
    let acme_id = acme.id;
    let bolt_id = bolt.id;
    store.append_entity(acme);
    store.append_entity(bolt);

    let good = Relationship {
        id: Uuid::new_v4(),
        kind: "supplies".to_owned(),
        source_entity_id: acme_id,
        target_entity_id: bolt_id,
        description: "Acme supplies Bolt".to_owned(),
        document_id: "doc-1".to_owned(),
        created_at: Utc::now(),
    };
    assert!(store.append_relationship(good).is_ok());

    let dangling = Relationship {
        id: Uuid::new_v4(),
        kind: "owns".to_owned(),
        source_entity_id: acme_id,
        target_entity_id: Uuid::new_v4(),
        description: "endpoint missing".to_owned(),
        document_id: "doc-1".to_owned(),
        created_at: Utc::now(),
    };
    assert!(matches!(
        store.append_relationship(dangling),
        Err(StoreError::UnresolvedEndpoint { .. })
    ));

    // Every stored relationship resolves on both ends.
    for rel in store.list_relationships(None) {
        assert!(store.get_entity(rel.source_entity_id).is_some());
        assert!(store.get_entity(rel.target_entity_id).is_some());
    }
}

#[test]
fn entity_search_and_stats() {
    let store = store();
    store.append_entity(entity("Acme Corp", EntityKind::Organization, "doc-1"));
    store.append_entity(entity("Jane Doe", EntityKind::Person, "doc-1"));
    store.append_entity(entity("Acme Holdings", EntityKind::Organization, "doc-2"));

    let hits = store.search_entities("acme", &EntityFilter::default());
    assert_eq!(hits.len(), 2);

    let orgs_doc1 = store.list_entities(&EntityFilter {
        document_id: Some("doc-1".to_owned()),
        kind: Some(EntityKind::Organization),
    });
    assert_eq!(orgs_doc1.len(), 1);

    let stats = store.entity_stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_kind.get("organization"), Some(&2));
    assert_eq!(stats.by_kind.get("person"), Some(&1));
}

#[test]
fn unverified_claims_are_capped_at_half_confidence() {
    let store = store();
    let mut claim = straylight::types::Claim::unverified("maybe".to_owned(), "q1".to_owned());
    claim.confidence = 0.9; // a buggy caller
    store.append_claim(claim);

    let stored = store.list_claims(Some("q1"));
    assert_eq!(stored.len(), 1);
    assert!(stored[0].confidence <= 0.5);
}

#[test]
fn message_history_is_append_only_and_searchable() {
    let store = store();
    store.append_message(Role::User, "what are the payment terms".to_owned(), 6, None);
    store.append_message(Role::Assistant, "net thirty days".to_owned(), 4, Some(1));
    store.append_message(Role::User, "and termination?".to_owned(), 3, None);

    assert_eq!(store.recent_messages(2).len(), 2);
    let hits = store.search_messages("payment", 10);
    assert_eq!(hits.len(), 1);

    let stats = store.history_stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_role.get("user"), Some(&2));
    assert_eq!(stats.total_tokens, 13);
}

#[test]
fn example_retrieval_caps_at_three_good_and_three_bad() {
    let store = store();
    for i in 0..10 {
        store.append_example(ExampleRecord {
            query: format!("q{i}"),
            answer: format!("a{i}"),
            score: 0.9,
            good: i % 2 == 0,
            timestamp: Utc::now(),
        });
    }
    let recent = store.recent_examples();
    let good = recent.iter().filter(|e| e.good).count();
    let bad = recent.iter().filter(|e| !e.good).count();
    assert!(good <= 3);
    assert!(bad <= 3);
    assert_eq!(recent.len(), good + bad);
}
