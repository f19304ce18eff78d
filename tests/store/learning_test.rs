//! Learning decay and retrieval exclusion.

use straylight::store::KnowledgeStore;

fn store() -> KnowledgeStore {
    KnowledgeStore::create_disposable().expect("disposable store")
}

#[test]
fn fresh_learnings_are_retrievable_by_substring() {
    let store = store();
    store.store_learning(
        "Always check the TOC before scanning pages".to_owned(),
        Some("navigation".to_owned()),
    );
    store.store_learning("Prefer exact quotes for citations".to_owned(), None);

    assert_eq!(store.search_learnings("toc", 10).len(), 1);
    assert_eq!(store.search_learnings("", 10).len(), 2);
    // Context text is searchable too.
    assert_eq!(store.search_learnings("navigation", 10).len(), 1);
}

#[test]
fn vote_sequence_decays_and_hides_the_learning() {
    let store = store();
    let learning = store.store_learning("skim headers first".to_owned(), None);

    // useful, then not-useful x5, then one more not-useful.
    store.vote_learning(learning.id, true).expect("vote");
    for _ in 0..5 {
        store.vote_learning(learning.id, false).expect("vote");
    }
    let after = store.vote_learning(learning.id, false).expect("vote");

    assert!(after.decayed);
    assert_eq!(after.useful_count, 1);
    assert_eq!(after.not_useful_count, 6);
    // Hidden from every retrieval path, matching query or not.
    assert!(store.search_learnings("skim", 10).is_empty());
    assert!(store.search_learnings("", 10).is_empty());
}

#[test]
fn decay_is_monotone_within_a_process() {
    let store = store();
    let learning = store.store_learning("x".to_owned(), None);
    for _ in 0..6 {
        store.vote_learning(learning.id, false).expect("vote");
    }
    assert!(store
        .vote_learning(learning.id, false)
        .expect("vote")
        .decayed);

    // A flood of late positive votes cannot restore it.
    for _ in 0..50 {
        let after = store.vote_learning(learning.id, true).expect("vote");
        assert!(after.decayed);
    }
    assert!(store.search_learnings("", 10).is_empty());
}

#[test]
fn below_threshold_votes_do_not_decay() {
    let store = store();
    let learning = store.store_learning("y".to_owned(), None);
    // 4 votes total: under the 5-vote floor even though all negative.
    for _ in 0..4 {
        let after = store.vote_learning(learning.id, false).expect("vote");
        assert!(!after.decayed);
    }
    assert_eq!(store.search_learnings("", 10).len(), 1);
}

#[test]
fn applied_counter_and_stats() {
    let store = store();
    let a = store.store_learning("a".to_owned(), None);
    let b = store.store_learning("b".to_owned(), None);

    store.record_learning_applied(a.id).expect("applied");
    store.record_learning_applied(a.id).expect("applied");
    store.vote_learning(a.id, true).expect("vote");
    store.vote_learning(b.id, false).expect("vote");

    let stats = store.learning_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.decayed, 0);
    assert_eq!(stats.useful_votes, 1);
    assert_eq!(stats.not_useful_votes, 1);
    assert_eq!(stats.applied, 2);
}

#[test]
fn voting_an_unknown_learning_is_not_found() {
    let store = store();
    assert!(store.vote_learning(uuid::Uuid::new_v4(), true).is_err());
}
