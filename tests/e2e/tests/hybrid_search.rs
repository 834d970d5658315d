//! Hybrid retrieval across keyword and vector sources.

use engram_core::{FusionMethod, FusionOptions, HybridRequest};
use engram_e2e_tests::memory_store;

fn request(text: Option<&str>, vector: Option<Vec<f32>>, limit: usize) -> HybridRequest {
    HybridRequest {
        text: text.map(String::from),
        vector,
        limit,
        fusion: FusionOptions {
            vector_weight: 0.5,
            keyword_weight: 0.5,
            method: FusionMethod::Rrf,
            rrf_k: 60.0,
        },
        min_score: None,
        filter: None,
    }
}

/// Three entries, one query hitting both sources: RRF must put the
/// double-agreement entry first, the keyword+vector runner-up second,
/// and the vector-only straggler last.
#[test]
fn rrf_orders_by_cross_source_agreement() {
    let store = memory_store(4);
    let sqrt_half = 0.5f32.sqrt();
    store
        .insert("A", &[1.0, 0.0, 0.0, 0.0], None, Some("alpha beta"))
        .unwrap();
    store
        .insert("B", &[0.0, 1.0, 0.0, 0.0], None, Some("gamma delta"))
        .unwrap();
    store
        .insert(
            "C",
            &[sqrt_half, sqrt_half, 0.0, 0.0],
            None,
            Some("alpha gamma epsilon"),
        )
        .unwrap();

    let hits = store
        .hybrid_search(&request(Some("alpha"), Some(vec![1.0, 0.0, 0.0, 0.0]), 3))
        .unwrap();

    let order: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(order, vec!["A", "C", "B"]);
    // RRF scores are normalized: top is exactly 1
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert!(hits[1].score > hits[2].score);
}

#[test]
fn keyword_only_query_returns_bm25_order() {
    let store = memory_store(4);
    store
        .insert("short", &[1.0, 0.0, 0.0, 0.0], None, Some("signal"))
        .unwrap();
    store
        .insert(
            "long",
            &[0.0, 1.0, 0.0, 0.0],
            None,
            Some("signal surrounded with much more filler content here"),
        )
        .unwrap();

    let hits = store.hybrid_search(&request(Some("signal"), None, 5)).unwrap();
    assert_eq!(hits.len(), 2);
    // Shorter doc ranks first under BM25 length normalization
    assert_eq!(hits[0].id, "short");
}

#[test]
fn vector_only_query_matches_plain_search() {
    let store = memory_store(4);
    for (id, axis) in [("x", 0), ("y", 1), ("z", 2)] {
        let mut v = vec![0.0; 4];
        v[axis] = 1.0;
        store.insert(id, &v, None, None).unwrap();
    }
    let hits = store
        .hybrid_search(&request(None, Some(vec![0.0, 0.0, 1.0, 0.0]), 1))
        .unwrap();
    assert_eq!(hits[0].id, "z");
}

#[test]
fn empty_text_contributes_nothing() {
    let store = memory_store(4);
    store
        .insert("a", &[1.0, 0.0, 0.0, 0.0], None, Some("alpha"))
        .unwrap();
    // Stopword-only text tokenizes to nothing; the vector side carries it
    let hits = store
        .hybrid_search(&request(Some("the of"), Some(vec![1.0, 0.0, 0.0, 0.0]), 5))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "a");
}

#[test]
fn linear_and_max_methods_agree_on_clear_winner() {
    let store = memory_store(4);
    store
        .insert("win", &[1.0, 0.0, 0.0, 0.0], None, Some("target phrase"))
        .unwrap();
    store
        .insert("lose", &[0.0, 0.0, 0.0, 1.0], None, Some("unrelated"))
        .unwrap();

    for method in [FusionMethod::Linear, FusionMethod::Max] {
        let mut req = request(Some("target"), Some(vec![1.0, 0.0, 0.0, 0.0]), 2);
        req.fusion.method = method;
        let hits = store.hybrid_search(&req).unwrap();
        assert_eq!(hits[0].id, "win", "method {method:?}");
    }
}
