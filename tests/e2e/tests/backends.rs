//! Backend variants behind one contract, save/load agreement, migration.

use engram_core::{
    BackendKind, EngramError, Metric, SearchRequest, StoreOptions, open_store,
};
use engram_e2e_tests::{pseudo_vector, unit};

fn options(dim: usize, backend: BackendKind) -> StoreOptions {
    StoreOptions {
        backend,
        ..StoreOptions::new(dim)
    }
}

/// Every linked backend answers the same nearest-neighbor question.
#[test]
fn variants_agree_on_nearest() {
    for backend in [BackendKind::Auto, BackendKind::RuVector, BackendKind::Rvf] {
        let store = open_store(options(4, backend)).unwrap();
        store.insert("x", &unit(4, 0), None, None).unwrap();
        store.insert("y", &unit(4, 1), None, None).unwrap();
        store.insert("near-x", &[0.9, 0.1, 0.0, 0.0], None, None).unwrap();

        let hits = store.search(&SearchRequest::new(unit(4, 0), 2)).unwrap();
        assert_eq!(hits[0].id, "x", "backend {backend}");
        assert_eq!(hits[1].id, "near-x", "backend {backend}");
    }
}

/// The auto policy resolves to the native graph and reports capabilities.
#[test]
fn auto_detection_reports_flags() {
    let store = open_store(options(4, BackendKind::Auto)).unwrap();
    let detection = store.detection();
    assert_eq!(detection.backend, BackendKind::RuVector);
    assert!(detection.capabilities.graph);
    assert!(detection.capabilities.native);
    assert!(detection.capabilities.persistence);
}

/// Requesting a backend that is not linked carries an enabling hint.
#[cfg(not(feature = "backend-usearch"))]
#[test]
fn unavailable_backend_hints_at_feature() {
    let err = open_store(options(4, BackendKind::Hnswlib)).unwrap_err();
    match err {
        EngramError::Backend { hint, .. } => assert!(hint.contains("backend-usearch")),
        other => panic!("expected Backend error, got {other}"),
    }
}

/// R1: a saved-then-loaded store answers queries like the original.
#[test]
fn save_load_preserves_search_results() {
    let dir = tempfile::TempDir::new().unwrap();
    let store_options = StoreOptions {
        path: Some(dir.path().join("store")),
        ..StoreOptions::new(16)
    };

    let store = open_store(store_options.clone()).unwrap();
    for i in 0..50 {
        store
            .insert(&format!("v{i}"), &pseudo_vector(16, i), None, None)
            .unwrap();
    }
    let queries: Vec<Vec<f32>> = (100..105).map(|s| pseudo_vector(16, s)).collect();
    let before: Vec<Vec<String>> = queries
        .iter()
        .map(|q| {
            store
                .search(&SearchRequest::new(q.clone(), 5))
                .unwrap()
                .into_iter()
                .map(|h| h.id)
                .collect()
        })
        .collect();
    store.save(None).unwrap();
    drop(store);

    let reopened = open_store(store_options).unwrap();
    assert_eq!(reopened.count(), 50);
    for (query, expected) in queries.iter().zip(before.iter()) {
        let after: Vec<String> = reopened
            .search(&SearchRequest::new(query.clone(), 5))
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(&after, expected);
    }
}

/// Migration to the flat backend keeps every entry searchable.
#[test]
fn migrate_to_flat_backend() {
    let store = open_store(options(8, BackendKind::RuVector)).unwrap();
    for i in 0..20 {
        store
            .insert(&format!("m{i}"), &pseudo_vector(8, i), None, None)
            .unwrap();
    }
    let detection = store.migrate(BackendKind::Rvf, None).unwrap();
    assert_eq!(detection.backend, BackendKind::Rvf);
    assert!(detection.capabilities.exact);
    assert_eq!(store.count(), 20);

    let hits = store
        .search(&SearchRequest::new(pseudo_vector(8, 3), 1))
        .unwrap();
    assert_eq!(hits[0].id, "m3");
}

/// Boundary dimensions open and search.
#[test]
fn dimension_boundaries() {
    let one = open_store(options(1, BackendKind::Auto)).unwrap();
    one.insert("a", &[0.5], None, None).unwrap();
    assert_eq!(one.search(&SearchRequest::new(vec![0.5], 1)).unwrap()[0].id, "a");

    let wide = open_store(options(4096, BackendKind::Rvf)).unwrap();
    wide.insert("w", &vec![0.25; 4096], None, None).unwrap();
    assert_eq!(wide.count(), 1);

    assert!(open_store(options(0, BackendKind::Auto)).is_err());
    assert!(open_store(options(4097, BackendKind::Auto)).is_err());
}

/// Metric choices change similarity derivation, not ordering of an exact
/// match.
#[test]
fn metric_variants() {
    for metric in [Metric::Cosine, Metric::L2, Metric::InnerProduct] {
        let store = open_store(StoreOptions {
            metric,
            ..StoreOptions::new(4)
        })
        .unwrap();
        store.insert("t", &unit(4, 2), None, None).unwrap();
        store.insert("o", &unit(4, 3), None, None).unwrap();
        let hits = store.search(&SearchRequest::new(unit(4, 2), 1)).unwrap();
        assert_eq!(hits[0].id, "t", "metric {metric:?}");
    }
}
