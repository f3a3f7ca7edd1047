use super::*;

fn entry(id: &str, embedding: Vec<f32>) -> IndexEntry {
    IndexEntry::new(Record::new(id, format!("record {}", id)), embedding)
}

fn sample_generation() -> IndexGeneration {
    IndexGeneration::build(
        1,
        vec![
            entry("a", vec![1.0, 0.0, 0.0]),
            entry("b", vec![0.0, 1.0, 0.0]),
            entry("c", vec![0.0, 0.0, 1.0]),
            entry("d", vec![1.0, 1.0, 0.0]),
        ],
    )
    .expect("should build generation")
}

#[test]
fn build_rejects_empty_input() {
    let result = IndexGeneration::build(1, Vec::new());
    assert_eq!(result.err(), Some(IndexError::EmptyInput));
}

#[test]
fn build_rejects_mixed_dimensions() {
    let result = IndexGeneration::build(
        1,
        vec![entry("a", vec![1.0, 0.0]), entry("b", vec![1.0, 0.0, 0.0])],
    );
    assert_eq!(
        result.err(),
        Some(IndexError::DimensionMismatch {
            expected: 2,
            actual: 3
        })
    );
}

#[test]
fn build_rejects_duplicate_ids() {
    let result = IndexGeneration::build(
        1,
        vec![entry("a", vec![1.0, 0.0]), entry("a", vec![0.0, 1.0])],
    );
    assert!(matches!(result, Err(IndexError::InvalidRequest(_))));
}

#[test]
fn build_rejects_non_finite_components() {
    let result = IndexGeneration::build(1, vec![entry("a", vec![f32::NAN, 0.0])]);
    assert!(matches!(result, Err(IndexError::InvalidRequest(_))));
}

#[test]
fn generation_accessors() {
    let generation = sample_generation();
    assert_eq!(generation.version(), 1);
    assert_eq!(generation.len(), 4);
    assert_eq!(generation.dimension(), 3);
    assert!(!generation.is_empty());
    assert_eq!(
        generation.record("c").map(|r| r.text.as_str()),
        Some("record c")
    );
    assert!(generation.record("missing").is_none());

    let stored = generation.embedding("d").expect("d is indexed");
    let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-6);
}

#[test]
fn exact_embedding_is_top_match() {
    let generation = sample_generation();
    for id in ["a", "b", "c", "d"] {
        let query = generation.embedding(id).expect("indexed").to_vec();
        let results = generation.search(&query, 1).expect("search succeeds");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record_id, id);
        assert_eq!(results[0].rank, 1);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }
}

#[test]
fn results_are_ranked_and_bounded() {
    let generation = sample_generation();
    let results = generation
        .search(&[1.0, 0.2, 0.0], 3)
        .expect("search succeeds");

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].record_id, "a");
    assert_eq!(results[1].record_id, "d");
    for (index, result) in results.iter().enumerate() {
        assert_eq!(result.rank, index + 1);
    }
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn ties_are_broken_by_ascending_id() {
    let generation = IndexGeneration::build(
        7,
        vec![
            entry("z", vec![1.0, 0.0]),
            entry("m", vec![2.0, 0.0]),
            entry("b", vec![0.5, 0.0]),
            entry("q", vec![0.0, 1.0]),
        ],
    )
    .expect("should build generation");

    let results = generation.search(&[1.0, 0.0], 4).expect("search succeeds");
    let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["b", "m", "z", "q"]);

    // Same answer regardless of how many are requested
    let top_two = generation.search(&[1.0, 0.0], 2).expect("search succeeds");
    let ids: Vec<&str> = top_two.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["b", "m"]);
}

#[test]
fn integer_ids_tie_break_by_value() {
    let generation = IndexGeneration::build(
        1,
        vec![
            entry("10", vec![1.0, 0.0]),
            entry("villa", vec![1.0, 0.0]),
            entry("2", vec![1.0, 0.0]),
            entry("-3", vec![1.0, 0.0]),
        ],
    )
    .expect("should build generation");

    let results = generation.search(&[1.0, 0.0], 4).expect("search succeeds");
    let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["-3", "2", "10", "villa"]);
}

#[test]
fn id_order_is_total() {
    let ids = ["10", "2", "1a", "02", "b", "-1"];
    for a in ids {
        for b in ids {
            assert_eq!(compare_ids(a, b), compare_ids(b, a).reverse());
            for c in ids {
                if compare_ids(a, b).is_le() && compare_ids(b, c).is_le() {
                    assert!(compare_ids(a, c).is_le(), "{} {} {}", a, b, c);
                }
            }
        }
    }
    assert_eq!(compare_ids("02", "2"), Ordering::Less);
}

#[test]
fn zero_k_yields_empty() {
    let generation = sample_generation();
    let results = generation.search(&[1.0, 0.0, 0.0], 0).expect("search succeeds");
    assert!(results.is_empty());
}

#[test]
fn oversized_k_returns_everything() {
    let generation = sample_generation();
    let results = generation
        .search(&[0.0, 0.0, 1.0], 100)
        .expect("search succeeds");
    assert_eq!(results.len(), generation.len());
    assert_eq!(results[0].record_id, "c");
}

#[test]
fn query_dimension_is_checked() {
    let generation = sample_generation();
    let result = generation.search(&[1.0, 0.0], 2);
    assert_eq!(
        result.err(),
        Some(IndexError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    );
}

#[test]
fn zero_query_scores_everything_equally() {
    let generation = sample_generation();
    let results = generation
        .search(&[0.0, 0.0, 0.0], 4)
        .expect("search succeeds");
    let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    assert!(results.iter().all(|r| r.score == 0.0));
}

#[test]
fn filtered_search_refills_and_reranks() {
    let generation = sample_generation();
    let results = generation
        .search_filtered(&[1.0, 0.1, 0.0], 2, |record| record.id != "a")
        .expect("search succeeds");

    let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["d", "b"]);
    assert_eq!(results[0].rank, 1);
    assert_eq!(results[1].rank, 2);
}

#[test]
fn normalize_handles_zero_vector() {
    assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    let unit = normalize(&[3.0, 4.0]);
    assert!((unit[0] - 0.6).abs() < 1e-6);
    assert!((unit[1] - 0.8).abs() < 1e-6);
}
