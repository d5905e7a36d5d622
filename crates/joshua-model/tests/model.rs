//! Model-level coverage of the ensemble lifecycle and result protocol
//! against the embedded backend.

use std::time::Duration;

use joshua_kv::{Database, MemoryDatabase, RangeOptions, Subspace, Transaction};
use joshua_model::{
    acquire_run, agent_failures, create, delete, list, log_agent_failure, queue_depth,
    read_package, resume, stop, stop_username, submit_result, CompletedRun, EnsembleId,
    EnsembleProperties, ExitClass, IndexKind, Layout, ListFilter, ResultTail, TailMode,
    CHUNK_BYTES, UPLOAD_TXN_BYTES,
};

fn bounded(max_runs: u64) -> EnsembleProperties {
    EnsembleProperties {
        max_runs,
        username: Some("tester".into()),
        ..Default::default()
    }
}

async fn subspace_len(db: &MemoryDatabase, space: &Subspace) -> usize {
    let mut tx = db.begin().await.unwrap();
    let (start, end) = space.range();
    tx.get_range(&start, &end, RangeOptions::snapshot())
        .await
        .unwrap()
        .len()
}

async fn indexed(db: &MemoryDatabase, layout: &Layout, kind: IndexKind, id: EnsembleId) -> bool {
    let mut tx = db.begin().await.unwrap();
    tx.get(&layout.index_key(kind, id)).await.unwrap().is_some()
}

fn passing_run(secs: u64, output: &[u8]) -> CompletedRun {
    CompletedRun {
        class: ExitClass::Pass,
        elapsed: Duration::from_secs(secs),
        output: output.to_vec(),
    }
}

fn failing_run(output: &[u8]) -> CompletedRun {
    CompletedRun {
        class: ExitClass::Fail,
        elapsed: Duration::from_secs(1),
        output: output.to_vec(),
    }
}

#[tokio::test]
async fn create_then_list_shows_properties_and_zero_counters() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(6), b"package").await.unwrap();

    let listed = list(&db, &layout, &ListFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].properties.max_runs, 6);
    assert_eq!(listed[0].properties.username.as_deref(), Some("tester"));
    assert!(listed[0].properties.submitted.is_some());
    assert_eq!(listed[0].counters.started, 0);
    assert_eq!(listed[0].counters.ended, 0);
}

#[tokio::test]
async fn submission_order_matches_id_order() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let first = create(&db, &layout, &bounded(1), b"a").await.unwrap();
    let second = create(&db, &layout, &bounded(1), b"b").await.unwrap();
    let third = create(&db, &layout, &bounded(1), b"c").await.unwrap();
    assert!(first < second && second < third);

    let listed = list(&db, &layout, &ListFilter::default()).await.unwrap();
    let ids: Vec<EnsembleId> = listed.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![first, second, third]);
}

#[tokio::test]
async fn package_roundtrips_across_chunk_and_transaction_boundaries() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();

    // Larger than the per-transaction upload budget, so the create path
    // splits across transactions; not a multiple of the chunk size, so
    // the final chunk is short.
    let big: Vec<u8> = (0..UPLOAD_TXN_BYTES + CHUNK_BYTES / 2 + 13)
        .map(|i| (i % 251) as u8)
        .collect();
    let id = create(&db, &layout, &bounded(1), &big).await.unwrap();
    let back = read_package(&db, &layout, id).await.unwrap();
    assert_eq!(back, big);
}

#[tokio::test]
async fn compressed_package_roundtrips() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let properties = EnsembleProperties {
        compressed: true,
        ..bounded(1)
    };
    let body = b"compressible ".repeat(10_000);
    let id = create(&db, &layout, &properties, &body).await.unwrap();
    assert_eq!(read_package(&db, &layout, id).await.unwrap(), body);
}

#[tokio::test]
async fn chunked_create_leaves_no_pending_marker() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let big = vec![7u8; UPLOAD_TXN_BYTES + 1];
    let id = create(&db, &layout, &bounded(1), &big).await.unwrap();

    let mut tx = db.begin().await.unwrap();
    assert!(tx.get(&layout.pending_key(id)).await.unwrap().is_none());
    let listed = list(&db, &layout, &ListFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_marks_the_ensemble() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    assert!(stop(&db, &layout, id).await.unwrap());
    assert!(!indexed(&db, &layout, IndexKind::Active, id).await);
    assert!(!indexed(&db, &layout, IndexKind::Sanity, id).await);

    // Second stop is a no-op.
    assert!(!stop(&db, &layout, id).await.unwrap());

    let stopped = list(
        &db,
        &layout,
        &ListFilter {
            stopped: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(stopped.len(), 1);
    assert!(stopped[0].properties.stopped.is_some());
}

#[tokio::test]
async fn stop_by_username_only_touches_that_owner() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let mine = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();
    let theirs = create(
        &db,
        &layout,
        &EnsembleProperties {
            username: Some("someone-else".into()),
            ..bounded(0)
        },
        b"pkg",
    )
    .await
    .unwrap();

    let stopped = stop_username(&db, &layout, "tester").await.unwrap();
    assert_eq!(stopped, vec![mine]);
    assert!(!indexed(&db, &layout, IndexKind::Active, mine).await);
    assert!(indexed(&db, &layout, IndexKind::Active, theirs).await);
}

#[tokio::test]
async fn resume_reindexes_a_stopped_ensemble_once() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();
    stop(&db, &layout, id).await.unwrap();

    assert!(resume(&db, &layout, id).await.unwrap());
    assert!(indexed(&db, &layout, IndexKind::Active, id).await);
    assert!(!resume(&db, &layout, id).await.unwrap());
}

#[tokio::test]
async fn delete_clears_every_subspace() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(6), b"package bytes").await.unwrap();
    submit_result(&db, &layout, id, &passing_run(1, b"out"))
        .await
        .unwrap();

    assert!(delete(&db, &layout, id).await.unwrap());
    assert_eq!(subspace_len(&db, &layout.properties_of(id)).await, 0);
    assert_eq!(subspace_len(&db, &layout.counters_of(id)).await, 0);
    assert_eq!(subspace_len(&db, &layout.package_of(id)).await, 0);
    assert_eq!(subspace_len(&db, &layout.results_of(id)).await, 0);
    assert!(!indexed(&db, &layout, IndexKind::Active, id).await);
    assert!(!indexed(&db, &layout, IndexKind::Sanity, id).await);

    // Idempotent.
    assert!(!delete(&db, &layout, id).await.unwrap());
}

#[tokio::test]
async fn submit_result_advances_counters_atomically() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    let outcome = submit_result(&db, &layout, id, &passing_run(2, b"hello\n"))
        .await
        .unwrap();
    assert!(outcome.recorded);
    assert!(!outcome.retired);
    assert_eq!(outcome.counters.started, 1);
    assert_eq!(outcome.counters.ended, 1);
    assert_eq!(outcome.counters.pass, 1);
    assert_eq!(outcome.counters.fail, 0);
    assert!(outcome.counters.runtime >= 2);
    assert_eq!(
        outcome.counters.ended,
        outcome.counters.pass + outcome.counters.fail
    );
}

#[tokio::test]
async fn long_runs_land_in_the_five_minute_buckets() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    submit_result(&db, &layout, id, &passing_run(301, b""))
        .await
        .unwrap();
    let outcome = submit_result(
        &db,
        &layout,
        id,
        &CompletedRun {
            class: ExitClass::Fail,
            elapsed: Duration::from_secs(400),
            output: Vec::new(),
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.counters.pass_5min, 1);
    assert_eq!(outcome.counters.fail_5min, 1);
    assert!(
        outcome.counters.runtime
            >= 300 * (outcome.counters.pass_5min + outcome.counters.fail_5min)
    );
}

#[tokio::test]
async fn max_runs_retires_the_ensemble() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(2), b"pkg").await.unwrap();

    let first = submit_result(&db, &layout, id, &passing_run(1, b""))
        .await
        .unwrap();
    assert!(!first.retired);
    assert!(indexed(&db, &layout, IndexKind::Active, id).await);

    let second = submit_result(&db, &layout, id, &passing_run(1, b""))
        .await
        .unwrap();
    assert!(second.retired);
    assert!(!indexed(&db, &layout, IndexKind::Active, id).await);
    assert_eq!(second.counters.ended, 2);
}

#[tokio::test]
async fn fail_fast_retires_after_exactly_that_many_failures() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let properties = EnsembleProperties {
        fail_fast: 3,
        ..bounded(0)
    };
    let id = create(&db, &layout, &properties, b"pkg").await.unwrap();

    for expected_retired in [false, false, true] {
        let outcome = submit_result(&db, &layout, id, &failing_run(b"boom"))
            .await
            .unwrap();
        assert_eq!(outcome.retired, expected_retired);
    }
    let outcome = submit_result(&db, &layout, id, &failing_run(b"late"))
        .await
        .unwrap();
    // A straggler that outlived retirement is dropped, keeping the
    // fail bound exact.
    assert!(!outcome.recorded);
    assert!(outcome.retired);
    assert_eq!(outcome.counters.fail, 3);
    assert_eq!(outcome.counters.pass, 0);
}

#[tokio::test]
async fn stragglers_never_push_ended_past_max_runs() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(1), b"pkg").await.unwrap();

    let first = submit_result(&db, &layout, id, &passing_run(1, b""))
        .await
        .unwrap();
    assert!(first.recorded && first.retired);

    let second = submit_result(&db, &layout, id, &passing_run(1, b""))
        .await
        .unwrap();
    assert!(!second.recorded);
    assert_eq!(second.counters.ended, 1);

    let mut tail = ResultTail::new(&db, &layout, id, TailMode::All);
    assert!(tail.next().await.unwrap().is_some());
    assert!(tail.next().await.unwrap().is_none());
}

#[tokio::test]
async fn stopped_unbounded_ensembles_still_record_inflight_results() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();
    stop(&db, &layout, id).await.unwrap();

    // The run was in flight when the user stopped the ensemble; its
    // result still lands and the counters stay meaningful.
    let outcome = submit_result(&db, &layout, id, &passing_run(1, b"late but real"))
        .await
        .unwrap();
    assert!(outcome.recorded);
    assert_eq!(outcome.counters.ended, 1);
}

#[tokio::test]
async fn reports_against_a_deleted_ensemble_are_noops() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();
    delete(&db, &layout, id).await.unwrap();

    let outcome = submit_result(&db, &layout, id, &passing_run(1, b"ghost"))
        .await
        .unwrap();
    assert!(!outcome.recorded);
    assert_eq!(subspace_len(&db, &layout.results_of(id)).await, 0);
    assert_eq!(subspace_len(&db, &layout.counters_of(id)).await, 0);
}

#[tokio::test]
async fn identical_runs_produce_distinct_rows() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    submit_result(&db, &layout, id, &passing_run(1, b"same output"))
        .await
        .unwrap();
    submit_result(&db, &layout, id, &passing_run(1, b"same output"))
        .await
        .unwrap();

    let mut tail = ResultTail::new(&db, &layout, id, TailMode::All);
    let first = tail.next().await.unwrap().unwrap();
    let second = tail.next().await.unwrap().unwrap();
    assert!(tail.next().await.unwrap().is_none());
    assert_ne!(first.token, second.token);
}

#[tokio::test]
async fn tail_yields_latest_first_and_filters_errors() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    submit_result(&db, &layout, id, &passing_run(1, b"first"))
        .await
        .unwrap();
    submit_result(&db, &layout, id, &failing_run(b"second"))
        .await
        .unwrap();
    submit_result(&db, &layout, id, &passing_run(1, b"third"))
        .await
        .unwrap();

    let mut tail = ResultTail::new(&db, &layout, id, TailMode::All);
    let mut outputs = Vec::new();
    while let Some(row) = tail.next().await.unwrap() {
        outputs.push(row.output);
    }
    assert_eq!(outputs, vec![b"third".to_vec(), b"second".to_vec(), b"first".to_vec()]);

    let mut errors = ResultTail::new(&db, &layout, id, TailMode::ErrorsOnly);
    let row = errors.next().await.unwrap().unwrap();
    assert_eq!(row.class, ExitClass::Fail);
    assert_eq!(row.output, b"second");
    assert!(errors.next().await.unwrap().is_none());
}

#[tokio::test]
async fn tail_reassembles_multi_chunk_output() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    let noisy: Vec<u8> = (0..CHUNK_BYTES * 2 + 77).map(|i| (i % 200) as u8).collect();
    submit_result(&db, &layout, id, &passing_run(1, &noisy))
        .await
        .unwrap();

    let mut tail = ResultTail::new(&db, &layout, id, TailMode::Raw);
    let row = tail.next().await.unwrap().unwrap();
    assert_eq!(row.output, noisy);
}

#[tokio::test]
async fn compressed_outputs_roundtrip_through_tail() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let properties = EnsembleProperties {
        compressed: true,
        ..bounded(0)
    };
    let id = create(&db, &layout, &properties, b"pkg").await.unwrap();
    let output = b"log line\n".repeat(5_000);
    submit_result(&db, &layout, id, &passing_run(1, &output))
        .await
        .unwrap();

    let mut tail = ResultTail::new(&db, &layout, id, TailMode::Raw);
    assert_eq!(tail.next().await.unwrap().unwrap().output, output);
}

#[tokio::test]
async fn acquire_run_abandons_once_the_ensemble_leaves_the_index() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let id = create(&db, &layout, &bounded(0), b"pkg").await.unwrap();

    let prepared = acquire_run(&db, &layout, id, IndexKind::Active)
        .await
        .unwrap()
        .expect("active ensemble is acquirable");
    assert_eq!(prepared.package, b"pkg");

    stop(&db, &layout, id).await.unwrap();
    assert!(acquire_run(&db, &layout, id, IndexKind::Active)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn sanity_ensembles_use_the_sanity_index() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let properties = EnsembleProperties {
        sanity: true,
        ..bounded(0)
    };
    let id = create(&db, &layout, &properties, b"pkg").await.unwrap();

    assert!(indexed(&db, &layout, IndexKind::Sanity, id).await);
    assert!(!indexed(&db, &layout, IndexKind::Active, id).await);
    assert!(list(&db, &layout, &ListFilter::default()).await.unwrap().is_empty());
    let sanity = list(
        &db,
        &layout,
        &ListFilter {
            sanity: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(sanity.len(), 1);
}

#[tokio::test]
async fn queue_depth_counts_the_requested_index() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    create(&db, &layout, &bounded(0), b"a").await.unwrap();
    create(&db, &layout, &bounded(0), b"b").await.unwrap();
    create(
        &db,
        &layout,
        &EnsembleProperties {
            sanity: true,
            ..bounded(0)
        },
        b"c",
    )
    .await
    .unwrap();

    assert_eq!(queue_depth(&db, &layout, IndexKind::Active).await.unwrap(), 2);
    assert_eq!(queue_depth(&db, &layout, IndexKind::Sanity).await.unwrap(), 1);
}

#[tokio::test]
async fn desired_agents_counts_remaining_bounded_runs() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    let bounded_id = create(&db, &layout, &bounded(5), b"a").await.unwrap();
    create(&db, &layout, &bounded(0), b"b").await.unwrap();

    submit_result(&db, &layout, bounded_id, &passing_run(1, b""))
        .await
        .unwrap();
    submit_result(&db, &layout, bounded_id, &passing_run(1, b""))
        .await
        .unwrap();

    // 5 - 2 remaining for the bounded ensemble, plus 1 for the unbounded.
    assert_eq!(
        joshua_model::desired_agents(&db, &layout).await.unwrap(),
        4
    );
}

#[tokio::test]
async fn failure_log_roundtrips() {
    let db = MemoryDatabase::new();
    let layout = Layout::default();
    log_agent_failure(&db, &layout, "agent-7", "cannot create work dir")
        .await
        .unwrap();
    log_agent_failure(&db, &layout, "agent-9", "spawn failed")
        .await
        .unwrap();

    let failures = agent_failures(&db, &layout, None).await.unwrap();
    assert_eq!(failures.len(), 2);
    let hosts: Vec<&str> = failures.iter().map(|f| f.hostname.as_str()).collect();
    assert!(hosts.contains(&"agent-7") && hosts.contains(&"agent-9"));
}
