mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use common::{User, harness_with, id_key};
use metrics_util::debugging::DebuggingRecorder;
use repocache::cache::CacheConfig;
use repocache::repo::{Condition, RepoError, Repository};
use repocache::{Context, telemetry};

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let config = CacheConfig {
        memory_capacity: 1,
        ..Default::default()
    };
    let h = harness_with(config);
    h.repo
        .create(&[User::new(1, "ada"), User::new(2, "grace")])
        .await
        .expect("seed");
    let ctx = Context::background();

    // miss, then hit
    for _ in 0..2 {
        let _: User = h
            .conn
            .query(&ctx, &id_key(&1), |repo| async move {
                repo.filter(Condition::eq("id", 1_i64)).take().await
            })
            .await
            .expect("user");
    }

    // second key evicts the first at capacity one
    let _: User = h
        .conn
        .query(&ctx, &id_key(&2), |repo| async move {
            repo.filter(Condition::eq("id", 2_i64)).take().await
        })
        .await
        .expect("user");

    // store failure
    let _ = h
        .conn
        .query::<User, _, _>(&ctx, "cache:users:broken", |_repo| async {
            Err(RepoError::Timeout)
        })
        .await;

    // fill failure
    h.backend.fail_set.store(true, Ordering::SeqCst);
    let _ = h
        .conn
        .query::<Vec<User>, _, _>(&ctx, "cache:users:all", |repo| async move {
            repo.find().await
        })
        .await
        .expect("rows despite fill failure");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        "repocache_cache_hit_total",
        "repocache_cache_miss_total",
        "repocache_cache_evict_total",
        "repocache_store_fail_total",
        "repocache_cache_fail_total",
    ] {
        assert!(names.contains(expected), "missing metric {expected}: {names:?}");
    }
}
