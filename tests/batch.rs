mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{User, email_key, harness, harness_with, id_key};
use repocache::cache::CacheConfig;
use repocache::repo::{Condition, MemoryRepository, RepoError, Repository, TxHandle, Value};
use repocache::{BatchOptions, ConnError, Context};

fn users(ids: std::ops::RangeInclusive<i64>) -> Vec<User> {
    ids.map(|id| User::new(id, &format!("user{id}"))).collect()
}

#[tokio::test]
async fn batch_create_inserts_everything_and_invalidates_once() {
    let h = harness();
    let ctx = Context::background();
    let rows = users(1..=5);

    h.conn
        .batch_create(
            &ctx,
            &rows,
            BatchOptions::new()
                .with_batch_size(2)
                .with_clean_keys(["cache:users:list".to_string()]),
        )
        .await
        .expect("batch create");

    assert_eq!(h.repo.snapshot(), rows);
    let calls = h.backend.delete_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 11);
    assert!(calls[0].contains(&id_key(&3)));
    assert!(calls[0].contains(&email_key("user5@example.com")));
    assert!(calls[0].contains(&"cache:users:list".to_string()));
}

#[tokio::test]
async fn failing_chunk_rolls_back_the_whole_batch() {
    let h = harness();
    h.repo.create(&[User::new(5, "existing")]).await.expect("seed");
    let ctx = Context::background();

    let err = h
        .conn
        .batch_create(&ctx, &users(1..=5), BatchOptions::new().with_batch_size(2))
        .await
        .expect_err("duplicate in last chunk");

    assert!(matches!(err, ConnError::Store(RepoError::Duplicate { .. })));
    assert_eq!(h.repo.snapshot(), vec![User::new(5, "existing")]);
    assert!(h.backend.delete_calls().is_empty());
}

#[tokio::test]
async fn external_transaction_is_left_to_the_caller() {
    let h = harness();
    let ctx = Context::background();
    let tx = h.repo.begin().await.expect("begin");

    h.conn
        .batch_create(&ctx, &users(1..=3), BatchOptions::new().with_tx(tx.clone()))
        .await
        .expect("batch create");

    assert!(h.repo.snapshot().is_empty());
    assert!(!tx.is_finished());
    assert_eq!(h.backend.delete_calls().len(), 1);

    tx.commit().await.expect("commit");
    assert_eq!(h.repo.snapshot().len(), 3);
}

#[tokio::test]
async fn batch_update_applies_each_row() {
    let h = harness();
    let ctx = Context::background();
    h.repo.create(&users(1..=3)).await.expect("seed");

    let renamed: Vec<User> = users(1..=3)
        .into_iter()
        .map(|user| User {
            name: format!("{}-renamed", user.name),
            ..user
        })
        .collect();

    h.conn
        .batch_update(
            &ctx,
            &renamed,
            |repo: MemoryRepository<User>, user| async move { repo.save(&[user]).await },
            BatchOptions::new(),
        )
        .await
        .expect("batch update");

    assert_eq!(h.repo.snapshot(), renamed);
    assert_eq!(h.backend.delete_calls().len(), 1);
}

#[tokio::test]
async fn batch_delete_soft_deletes_each_row() {
    let h = harness();
    let ctx = Context::background();
    let rows = users(1..=4);
    h.repo.create(&rows).await.expect("seed");

    h.conn
        .batch_delete(
            &ctx,
            &rows[..2],
            |repo: MemoryRepository<User>, user| async move {
                repo.delete(&[user]).await.map(drop)
            },
            BatchOptions::new(),
        )
        .await
        .expect("batch delete");

    assert_eq!(h.repo.count().await.expect("count"), 2);
    assert_eq!(h.repo.unscoped().count().await.expect("count"), 4);
}

#[tokio::test]
async fn batch_create_custom_sees_chunks() {
    let h = harness();
    let ctx = Context::background();
    let chunks = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&chunks);
    h.conn
        .batch_create_custom(
            &ctx,
            &users(1..=5),
            move |repo: MemoryRepository<User>, chunk: Vec<User>| {
                seen.lock().expect("chunks lock").push(chunk.len());
                async move { repo.create(&chunk).await }
            },
            BatchOptions::new().with_batch_size(2),
        )
        .await
        .expect("custom create");

    assert_eq!(*chunks.lock().expect("chunks lock"), vec![2, 2, 1]);
    assert_eq!(h.repo.snapshot().len(), 5);
}

#[tokio::test]
async fn exec_batch_invalidates_clean_keys() {
    let h = harness();
    let ctx = Context::background();
    h.repo.create(&users(1..=3)).await.expect("seed");

    let deleted = h
        .conn
        .exec_batch(
            &ctx,
            |repo: MemoryRepository<User>| async move {
                repo.filter(repocache::repo::Condition::le("id", 2_i64))
                    .delete_matching()
                    .await
            },
            BatchOptions::new().with_clean_keys([id_key(&1), id_key(&2), id_key(&1)]),
        )
        .await
        .expect("exec batch");

    assert_eq!(deleted, 2);
    assert_eq!(h.backend.delete_calls(), vec![vec![id_key(&1), id_key(&2)]]);
}

#[tokio::test]
async fn empty_batch_touches_nothing() {
    let h = harness();
    h.conn
        .batch_create(&Context::background(), &[], BatchOptions::new())
        .await
        .expect("empty batch");

    assert!(h.repo.snapshot().is_empty());
    assert!(h.backend.delete_calls().is_empty());
}

#[tokio::test]
async fn concurrent_write_survives_batch_commit() {
    let h = harness();
    let ctx = Context::background();
    h.repo.create(&[User::new(1, "ada")]).await.expect("seed");
    let renamed = User {
        name: "ada-renamed".to_string(),
        ..User::new(1, "ada")
    };

    let batch = h.conn.batch_update(
        &ctx,
        std::slice::from_ref(&renamed),
        |repo: MemoryRepository<User>, user| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            repo.save(&[user]).await
        },
        BatchOptions::new(),
    );
    let insert = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.conn
            .exec(
                &ctx,
                |repo| async move { repo.create(&[User::new(2, "grace")]).await },
                &[id_key(&2)],
            )
            .await
    };
    let (batched, inserted) = tokio::join!(batch, insert);
    batched.expect("batch update");
    inserted.expect("insert");

    let mut rows = h.repo.snapshot();
    rows.sort_by_key(|user| user.id);
    assert_eq!(rows, vec![renamed, User::new(2, "grace")]);
}

#[tokio::test]
async fn configured_batch_size_applies_without_explicit_size() {
    let h = harness_with(CacheConfig {
        batch_size: 2,
        ..Default::default()
    });
    let ctx = Context::background();
    let chunks = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&chunks);
    h.conn
        .batch_create_custom(
            &ctx,
            &users(1..=5),
            move |repo: MemoryRepository<User>, chunk: Vec<User>| {
                seen.lock().expect("chunks lock").push(chunk.len());
                async move { repo.create(&chunk).await }
            },
            BatchOptions::new(),
        )
        .await
        .expect("custom create");

    assert_eq!(*chunks.lock().expect("chunks lock"), vec![2, 2, 1]);
}

#[tokio::test]
async fn batch_update_with_partial_columns() {
    let h = harness();
    let ctx = Context::background();
    h.repo.create(&users(1..=3)).await.expect("seed");

    h.conn
        .batch_update(
            &ctx,
            &users(1..=2),
            |repo: MemoryRepository<User>, user| async move {
                repo.filter(Condition::eq("id", user.id))
                    .update_column("name", Value::from(format!("{}!", user.name)))
                    .await
                    .map(drop)
            },
            BatchOptions::new(),
        )
        .await
        .expect("batch update");

    let names: Vec<String> = h.repo.snapshot().into_iter().map(|user| user.name).collect();
    assert_eq!(names, ["user1!", "user2!", "user3"]);
    assert_eq!(h.backend.delete_calls().len(), 1);
}

#[tokio::test]
async fn batch_update_failing_midway_rolls_back_everything() {
    let h = harness();
    let ctx = Context::background();
    let rows = users(1..=4);
    h.repo.create(&rows).await.expect("seed");

    let err = h
        .conn
        .batch_update(
            &ctx,
            &rows,
            |repo: MemoryRepository<User>, user| async move {
                if user.id == 3 {
                    return Err(RepoError::invalid_input("row 3 rejected"));
                }
                repo.filter(Condition::eq("id", user.id))
                    .update_column("name", Value::from("changed"))
                    .await
                    .map(drop)
            },
            BatchOptions::new().with_batch_size(2),
        )
        .await
        .expect_err("third row fails");

    assert!(matches!(err, ConnError::Store(RepoError::InvalidInput { .. })));
    assert_eq!(h.repo.snapshot(), rows);
    assert!(h.backend.delete_calls().is_empty());
}

#[tokio::test]
async fn batch_delete_failing_midway_rolls_back_everything() {
    let h = harness();
    let ctx = Context::background();
    let rows = users(1..=4);
    h.repo.create(&rows).await.expect("seed");

    let err = h
        .conn
        .batch_delete(
            &ctx,
            &rows,
            |repo: MemoryRepository<User>, user| async move {
                if user.id == 3 {
                    return Err(RepoError::Timeout);
                }
                repo.delete(&[user]).await.map(drop)
            },
            BatchOptions::new(),
        )
        .await
        .expect_err("third row fails");

    assert!(matches!(err, ConnError::Store(RepoError::Timeout)));
    assert_eq!(h.repo.count().await.expect("count"), 4);
    assert!(h.backend.delete_calls().is_empty());
}

#[tokio::test]
async fn batch_create_custom_failing_chunk_rolls_back_earlier_chunks() {
    let h = harness();
    let ctx = Context::background();
    let calls = Arc::new(Mutex::new(0));

    let seen = Arc::clone(&calls);
    let err = h
        .conn
        .batch_create_custom(
            &ctx,
            &users(1..=5),
            move |repo: MemoryRepository<User>, chunk: Vec<User>| {
                let call = {
                    let mut calls = seen.lock().expect("calls lock");
                    *calls += 1;
                    *calls
                };
                async move {
                    if call == 2 {
                        return Err(RepoError::invalid_input("second chunk rejected"));
                    }
                    repo.create(&chunk).await
                }
            },
            BatchOptions::new().with_batch_size(2),
        )
        .await
        .expect_err("second chunk fails");

    assert!(matches!(err, ConnError::Store(RepoError::InvalidInput { .. })));
    assert_eq!(*calls.lock().expect("calls lock"), 2);
    assert!(h.repo.snapshot().is_empty());
    assert!(h.backend.delete_calls().is_empty());
}
