//! A document staged by another live attempt blocks writers until that
//! attempt finishes; the blocked transaction retries from scratch.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::e2e_tests::helpers::TestCluster;

#[tokio::test]
async fn test_blocked_transaction_retries_after_blocker_commits() {
    let cluster = TestCluster::new();
    cluster.seed("counter", json!({"n": 0})).await;

    let blocker = cluster.attempt("blocker");
    let doc = blocker.get(&cluster.keyspace, "counter").await.unwrap();
    blocker.replace(&doc, json!({"n": 10})).await.unwrap();

    let txns = cluster.transactions();
    let calls = AtomicUsize::new(0);
    txns.run(|ctx| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        let blocker = blocker.clone();
        let ks = cluster.keyspace.clone();
        async move {
            if call == 1 {
                blocker.commit().await?;
            }
            let doc = ctx.get(&ks, "counter").await?;
            let n = doc.content()["n"].as_i64().unwrap_or_default();
            ctx.replace(&doc, json!({"n": n + 1})).await?;
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.content("counter").await, Some(json!({"n": 11})));
}

#[tokio::test]
async fn test_expired_blocker_is_overridden_without_retry() {
    let cluster = TestCluster::new();
    cluster.seed("counter", json!({"n": 0})).await;

    let blocker = cluster.attempt("blocker");
    let doc = blocker.get(&cluster.keyspace, "counter").await.unwrap();
    blocker.replace(&doc, json!({"n": 10})).await.unwrap();
    cluster.time.advance(16_000);

    let txns = cluster.transactions();
    let calls = AtomicUsize::new(0);
    txns.run(|ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let ks = cluster.keyspace.clone();
        async move {
            let doc = ctx.get(&ks, "counter").await?;
            assert_eq!(doc.content(), &json!({"n": 0}));
            ctx.replace(&doc, json!({"n": 1})).await?;
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.content("counter").await, Some(json!({"n": 1})));
}
