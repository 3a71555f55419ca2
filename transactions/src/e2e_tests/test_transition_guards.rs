//! Commit and rollback are each final: the other is refused afterwards.

use serde_json::json;

use crate::atr::AttemptState;
use crate::e2e_tests::helpers::{LastAttempt, TestCluster};
use crate::error::ErrorClass;

#[tokio::test]
async fn test_rollback_after_commit_is_refused() {
    let cluster = TestCluster::new();
    let txns = cluster.transactions();
    let last = LastAttempt::default();

    txns.run(|ctx| {
        last.record(&ctx);
        let ks = cluster.keyspace.clone();
        async move {
            ctx.insert(&ks, "a", json!(1)).await?;
            ctx.commit().await?;
            let err = ctx.rollback().await.unwrap_err();
            assert_eq!(err.class(), ErrorClass::FailOther);
            assert!(!err.auto_rollback());
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(last.get().state(), AttemptState::Completed);
    assert_eq!(cluster.content("a").await, Some(json!(1)));
}

#[tokio::test]
async fn test_commit_after_rollback_is_refused() {
    let cluster = TestCluster::new();
    let txns = cluster.transactions();
    let last = LastAttempt::default();

    txns.run(|ctx| {
        last.record(&ctx);
        let ks = cluster.keyspace.clone();
        async move {
            ctx.insert(&ks, "a", json!(1)).await?;
            ctx.rollback().await?;
            let err = ctx.commit().await.unwrap_err();
            assert_eq!(err.class(), ErrorClass::FailOther);
            assert!(!err.auto_rollback());
            assert!(ctx.insert(&ks, "b", json!(2)).await.is_err());
            Ok(())
        }
    })
    .await
    .unwrap();

    let ctx = last.get();
    assert_eq!(ctx.state(), AttemptState::RolledBack);
    assert_eq!(
        cluster.atr_state(&ctx.atr().unwrap(), ctx.attempt_id()),
        Some(json!("ROLLED_BACK"))
    );
    assert_eq!(cluster.content("a").await, None);
    assert_eq!(cluster.content("b").await, None);
}
