//! Logic that fails after staging leaves no trace of its writes.

use serde_json::json;

use crate::atr::AttemptState;
use crate::e2e_tests::helpers::{LastAttempt, TestCluster};
use crate::error::{AttemptError, TransactionError};

#[tokio::test]
async fn test_error_after_two_inserts_rolls_back() {
    let cluster = TestCluster::new();
    let txns = cluster.transactions();
    let last = LastAttempt::default();

    let err = txns
        .run(|ctx| {
            last.record(&ctx);
            let ks = cluster.keyspace.clone();
            async move {
                ctx.insert(&ks, "flight", json!({"seat": "1A"})).await?;
                ctx.insert(&ks, "hotel", json!({"room": 12})).await?;
                Err(AttemptError::application("payment declined"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Failed { .. }), "{err:?}");
    assert_eq!(cluster.content("flight").await, None);
    assert_eq!(cluster.content("hotel").await, None);

    let ctx = last.get();
    assert_eq!(ctx.state(), AttemptState::RolledBack);
    let atr = ctx.atr().unwrap();
    assert_eq!(cluster.atr_state(&atr, ctx.attempt_id()), Some(json!("ROLLED_BACK")));
}

#[tokio::test]
async fn test_explicit_rollback_restores_replaced_document() {
    let cluster = TestCluster::new();
    cluster.seed("hotel", json!({"rooms": 3})).await;
    let txns = cluster.transactions();

    let result = txns
        .run(|ctx| {
            let ks = cluster.keyspace.clone();
            async move {
                let hotel = ctx.get(&ks, "hotel").await?;
                ctx.replace(&hotel, json!({"rooms": 0})).await?;
                ctx.rollback().await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    assert!(!result.unstaging_complete);
    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 3})));
    assert!(
        cluster
            .kv
            .xattr(&cluster.keyspace, "hotel", crate::doc::TXN_XATTR)
            .is_none()
    );
}
