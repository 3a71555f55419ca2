//! A transaction mixing inserts, replaces and removes commits atomically.

use serde_json::json;

use crate::atr::AttemptState;
use crate::doc::TXN_XATTR;
use crate::e2e_tests::helpers::{LastAttempt, TestCluster};

#[tokio::test]
async fn test_mixed_transaction_commits() {
    let cluster = TestCluster::new();
    cluster.seed("hotel", json!({"rooms": 3})).await;
    cluster.seed("waitlist", json!({"guest": "ann"})).await;
    let txns = cluster.transactions();
    let last = LastAttempt::default();

    let result = txns
        .run(|ctx| {
            last.record(&ctx);
            let cluster = &cluster;
            async move {
                let ks = &cluster.keyspace;
                ctx.insert(ks, "booking", json!({"guest": "ann"})).await?;
                let hotel = ctx.get(ks, "hotel").await?;
                ctx.replace(&hotel, json!({"rooms": 2})).await?;
                let waitlist = ctx.get(ks, "waitlist").await?;
                ctx.remove(&waitlist).await?;

                // Nothing is visible outside the transaction yet.
                assert_eq!(cluster.content("booking").await, None);
                assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 3})));
                assert!(cluster.content("waitlist").await.is_some());

                // Own writes are visible inside it.
                let booking = ctx.get(ks, "booking").await?;
                assert_eq!(booking.content(), &json!({"guest": "ann"}));
                assert!(ctx.get_optional(ks, "waitlist").await?.is_none());
                Ok(())
            }
        })
        .await
        .unwrap();

    assert!(result.unstaging_complete);
    assert_eq!(cluster.content("booking").await, Some(json!({"guest": "ann"})));
    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 2})));
    assert_eq!(cluster.content("waitlist").await, None);
    for id in ["booking", "hotel"] {
        assert!(cluster.kv.xattr(&cluster.keyspace, id, TXN_XATTR).is_none(), "{id}");
    }

    let ctx = last.get();
    assert_eq!(ctx.state(), AttemptState::Completed);
    assert_eq!(ctx.transaction_id(), result.transaction_id);
    let atr = ctx.atr().unwrap();
    assert_eq!(cluster.atr_state(&atr, ctx.attempt_id()), Some(json!("COMPLETED")));
}

#[tokio::test]
async fn test_read_only_transaction_writes_no_atr() {
    let cluster = TestCluster::new();
    cluster.seed("hotel", json!({"rooms": 3})).await;
    let txns = cluster.transactions();
    let last = LastAttempt::default();

    txns.run(|ctx| {
        last.record(&ctx);
        let ks = cluster.keyspace.clone();
        async move {
            let hotel = ctx.get(&ks, "hotel").await?;
            assert_eq!(hotel.content(), &json!({"rooms": 3}));
            Ok(())
        }
    })
    .await
    .unwrap();

    let ctx = last.get();
    assert!(ctx.atr().is_none());
    assert_eq!(cluster.kv.document_ids(&cluster.keyspace), vec!["hotel".to_string()]);
}
