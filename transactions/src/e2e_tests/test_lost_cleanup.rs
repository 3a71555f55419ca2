//! Attempts left behind by a client that died are finished by another
//! client once their ATR entries expire.

use serde_json::json;

use crate::atr::AttemptState;
use crate::e2e_tests::helpers::TestCluster;
use crate::kv::KvError;
use crate::simulation::{KvOp, ScriptedFault};

#[tokio::test]
async fn test_committed_attempt_of_dead_client_is_finished() {
    let cluster = TestCluster::new();
    cluster.seed("hotel", json!({"rooms": 3})).await;
    let txns = cluster.transactions();

    let result = txns
        .run(|ctx| {
            let cluster = &cluster;
            async move {
                let hotel = ctx.get(&cluster.keyspace, "hotel").await?;
                ctx.replace(&hotel, json!({"rooms": 2})).await?;
                cluster.kv.inject(ScriptedFault::new(
                    KvOp::MutateIn,
                    "hotel",
                    KvError::DurabilityImpossible,
                ));
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(!result.unstaging_complete);
    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 3})));

    // The owner is gone; a surviving client waits for the entry to expire.
    let survivor = cluster.lost_cleaner("survivor");
    let report = survivor.run_once().await.unwrap();
    assert_eq!(report.entries_found, 1);
    assert_eq!(report.entries_expired, 0);
    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 3})));

    cluster.time.advance(15_001);
    let report = survivor.run_once().await.unwrap();
    assert_eq!(report.cleaned.len(), 1);
    let cleaned = &report.cleaned[0];
    assert!(cleaned.success, "{:?}", cleaned.failure_reason);
    assert!(!cleaned.is_regular);
    assert_eq!(cleaned.state, AttemptState::Committed);
    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 2})));
    assert_eq!(survivor.run_once().await.unwrap().entries_found, 0);
}

#[tokio::test]
async fn test_pending_attempt_of_dead_client_stops_blocking() {
    let cluster = TestCluster::new();
    cluster.seed("hotel", json!({"rooms": 3})).await;

    let dead = cluster.attempt("dead");
    let hotel = dead.get(&cluster.keyspace, "hotel").await.unwrap();
    dead.replace(&hotel, json!({"rooms": 0})).await.unwrap();
    dead.insert(&cluster.keyspace, "ghost", json!({})).await.unwrap();
    drop(dead);

    cluster.time.advance(15_001);
    let report = cluster.lost_cleaner("survivor").run_once().await.unwrap();
    assert_eq!(report.entries_expired, 1);
    assert!(report.cleaned[0].success);
    assert_eq!(report.cleaned[0].state, AttemptState::Pending);

    let txns = cluster.transactions();
    txns.run(|ctx| {
        let ks = cluster.keyspace.clone();
        async move {
            let hotel = ctx.get(&ks, "hotel").await?;
            assert_eq!(hotel.content(), &json!({"rooms": 3}));
            ctx.replace(&hotel, json!({"rooms": 1})).await?;
            Ok(())
        }
    })
    .await
    .unwrap();
    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 1})));
    assert_eq!(cluster.content("ghost").await, None);
}

#[tokio::test]
async fn test_background_task_cleans_after_registration() {
    let cluster = TestCluster::new();
    let txns = cluster.transactions_with(TestCluster::config());

    let dead = cluster.attempt("dead");
    dead.insert(&cluster.keyspace, "ghost", json!({})).await.unwrap();
    let atr = dead.atr().unwrap();
    let attempt_id = dead.attempt_id().to_string();
    drop(dead);
    cluster.time.advance(15_001);

    assert!(txns.lost_cleanup().register_keyspace(&atr.keyspace));
    for _ in 0..200 {
        if cluster.atr_state(&atr, &attempt_id).is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(cluster.atr_state(&atr, &attempt_id), None);
    txns.shutdown().await;
}
