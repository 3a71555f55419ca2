//! A commit that reaches the commit point but cannot finish unstaging still
//! succeeds, and this client's cleanup finishes the job.

use serde_json::json;

use crate::atr::AttemptState;
use crate::config::TransactionsConfig;
use crate::e2e_tests::helpers::TestCluster;
use crate::kv::KvError;
use crate::simulation::{KvOp, ScriptedFault};

#[tokio::test]
async fn test_own_cleanup_finishes_unstaging() {
    let cluster = TestCluster::new();
    cluster.seed("hotel", json!({"rooms": 3})).await;
    let txns = cluster.transactions_with(TransactionsConfig {
        cleanup_lost_attempts: false,
        ..TestCluster::config()
    });

    let result = txns
        .run(|ctx| {
            let cluster = &cluster;
            async move {
                let ks = &cluster.keyspace;
                let hotel = ctx.get(ks, "hotel").await?;
                ctx.replace(&hotel, json!({"rooms": 2})).await?;
                ctx.insert(ks, "booking", json!({"room": 1})).await?;
                // Unstaging the replace fails once the commit point is passed.
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

    let summary = txns.shutdown().await;
    assert_eq!((summary.succeeded, summary.failed), (1, 0));
    let cleaned = &summary.recent[0];
    assert!(cleaned.success, "{:?}", cleaned.failure_reason);
    assert!(cleaned.is_regular);
    assert_eq!(cleaned.state, AttemptState::Committed);

    assert_eq!(cluster.content("hotel").await, Some(json!({"rooms": 2})));
    assert_eq!(cluster.content("booking").await, Some(json!({"room": 1})));
    let atr_doc = cleaned.atr.clone();
    assert!(
        cluster
            .kv
            .xattr(&atr_doc.keyspace, &atr_doc.id, &format!("attempts.{}", cleaned.attempt_id))
            .is_none()
    );
}
