//! Once a transaction runs a query, the query engine carries it to the end.

use std::sync::Arc;

use serde_json::json;

use crate::attempt::query_mode::tests::FakeQueryEngine;
use crate::e2e_tests::helpers::TestCluster;
use crate::error::TransactionError;
use crate::query::{BEGIN_WORK, COMMIT, EXECUTE_INSERT, QueryError, QueryOptions, ROLLBACK};

const UPDATE: &str = "UPDATE travel SET rooms = rooms - 1 WHERE META().id = 'hotel'";

#[tokio::test]
async fn test_query_transaction_commits_through_engine() {
    let cluster = TestCluster::new();
    let engine = Arc::new(FakeQueryEngine::default());
    let txns = cluster.transactions_with_query(engine.clone());

    let result = txns
        .run(|ctx| {
            let ks = cluster.keyspace.clone();
            async move {
                ctx.query(UPDATE, QueryOptions::default()).await?;
                ctx.insert(&ks, "booking", json!({"room": 1})).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    assert!(result.unstaging_complete);
    assert_eq!(engine.sent(), vec![BEGIN_WORK, UPDATE, EXECUTE_INSERT, COMMIT]);
    // The engine owns the writes; nothing went through key-value.
    assert_eq!(cluster.content("booking").await, None);
}

#[tokio::test]
async fn test_ambiguous_query_commit_is_reported() {
    let cluster = TestCluster::new();
    let engine = Arc::new(FakeQueryEngine::default());
    engine.fail(COMMIT, QueryError::CommitAmbiguous);
    let txns = cluster.transactions_with_query(engine.clone());

    let err = txns
        .run(|ctx| async move {
            ctx.query(UPDATE, QueryOptions::default()).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::CommitAmbiguous { .. }), "{err:?}");
    assert_eq!(engine.sent().last().map(String::as_str), Some(COMMIT));
}

#[tokio::test]
async fn test_failed_statement_rolls_back_through_engine() {
    let cluster = TestCluster::new();
    let engine = Arc::new(FakeQueryEngine::default());
    engine.fail(UPDATE, QueryError::Other("syntax error".to_string()));
    let txns = cluster.transactions_with_query(engine.clone());

    let err = txns
        .run(|ctx| async move {
            ctx.query("SELECT 1", QueryOptions::default()).await?;
            ctx.query(UPDATE, QueryOptions::default()).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Failed { .. }), "{err:?}");
    assert_eq!(engine.sent(), vec![BEGIN_WORK, "SELECT 1", UPDATE, ROLLBACK]);
}
