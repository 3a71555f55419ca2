// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactions::kv::{Keyspace, SharedKv};
use transactions::simulation::SimulatedKv;
use transactions::time::SystemTimeSource;
use transactions::{AttemptError, Transactions, TransactionsConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transactions=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match TransactionsConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Loaded configuration: expiration={:?}, durability={}, cleanup_window={:?}",
        config.expiration_time,
        config.durability.short_str(),
        config.cleanup_window
    );

    // An in-memory cluster driven by the system clock.
    let kv: SharedKv = Arc::new(SimulatedKv::new(0, Arc::new(SystemTimeSource)));
    let keyspace = Keyspace::default_collection("demo");
    if let Err(e) = kv
        .upsert(&keyspace, "alice", json!({"balance": 100}))
        .await
    {
        tracing::error!("Failed to seed demo data: {e}");
        std::process::exit(1);
    }

    let transactions = Transactions::new(kv.clone(), config);
    let result = transactions
        .run(|ctx| {
            let keyspace = keyspace.clone();
            async move {
                let alice = ctx.get(&keyspace, "alice").await?;
                let balance = alice
                    .content_as::<serde_json::Value>()
                    .map_err(AttemptError::application)?["balance"]
                    .as_i64()
                    .unwrap_or_default();
                ctx.replace(&alice, json!({"balance": balance - 10})).await?;
                ctx.insert(&keyspace, "bob", json!({"balance": 10})).await?;
                Ok(())
            }
        })
        .await;

    match result {
        Ok(result) => tracing::info!(
            "Transaction {} committed (unstaging complete: {})",
            result.transaction_id,
            result.unstaging_complete
        ),
        Err(e) => tracing::error!("Transaction failed: {e}"),
    }

    let summary = transactions.shutdown().await;
    tracing::info!(
        "Cleanup finished: {} succeeded, {} failed",
        summary.succeeded,
        summary.failed
    );
}
