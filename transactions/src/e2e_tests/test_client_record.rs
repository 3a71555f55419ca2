//! Clients agree on who cleans which ATRs through the client record.

use std::collections::BTreeSet;

use crate::cleanup::{ClientRecord, ClientRecordDetails};
use crate::e2e_tests::helpers::{NUM_ATRS, TestCluster};
use crate::kv::DurabilityLevel;

fn record(cluster: &TestCluster) -> ClientRecord {
    ClientRecord::new(
        cluster.kv.clone(),
        cluster.keyspace.clone(),
        DurabilityLevel::None,
    )
}

async fn heartbeat(record: &ClientRecord, client_uuid: &str, expires_ms: u64) {
    record.create_placeholder().await.unwrap();
    let (doc, hlc) = record.read().await.unwrap().unwrap();
    let details = ClientRecordDetails::new(&doc, hlc, client_uuid);
    record.update(&details, expires_ms, NUM_ATRS).await.unwrap();
}

async fn details(record: &ClientRecord, client_uuid: &str) -> ClientRecordDetails {
    let (doc, hlc) = record.read().await.unwrap().unwrap();
    ClientRecordDetails::new(&doc, hlc, client_uuid)
}

#[tokio::test]
async fn test_expired_client_is_excluded_but_self_is_kept() {
    let cluster = TestCluster::new();
    let record = record(&cluster);
    heartbeat(&record, "me", 10).await;
    heartbeat(&record, "other", 10).await;
    cluster.time.advance(1_000);

    let details = details(&record, "me").await;
    assert_eq!(details.num_existing_clients, 2);
    assert_eq!(details.num_expired_clients, 1);
    assert_eq!(details.expired_client_ids, vec!["other".to_string()]);
    assert_eq!(details.active_client_ids, vec!["me".to_string()]);
    assert_eq!(details.index_of_this_client, 0);
}

#[tokio::test]
async fn test_expiry_is_judged_on_the_server_clock() {
    let cluster = TestCluster::new();
    let record = record(&cluster);
    heartbeat(&record, "other", 1_000).await;

    cluster.time.advance(1_000);
    assert_eq!(details(&record, "me").await.num_expired_clients, 0);
    cluster.time.advance(1);
    assert_eq!(details(&record, "me").await.num_expired_clients, 1);
}

#[tokio::test]
async fn test_live_clients_split_the_atrs() {
    let cluster = TestCluster::new();
    let clients = ["c", "a", "b"];
    let cleaners: Vec<_> = clients.iter().map(|c| cluster.lost_cleaner(c)).collect();
    for cleaner in &cleaners {
        cleaner.run_once().await.unwrap();
    }

    let mut seen = BTreeSet::new();
    let mut indexes = BTreeSet::new();
    for cleaner in &cleaners {
        let report = cleaner.run_once().await.unwrap();
        let details = report.details.unwrap();
        assert_eq!(details.num_active_clients, 3);
        indexes.insert(details.index_of_this_client);
        for atr in details.atr_indices(NUM_ATRS) {
            assert!(seen.insert(atr), "ATR {atr} assigned twice");
        }
    }
    assert_eq!(indexes, BTreeSet::from([0, 1, 2]));
    assert_eq!(seen.len(), NUM_ATRS);
}
