//! Replaying an offline script must end where the online run ends.

use harbor_core::RecordFilter;
use harbor_sync::{ClientResult, OfflineClient, SyncConfig};
use harbor_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

async fn apply(client: &OfflineClient, step: &MutationStep) -> ClientResult<()> {
    match step {
        MutationStep::Create { .. } => {
            let body = step.body().unwrap_or_default();
            client.create_record(body).await.map(drop)
        }
        MutationStep::Update { id, .. } => {
            let body = step.body().unwrap_or_default();
            client.update_record(id, body).await.map(drop)
        }
        MutationStep::Delete { id } => client.delete_record(id).await,
    }
}

/// Runs `script`, returning the indexes of rejected steps.
async fn run(client: &OfflineClient, script: &[MutationStep]) -> Vec<usize> {
    let mut rejected = Vec::new();
    for (index, step) in script.iter().enumerate() {
        if apply(client, step).await.is_err() {
            rejected.push(index);
        }
    }
    rejected
}

/// Projects the client's records onto the model's shape.
fn snapshot(client: &OfflineClient) -> BTreeMap<String, ModelRecord> {
    client
        .list_records(&RecordFilter::new().include_deleted())
        .into_iter()
        .map(|record| {
            assert!(!record.offline, "{} still offline", record.id);
            let price = record
                .field("price")
                .and_then(|v| v.as_u64())
                .unwrap_or_default() as u32;
            let revision = record
                .field("revision")
                .and_then(|v| v.as_u64())
                .unwrap_or_default();
            (record.id.to_string(), ModelRecord { price, revision })
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn offline_then_drain_matches_online(script in mutation_script_strategy(16)) {
        let expected = apply_online(&script);

        let (online_state, online_rejected, offline_state, offline_rejected, remote_len) =
            runtime().block_on(async {
                let online = online_client();
                let online_rejected = run(&online, &script).await;

                let offline = TestClient::new(
                    TestStore::memory(),
                    SyncConfig::new().start_online(false),
                );
                let offline_rejected = run(&offline, &script).await;
                offline.set_online(true);
                let report = offline.drain().await.unwrap();
                assert!(report.is_complete(), "{report:?}");

                (
                    snapshot(&online),
                    online_rejected,
                    snapshot(&offline),
                    offline_rejected,
                    offline.remote.len(),
                )
            });

        prop_assert_eq!(&online_rejected, &expected.rejected);
        prop_assert_eq!(&offline_rejected, &expected.rejected);
        prop_assert_eq!(&online_state, &expected.records);
        prop_assert_eq!(&offline_state, &expected.records);
        prop_assert_eq!(remote_len, expected.records.len());
    }
}
