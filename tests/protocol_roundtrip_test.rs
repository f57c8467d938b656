// Wire-format round-trip laws exercised through the public surface.

use std::time::Duration;

use reqwest::Client;

use scatterdb::common::{ScanInfo, ScanTable};
use scatterdb::coordinator::bundle::{FragmentSpec, Job};
use scatterdb::coordinator::BundleSender;
use scatterdb::error::CoreError;
use scatterdb::proto::bundle::BundleMsg;
use scatterdb::proto::envelope::PROTOCOL_VERSION;
use scatterdb::proto::status::{CoordinatorContact, StatusMsg, WorkerContact};
use scatterdb::proto::{AuthContext, Envelope, ResponseMsg};

fn auth() -> AuthContext {
    AuthContext {
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        admin_auth_key: "admin".to_string(),
    }
}

fn worker_contact() -> WorkerContact {
    WorkerContact {
        id: "w1".to_string(),
        host: "w-host".to_string(),
        management_host: "w-host".to_string(),
        management_port: 7090,
        startup_epoch: 1111,
    }
}

fn coordinator_contact() -> CoordinatorContact {
    CoordinatorContact {
        name: "cz".to_string(),
        id: 3,
        management_host: "cz-host".to_string(),
        management_port: 7080,
        startup_epoch: 2222,
    }
}

#[test]
fn bundle_serialize_then_parse_is_identity() {
    let jobs: Vec<Job> = (0..40)
        .map(|i| Job {
            job_id: i + 1,
            chunk_id: 100 + i as i32,
            spec_db: "sky".to_string(),
            attempt_count: 1,
            fragments: vec![FragmentSpec {
                // Two shared templates across all jobs.
                queries: vec![
                    "SELECT * FROM {db}.{table}_{chunk}".to_string(),
                    "SELECT id FROM {db}.{table}_{chunk} WHERE flux > 3".to_string(),
                ],
                subchunk_ids: vec![1, 2, 3],
                dbtables: vec![("sky".to_string(), "objects".to_string())],
            }],
        })
        .collect();
    let sender = BundleSender::new(
        12,
        4,
        jobs,
        1000,
        5000,
        ScanInfo {
            priority: 2,
            tables: vec![ScanTable {
                db: "sky".to_string(),
                table: "objects".to_string(),
                scan_rating: 7,
                lock_in_memory: false,
            }],
        },
        true,
        worker_contact(),
        coordinator_contact(),
        auth(),
        Client::new(),
        Duration::from_secs(60),
    );

    let msg = sender.build_msg();
    // Interning collapsed the shared templates and the single table pair.
    assert_eq!(msg.subqueries_map.len(), 2);
    assert_eq!(msg.dbtables_map.len(), 1);
    assert_eq!(msg.jobs.len(), 40);
    msg.validate_indices().unwrap();

    let text = serde_json::to_string(&msg).unwrap();
    let parsed: BundleMsg = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, msg);
    assert_eq!(
        serde_json::to_value(&parsed).unwrap(),
        serde_json::from_str::<serde_json::Value>(&text).unwrap()
    );
}

#[test]
fn status_message_preserves_maps_and_resync_flag() {
    let msg = StatusMsg {
        envelope: Envelope {
            version: PROTOCOL_VERSION,
            instance_id: "inst".to_string(),
            auth_key: "key".to_string(),
            admin_auth_key: None,
        },
        reqid: 44,
        czarinfo: coordinator_contact(),
        workerinfo: worker_contact(),
        qiddonekeepfiles: vec![1, 2, 3, 4, 6, 10, 13, 19, 33],
        qiddonedeletefiles: vec![7, 8, 9, 15, 25, 26, 27, 30],
        qiddeaduberjobs: vec![scatterdb::proto::status::DeadBundles {
            qid: 12,
            ujids: vec![1, 3],
        }],
        thoughtworkerwasdead: true,
        czarrestart: None,
    };
    let parsed: StatusMsg = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
    assert_eq!(parsed, msg);
    assert!(parsed.thoughtworkerwasdead);
    assert_eq!(parsed.qiddonekeepfiles.len(), 9);
    assert_eq!(parsed.qiddonedeletefiles.len(), 8);
    assert_eq!(parsed.qiddeaduberjobs[0].ujids, vec![1, 3]);
}

#[test]
fn response_envelope_carries_classification_both_ways() {
    for err in [
        CoreError::Transport("refused".to_string()),
        CoreError::WorkerRejectedBundle {
            retryable: true,
            reason: "busy".to_string(),
        },
        CoreError::ResultTooBig("5001 MB".to_string()),
        CoreError::Auth("bad key".to_string()),
    ] {
        let resp = ResponseMsg::err(&err);
        let parsed: ResponseMsg =
            serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.to_error().recovery(), err.recovery());
    }
}
