// Worker-side acceptance, cancellation, and restart handling driven
// directly against the service (no sockets).

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use scatterdb::common::ScanInfo;
use scatterdb::config::WorkerConfig;
use scatterdb::error::CoreError;
use scatterdb::proto::bundle::{BundleMsg, DbTableMap, FragmentMsg, JobMsg, TemplateMap};
use scatterdb::proto::envelope::{Envelope, PROTOCOL_VERSION};
use scatterdb::proto::status::{CoordinatorContact, StatusMsg};
use scatterdb::sql::{MockSqlConnection, SqlRow};
use scatterdb::worker::WorkerService;

async fn service() -> (Arc<WorkerService>, MockSqlConnection, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = WorkerConfig {
        worker_id: "w1".to_string(),
        host: "127.0.0.1".to_string(),
        port: 1,
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        mysql_uri: "mock://chunks".to_string(),
        result_dir: dir.path().display().to_string(),
        create_result_dir: true,
        task_pool_size: 2,
        ..WorkerConfig::default()
    };
    let sql = MockSqlConnection::new();
    let service = WorkerService::new(config, Arc::new(sql.clone()))
        .await
        .unwrap();
    service.start();
    (service, sql, dir)
}

fn envelope() -> Envelope {
    Envelope {
        version: PROTOCOL_VERSION,
        instance_id: "inst".to_string(),
        auth_key: "key".to_string(),
        admin_auth_key: None,
    }
}

fn czar(epoch: u64) -> CoordinatorContact {
    CoordinatorContact {
        name: "cz".to_string(),
        id: 5,
        management_host: "127.0.0.1".to_string(),
        // Nothing listens here; notification failures queue for com-issue.
        management_port: 1,
        startup_epoch: epoch,
    }
}

fn bundle_msg(query_id: u64, bundle_id: u64, epoch: u64) -> BundleMsg {
    let mut templates = TemplateMap::new();
    let t0 = templates.intern("SELECT * FROM {db}.{table}_{chunk}");
    let mut dbtables = DbTableMap::new();
    let d0 = dbtables.intern("sky", "objects");
    BundleMsg {
        envelope: envelope(),
        worker: "w1".to_string(),
        czarinfo: czar(epoch),
        queryid: query_id,
        uberjobid: bundle_id,
        rowlimit: 0,
        maxtablesizemb: 100,
        scaninfo: ScanInfo::batch(),
        scaninteractive: false,
        subqueries_map: templates.to_wire(),
        dbtables_map: dbtables.to_wire(),
        jobs: vec![JobMsg {
            job_id: 1,
            attempt_count: 1,
            query_spec_db: "sky".to_string(),
            chunk_id: 42,
            query_fragments: vec![FragmentMsg {
                subquerytemplate_indexes: vec![t0],
                dbtables_indexes: vec![d0],
                subchunkids: vec![],
            }],
        }],
    }
}

async fn wait_published(service: &Arc<WorkerService>, key: &(u64, u64, u64)) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(bundle) = service.bundle(key) {
                if bundle.is_published() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bundle never published");
}

#[tokio::test]
async fn duplicate_bundle_is_an_idempotent_success() {
    let (service, sql, _dir) = service().await;
    sql.push_hanging_stream();
    service.accept_bundle(bundle_msg(7, 1, 100)).await.unwrap();
    service.accept_bundle(bundle_msg(7, 1, 100)).await.unwrap();
    assert!(service.bundle(&(5, 7, 1)).is_some());
}

#[tokio::test]
async fn mistargeted_bundle_is_rejected() {
    let (service, _sql, _dir) = service().await;
    let mut msg = bundle_msg(7, 1, 100);
    msg.worker = "someone-else".to_string();
    match service.accept_bundle(msg).await {
        Err(CoreError::WorkerRejectedBundle { retryable, .. }) => assert!(!retryable),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn bad_auth_and_bad_indices_are_typed_rejections() {
    let (service, _sql, _dir) = service().await;

    let mut msg = bundle_msg(7, 1, 100);
    msg.envelope.auth_key = "wrong".to_string();
    assert!(matches!(
        service.accept_bundle(msg).await,
        Err(CoreError::Auth(_))
    ));

    let mut msg = bundle_msg(7, 2, 100);
    msg.jobs[0].query_fragments[0].subquerytemplate_indexes = vec![99];
    assert!(matches!(
        service.accept_bundle(msg).await,
        Err(CoreError::InvalidProtocol(_))
    ));
}

#[tokio::test]
async fn execution_error_is_captured_for_the_coordinator() {
    let (service, sql, _dir) = service().await;
    sql.fail_matching(
        "objects_42",
        CoreError::WorkerExecution {
            errno: 1146,
            message: "table missing".to_string(),
        },
    );
    service.accept_bundle(bundle_msg(8, 1, 100)).await.unwrap();
    // The bundle ends in a failed state; its file is reclaimed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let bundle = service.bundle(&(5, 8, 1)).unwrap();
    assert!(!bundle.is_published());
}

#[tokio::test]
async fn keep_files_notice_stops_work_but_keeps_the_file() {
    let (service, sql, _dir) = service().await;
    sql.push_stream(vec![SqlRow(vec![Some("1".to_string())])]);
    service.accept_bundle(bundle_msg(9, 1, 100)).await.unwrap();
    wait_published(&service, &(5, 9, 1)).await;

    let mut status = StatusMsg {
        envelope: envelope(),
        reqid: 1,
        czarinfo: czar(100),
        workerinfo: service.identity.contact(),
        qiddonekeepfiles: vec![9],
        qiddonedeletefiles: vec![],
        qiddeaduberjobs: vec![],
        thoughtworkerwasdead: false,
        czarrestart: None,
    };
    let resp = service.handle_status(&status).await;
    assert!(resp.is_success());
    assert_eq!(resp.ackedkeepfiles, vec![9]);
    let bundle = service.bundle(&(5, 9, 1)).unwrap();
    let name = bundle.file_name.clone();
    assert!(service.files.open_ready(&name).await.is_ok());

    // Delete-files for the same query reclaims it.
    status.qiddonekeepfiles.clear();
    status.qiddonedeletefiles = vec![9];
    let resp = service.handle_status(&status).await;
    assert_eq!(resp.ackeddeletefiles, vec![9]);
    assert!(service.files.open_ready(&name).await.is_err());
}

#[tokio::test]
async fn coordinator_restart_voids_prior_work() {
    let (service, sql, _dir) = service().await;
    sql.push_stream(vec![SqlRow(vec![Some("1".to_string())])]);
    service.accept_bundle(bundle_msg(10, 1, 100)).await.unwrap();
    wait_published(&service, &(5, 10, 1)).await;
    let name = service.bundle(&(5, 10, 1)).unwrap().file_name.clone();

    // Same coordinator id, new startup epoch.
    let status = StatusMsg {
        envelope: envelope(),
        reqid: 2,
        czarinfo: czar(200),
        workerinfo: service.identity.contact(),
        qiddonekeepfiles: vec![],
        qiddonedeletefiles: vec![],
        qiddeaduberjobs: vec![],
        thoughtworkerwasdead: false,
        czarrestart: None,
    };
    let resp = service.handle_status(&status).await;
    assert!(resp.is_success());
    assert!(service.bundle(&(5, 10, 1)).is_none());
    assert!(service.files.open_ready(&name).await.is_err());
}

#[tokio::test]
async fn dead_bundle_notice_abandons_one_bundle() {
    let (service, sql, _dir) = service().await;
    sql.push_stream(vec![SqlRow(vec![Some("1".to_string())])]);
    sql.push_hanging_stream();
    service.accept_bundle(bundle_msg(11, 1, 100)).await.unwrap();
    wait_published(&service, &(5, 11, 1)).await;
    service.accept_bundle(bundle_msg(11, 2, 100)).await.unwrap();

    let status = StatusMsg {
        envelope: envelope(),
        reqid: 3,
        czarinfo: czar(100),
        workerinfo: service.identity.contact(),
        qiddonekeepfiles: vec![],
        qiddonedeletefiles: vec![],
        qiddeaduberjobs: vec![scatterdb::proto::status::DeadBundles {
            qid: 11,
            ujids: vec![1],
        }],
        thoughtworkerwasdead: false,
        czarrestart: None,
    };
    let resp = service.handle_status(&status).await;
    assert_eq!(resp.ackeddeaduberjobs.len(), 1);
    // Bundle 1's file is gone; bundle 2 is still registered.
    assert!(service.bundle(&(5, 11, 1)).is_none());
    assert!(service.bundle(&(5, 11, 2)).is_some());
}
