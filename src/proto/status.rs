// Status-exchange and com-issue messages.
//
// The coordinator periodically POSTs a status message to each known worker
// carrying its own contact block, the worker's expected contact block, and
// the three per-peer notice maps (keep-files, delete-files, dead-bundles).
// The worker's response lists the ids it acted on so the coordinator can
// drop them. A worker that previously failed to reach the coordinator sends
// a separate com-issue message once contact resumes.

use serde::{Deserialize, Serialize};

use super::envelope::{wire_int, Envelope};
use crate::common::{BundleId, CoordinatorId, QueryId, WorkerId};

/// Coordinator contact block ("czar" info on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorContact {
    pub name: String,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub id: CoordinatorId,
    #[serde(rename = "management-host-name")]
    pub management_host: String,
    #[serde(rename = "management-port", deserialize_with = "wire_int::de_u16")]
    pub management_port: u16,
    #[serde(rename = "startup-time", deserialize_with = "wire_int::de_u64")]
    pub startup_epoch: u64,
}

impl CoordinatorContact {
    /// True when everything except the startup epoch matches.
    pub fn same_contact(&self, other: &CoordinatorContact) -> bool {
        self.name == other.name
            && self.id == other.id
            && self.management_host == other.management_host
            && self.management_port == other.management_port
    }
}

/// Worker contact block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContact {
    pub id: WorkerId,
    pub host: String,
    #[serde(rename = "management-host-name")]
    pub management_host: String,
    #[serde(rename = "management-port", deserialize_with = "wire_int::de_u16")]
    pub management_port: u16,
    /// Zero until the worker reports it; any later change means restart.
    #[serde(rename = "startup-time", default, deserialize_with = "wire_int::de_u64")]
    pub startup_epoch: u64,
}

impl WorkerContact {
    pub fn same_contact(&self, other: &WorkerContact) -> bool {
        self.id == other.id
            && self.host == other.host
            && self.management_host == other.management_host
            && self.management_port == other.management_port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.management_host, self.management_port)
    }
}

/// One dead-bundle notice: every listed bundle of the query must be abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadBundles {
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub qid: QueryId,
    pub ujids: Vec<BundleId>,
}

/// Set when a restarted coordinator wants the worker to drop everything the
/// previous incarnation assigned, up to and including `last_query_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartedCoordinator {
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub czarid: CoordinatorId,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub lastqid: QueryId,
}

/// Periodic coordinator -> worker status message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMsg {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Monotonic per-peer request id, echoed by the reply; a duplicate
    /// reply (same id) is applied at most once.
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub reqid: u64,
    pub czarinfo: CoordinatorContact,
    pub workerinfo: WorkerContact,
    /// Queries whose tasks may stop; result files must be kept (row cap hit).
    #[serde(default)]
    pub qiddonekeepfiles: Vec<QueryId>,
    /// Queries whose tasks may stop and result files be deleted.
    #[serde(default)]
    pub qiddonedeletefiles: Vec<QueryId>,
    /// Specific bundles to abandon.
    #[serde(default)]
    pub qiddeaduberjobs: Vec<DeadBundles>,
    /// Set when the coordinator believed this worker was dead and has since
    /// heard from it again; the worker must re-announce undelivered results.
    #[serde(default)]
    pub thoughtworkerwasdead: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub czarrestart: Option<RestartedCoordinator>,
}

/// Worker -> coordinator reply to a status message. Ids listed here have
/// been acted upon and may be dropped from the coordinator's maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: u8,
    #[serde(default)]
    pub error: String,
    /// Echo of the request's `reqid`.
    #[serde(default, deserialize_with = "wire_int::de_u64")]
    pub reqid: u64,
    #[serde(rename = "w-startup-time", deserialize_with = "wire_int::de_u64")]
    pub startup_epoch: u64,
    #[serde(default)]
    pub ackedkeepfiles: Vec<QueryId>,
    #[serde(default)]
    pub ackeddeletefiles: Vec<QueryId>,
    #[serde(default)]
    pub ackeddeaduberjobs: Vec<DeadBundles>,
}

impl StatusResponse {
    pub fn is_success(&self) -> bool {
        self.success == 1
    }
}

/// Result-file-ready data carried inside a com-issue message for
/// notifications that previously failed to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNote {
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub queryid: QueryId,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub uberjobid: BundleId,
    #[serde(rename = "fileUrl")]
    pub file_url: String,
    #[serde(rename = "rowCount", deserialize_with = "wire_int::de_u64")]
    pub row_count: u64,
    #[serde(rename = "fileSize", deserialize_with = "wire_int::de_u64")]
    pub file_size: u64,
}

/// Worker -> coordinator message sent after a communication gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComIssueMsg {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub workerinfo: WorkerContact,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub czarid: CoordinatorId,
    pub thoughtczarwasdead: bool,
    #[serde(default)]
    pub pendingreadymsgs: Vec<ReadyNote>,
}

/// Coordinator reply listing the com-issue items it accepted; the worker
/// clears its pending set accordingly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComIssueResponse {
    pub success: u8,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub acceptedready: Vec<AcceptedReady>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedReady {
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub queryid: QueryId,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub uberjobid: BundleId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::envelope::PROTOCOL_VERSION;

    fn envelope() -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            instance_id: "inst".into(),
            auth_key: "key".into(),
            admin_auth_key: None,
        }
    }

    fn coordinator() -> CoordinatorContact {
        CoordinatorContact {
            name: "cz".into(),
            id: 7,
            management_host: "cz-host".into(),
            management_port: 7080,
            startup_epoch: 111,
        }
    }

    fn worker() -> WorkerContact {
        WorkerContact {
            id: "w1".into(),
            host: "w-host".into(),
            management_host: "w-host".into(),
            management_port: 7090,
            startup_epoch: 222,
        }
    }

    #[test]
    fn status_msg_round_trips_all_three_maps() {
        let msg = StatusMsg {
            envelope: envelope(),
            reqid: 17,
            czarinfo: coordinator(),
            workerinfo: worker(),
            qiddonekeepfiles: vec![1, 2, 3, 4, 6, 10, 13, 19, 33],
            qiddonedeletefiles: vec![7, 8, 9, 15, 25, 26, 27, 30],
            qiddeaduberjobs: vec![
                DeadBundles {
                    qid: 12,
                    ujids: vec![1, 3],
                },
                DeadBundles {
                    qid: 1059,
                    ujids: vec![1, 4, 6, 7, 8, 10, 3, 22, 93],
                },
            ],
            thoughtworkerwasdead: true,
            czarrestart: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        let parsed: StatusMsg = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn contact_comparison_ignores_startup_epoch() {
        let a = coordinator();
        let mut b = a.clone();
        b.startup_epoch = 999;
        assert!(a.same_contact(&b));
        b.name = "different".into();
        assert!(!a.same_contact(&b));
    }

    #[test]
    fn com_issue_round_trips_flag_and_pending() {
        let msg = ComIssueMsg {
            envelope: envelope(),
            workerinfo: worker(),
            czarid: 7,
            thoughtczarwasdead: true,
            pendingreadymsgs: vec![ReadyNote {
                queryid: 5,
                uberjobid: 2,
                file_url: "http://w-host:7090/results/qr_7_5_2".into(),
                row_count: 100,
                file_size: 4096,
            }],
        };
        let parsed: ComIssueMsg =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.thoughtczarwasdead);
    }

    #[test]
    fn status_response_accepts_string_ids() {
        let parsed: StatusResponse = serde_json::from_str(
            r#"{"success":1,"reqid":"6","w-startup-time":"222","ackedkeepfiles":[1],"ackeddeletefiles":[],"ackeddeaduberjobs":[{"qid":"12","ujids":[3]}]}"#,
        )
        .unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.reqid, 6);
        assert_eq!(parsed.startup_epoch, 222);
        assert_eq!(parsed.ackeddeaduberjobs[0].qid, 12);
    }
}
