// Worker -> coordinator completion notifications.

use serde::{Deserialize, Serialize};

use super::envelope::{wire_int, Envelope};
use crate::common::{BundleId, CoordinatorId, QueryId};
use crate::error::CoreError;

/// POSTed to the coordinator's `/queryjob-ready` endpoint when a bundle's
/// result file has been renamed to its ready name. Idempotent on
/// `(queryid, uberjobid)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleReadyMsg {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub workerid: String,
    /// Coordinator name, echoed back for routing sanity checks.
    pub czar: String,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub czarid: CoordinatorId,
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

/// POSTed to `/queryjob-error` when a bundle fails on the worker. Task-level
/// errors are aggregated into one bundle-level message before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleErrorMsg {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub workerid: String,
    pub czar: String,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub czarid: CoordinatorId,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub queryid: QueryId,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub uberjobid: BundleId,
    #[serde(rename = "errorCode", deserialize_with = "wire_int::de_i32")]
    pub error_code: i32,
    #[serde(rename = "errorMsg")]
    pub error_msg: String,
}

impl BundleErrorMsg {
    pub fn to_error(&self) -> CoreError {
        CoreError::from_wire(self.error_code, self.error_msg.clone())
    }
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

    #[test]
    fn ready_msg_round_trips() {
        let msg = BundleReadyMsg {
            envelope: envelope(),
            workerid: "w1".into(),
            czar: "cz".into(),
            czarid: 9,
            queryid: 33,
            uberjobid: 2,
            file_url: "http://w-host:7090/results/qr_9_33_2".into(),
            row_count: 150,
            file_size: 8192,
        };
        let parsed: BundleReadyMsg =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn ready_msg_accepts_string_counts() {
        let text = r#"{
            "version": 1, "instance_id": "inst", "auth_key": "key",
            "workerid": "w1", "czar": "cz", "czarid": "9",
            "queryid": "33", "uberjobid": "2",
            "fileUrl": "http://w/f", "rowCount": "150", "fileSize": "8192"
        }"#;
        let parsed: BundleReadyMsg = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.row_count, 150);
        assert_eq!(parsed.file_size, 8192);
    }

    #[test]
    fn error_msg_maps_back_to_taxonomy() {
        let msg = BundleErrorMsg {
            envelope: envelope(),
            workerid: "w1".into(),
            czar: "cz".into(),
            czarid: 9,
            queryid: 33,
            uberjobid: 2,
            error_code: CoreError::WorkerExecution {
                errno: 0,
                message: String::new(),
            }
            .wire_code(),
            error_msg: "table missing".into(),
        };
        let parsed: BundleErrorMsg =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert!(matches!(
            parsed.to_error(),
            CoreError::WorkerExecution { .. }
        ));
    }
}
