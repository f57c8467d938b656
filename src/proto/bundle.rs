// Bundle wire message.
//
// A bundle carries hundreds of jobs that share a small set of SQL templates
// and (db, table) pairs, so the wire form interns both: `subqueries_map`
// and `dbtables_map` map small integer indices to the shared values and
// each fragment carries index lists. Every index referenced by a fragment
// must exist in the maps sent in the same bundle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::envelope::{wire_int, Envelope};
use super::status::CoordinatorContact;
use crate::common::{BundleId, ChunkId, JobId, QueryId, ScanInfo};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntry {
    #[serde(deserialize_with = "wire_int::de_u32")]
    pub index: u32,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTableEntry {
    #[serde(deserialize_with = "wire_int::de_u32")]
    pub index: u32,
    pub db: String,
    pub table: String,
    #[serde(default, deserialize_with = "wire_int::de_i32")]
    pub scanrating: i32,
    #[serde(default)]
    pub lockinmemory: bool,
}

/// Builder that interns query templates while a bundle is assembled.
#[derive(Debug, Default, Clone)]
pub struct TemplateMap {
    entries: BTreeMap<u32, String>,
}

impl TemplateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or insert `template`, returning its index.
    pub fn intern(&mut self, template: &str) -> u32 {
        for (idx, existing) in &self.entries {
            if existing == template {
                return *idx;
            }
        }
        let idx = self.entries.len() as u32;
        self.entries.insert(idx, template.to_string());
        idx
    }

    pub fn get(&self, index: u32) -> Result<&str> {
        self.entries
            .get(&index)
            .map(String::as_str)
            .ok_or_else(|| {
                CoreError::InvalidProtocol(format!("template index {} not in map", index))
            })
    }

    pub fn to_wire(&self) -> Vec<TemplateEntry> {
        self.entries
            .iter()
            .map(|(index, template)| TemplateEntry {
                index: *index,
                template: template.clone(),
            })
            .collect()
    }

    pub fn from_wire(entries: &[TemplateEntry]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| (e.index, e.template.clone()))
                .collect(),
        }
    }
}

/// Builder that interns (db, table) pairs plus their scan metadata.
#[derive(Debug, Default, Clone)]
pub struct DbTableMap {
    entries: BTreeMap<u32, DbTableEntry>,
}

impl DbTableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, db: &str, table: &str) -> u32 {
        for (idx, e) in &self.entries {
            if e.db == db && e.table == table {
                return *idx;
            }
        }
        let idx = self.entries.len() as u32;
        self.entries.insert(
            idx,
            DbTableEntry {
                index: idx,
                db: db.to_string(),
                table: table.to_string(),
                scanrating: 0,
                lockinmemory: false,
            },
        );
        idx
    }

    pub fn set_scan_rating(&mut self, index: u32, scanrating: i32, lockinmemory: bool) {
        if let Some(e) = self.entries.get_mut(&index) {
            e.scanrating = scanrating;
            e.lockinmemory = lockinmemory;
        }
    }

    pub fn get(&self, index: u32) -> Result<(&str, &str)> {
        self.entries
            .get(&index)
            .map(|e| (e.db.as_str(), e.table.as_str()))
            .ok_or_else(|| {
                CoreError::InvalidProtocol(format!("dbtable index {} not in map", index))
            })
    }

    pub fn to_wire(&self) -> Vec<DbTableEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn from_wire(entries: &[DbTableEntry]) -> Self {
        Self {
            entries: entries.iter().map(|e| (e.index, e.clone())).collect(),
        }
    }
}

/// One query fragment: template and table references plus the sub-chunk ids
/// to substitute when the fragment is expanded on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMsg {
    pub subquerytemplate_indexes: Vec<u32>,
    pub dbtables_indexes: Vec<u32>,
    pub subchunkids: Vec<i32>,
}

/// One job: the fragments needed to collect rows from a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMsg {
    #[serde(rename = "jobId", deserialize_with = "wire_int::de_u64")]
    pub job_id: JobId,
    #[serde(rename = "attemptCount", deserialize_with = "wire_int::de_u32")]
    pub attempt_count: u32,
    #[serde(rename = "querySpecDb")]
    pub query_spec_db: String,
    #[serde(rename = "chunkId", deserialize_with = "wire_int::de_i32")]
    pub chunk_id: ChunkId,
    #[serde(rename = "queryFragments")]
    pub query_fragments: Vec<FragmentMsg>,
}

/// The bundle POSTed to a worker's `/queryjob` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMsg {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Target worker id; the receiving process rejects a mismatch.
    pub worker: String,
    pub czarinfo: CoordinatorContact,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub queryid: QueryId,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub uberjobid: BundleId,
    /// 0 means unlimited.
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub rowlimit: u64,
    #[serde(deserialize_with = "wire_int::de_u64")]
    pub maxtablesizemb: u64,
    pub scaninfo: ScanInfo,
    pub scaninteractive: bool,
    pub subqueries_map: Vec<TemplateEntry>,
    pub dbtables_map: Vec<DbTableEntry>,
    pub jobs: Vec<JobMsg>,
}

impl BundleMsg {
    /// Confirm that every index referenced by a fragment exists in the maps
    /// sent with this bundle.
    pub fn validate_indices(&self) -> Result<()> {
        let templates = TemplateMap::from_wire(&self.subqueries_map);
        let dbtables = DbTableMap::from_wire(&self.dbtables_map);
        for job in &self.jobs {
            for frag in &job.query_fragments {
                for idx in &frag.subquerytemplate_indexes {
                    templates.get(*idx)?;
                }
                for idx in &frag.dbtables_indexes {
                    dbtables.get(*idx)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::envelope::PROTOCOL_VERSION;

    fn sample() -> BundleMsg {
        let mut templates = TemplateMap::new();
        let t0 = templates.intern("SELECT * FROM {db}.{table}_{chunk}");
        let t1 = templates.intern("SELECT id FROM {db}.{table}_{chunk} WHERE id > 5");
        assert_eq!(templates.intern("SELECT * FROM {db}.{table}_{chunk}"), t0);

        let mut dbtables = DbTableMap::new();
        let d0 = dbtables.intern("sky", "objects");
        dbtables.set_scan_rating(d0, 3, true);

        BundleMsg {
            envelope: Envelope {
                version: PROTOCOL_VERSION,
                instance_id: "inst".into(),
                auth_key: "key".into(),
                admin_auth_key: None,
            },
            worker: "w1".into(),
            czarinfo: CoordinatorContact {
                name: "cz".into(),
                id: 9,
                management_host: "cz-host".into(),
                management_port: 7080,
                startup_epoch: 4242,
            },
            queryid: 33,
            uberjobid: 2,
            rowlimit: 0,
            maxtablesizemb: 5000,
            scaninfo: ScanInfo::batch(),
            scaninteractive: false,
            subqueries_map: templates.to_wire(),
            dbtables_map: dbtables.to_wire(),
            jobs: vec![JobMsg {
                job_id: 1,
                attempt_count: 1,
                query_spec_db: "sky".into(),
                chunk_id: 101,
                query_fragments: vec![FragmentMsg {
                    subquerytemplate_indexes: vec![t0, t1],
                    dbtables_indexes: vec![d0],
                    subchunkids: vec![1, 2, 3],
                }],
            }],
        }
    }

    #[test]
    fn bundle_round_trips_exactly() {
        let msg = sample();
        let text = serde_json::to_string(&msg).unwrap();
        let parsed: BundleMsg = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, msg);
        // Serializing the parsed form reproduces the same JSON value.
        assert_eq!(
            serde_json::to_value(&parsed).unwrap(),
            serde_json::from_str::<serde_json::Value>(&text).unwrap()
        );
    }

    #[test]
    fn interning_is_stable_and_dense() {
        let mut m = TemplateMap::new();
        let a = m.intern("q1");
        let b = m.intern("q2");
        assert_eq!(m.intern("q1"), a);
        assert_eq!((a, b), (0, 1));
        assert_eq!(m.get(1).unwrap(), "q2");
        assert!(m.get(2).is_err());
    }

    #[test]
    fn validation_rejects_dangling_index() {
        let mut msg = sample();
        msg.jobs[0].query_fragments[0].subquerytemplate_indexes.push(99);
        assert!(matches!(
            msg.validate_indices(),
            Err(CoreError::InvalidProtocol(_))
        ));
        let ok = sample();
        assert!(ok.validate_indices().is_ok());
    }

    #[test]
    fn string_encoded_ids_are_accepted() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["queryid"] = serde_json::Value::String("33".into());
        value["jobs"][0]["jobId"] = serde_json::Value::String("1".into());
        value["jobs"][0]["chunkId"] = serde_json::Value::String("101".into());
        let parsed: BundleMsg = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn scan_rating_travels_with_the_table_map() {
        let msg = sample();
        let dbtables = DbTableMap::from_wire(&msg.dbtables_map);
        assert_eq!(dbtables.to_wire()[0].scanrating, 3);
        assert!(dbtables.to_wire()[0].lockinmemory);
    }
}
