// IRQSMP CPU ALLOCATION STORE
// READS THE KUBELET CPU MANAGER CHECKPOINT AND CACHES WHICH CPUS EACH
// GUARANTEED POD WAS GRANTED.
//
// TWO ON-DISK SCHEMAS EXIST:
//   V1: entries = { pod_uid: "cpuset" }
//   V2: entries = { pod_uid: { container: "cpuset" } }
// V1 IS TRIED FIRST. A V2 FILE FAILS V1 STRUCTURALLY (OBJECT WHERE A
// STRING IS EXPECTED) AND FALLS THROUGH.
//
// THE CACHE IS MERGED, NEVER REPLACED. A DELETED POD IS USUALLY ALREADY
// GONE FROM THE CHECKPOINT WHEN ITS DELETE EVENT ARRIVES, SO ITS LAST KNOWN
// CPUS MUST SURVIVE UNTIL remove() IS CALLED.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::Deserialize;
use thiserror::Error;

pub const CHECKPOINT_FILE: &str = "cpu_manager_state";

// THE ONLY CPU MANAGER POLICY THAT HANDS OUT EXCLUSIVE CPUS
pub const POLICY_STATIC: &str = "static";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cpu manager checkpoint {} unreadable: v1: {v1}; v2: {v2}", .path.display())]
    Unreadable {
        path: PathBuf,
        v1: String,
        v2: String,
    },
    #[error("checkpoint directory {}: {reason}", .path.display())]
    Directory { path: PathBuf, reason: String },
}

// CHECKPOINT CHECKSUMS ARE PARSED BUT NOT VERIFIED: KUBELET HASHES A
// KUBELET-INTERNAL DUMP OF THE STRUCT.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointV1 {
    // REQUIRED: KUBELET ALWAYS WRITES IT, AND WITHOUT IT ANY JSON OBJECT
    // WOULD PASS AS A CHECKPOINT
    policy_name: String,
    #[serde(default)]
    #[allow(dead_code)]
    default_cpu_set: String,
    #[serde(default)]
    entries: HashMap<String, String>,
    #[serde(default)]
    #[allow(dead_code)]
    checksum: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointV2 {
    // REQUIRED: KUBELET ALWAYS WRITES IT, AND WITHOUT IT ANY JSON OBJECT
    // WOULD PASS AS A CHECKPOINT
    policy_name: String,
    #[serde(default)]
    #[allow(dead_code)]
    default_cpu_set: String,
    #[serde(default)]
    entries: HashMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    #[allow(dead_code)]
    checksum: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schema {
    V1,
    V2,
}

impl Schema {
    pub fn label(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

// ONE CACHED POD ENTRY, IN THE SHAPE THE CHECKPOINT STORED IT
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    Pod(String),
    PerContainer(BTreeMap<String, String>),
}

impl Assignment {
    // FLATTENED CPU LIST. PER-CONTAINER SETS ARE COMMA-JOINED IN
    // CONTAINER-NAME ORDER.
    pub fn cpus(&self) -> String {
        match self {
            Self::Pod(cpus) => cpus.clone(),
            Self::PerContainer(containers) => {
                containers.values().map(String::as_str).collect::<Vec<_>>().join(",")
            }
        }
    }
}

// OUTCOME OF ONE CHECKPOINT READ
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshStatus {
    pub schema: Schema,
    pub policy: String,
    // ENTRIES MERGED INTO THE CACHE (0 UNDER A NON-STATIC POLICY)
    pub merged: usize,
}

impl RefreshStatus {
    pub fn is_static(&self) -> bool {
        self.policy == POLICY_STATIC
    }
}

pub struct Store {
    path: PathBuf,
    cache: HashMap<String, Assignment>,
}

impl Store {
    // ROOT MUST BE AN EXISTING DIRECTORY. THE CHECKPOINT FILE ITSELF MAY
    // NOT EXIST YET (CPU MANAGER STILL STARTING) AND IS ONLY READ ON LOOKUP.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let root = root.as_ref();
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(CheckpointError::Directory {
                    path: root.to_path_buf(),
                    reason: "not a directory".to_string(),
                });
            }
            Err(e) => {
                return Err(CheckpointError::Directory {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(Self {
            path: root.join(CHECKPOINT_FILE),
            cache: HashMap::new(),
        })
    }

    // STORE WITH A PRE-POPULATED CACHE. THE CHECKPOINT PATH NEED NOT EXIST.
    pub fn with_entries(
        path: impl Into<PathBuf>,
        entries: impl IntoIterator<Item = (String, Assignment)>,
    ) -> Self {
        Self {
            path: path.into(),
            cache: entries.into_iter().collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    // RE-READ THE CHECKPOINT AND MERGE ITS ENTRIES INTO THE CACHE
    pub fn refresh(&mut self) -> Result<RefreshStatus, CheckpointError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                error!("error in reading cpu state {}: {}", self.path.display(), e);
                return Err(CheckpointError::Unreadable {
                    path: self.path.clone(),
                    v1: e.to_string(),
                    v2: e.to_string(),
                });
            }
        };

        let v1_err = match serde_json::from_str::<CheckpointV1>(&raw) {
            Ok(cp) => {
                let merged = if cp.policy_name == POLICY_STATIC {
                    let n = cp.entries.len();
                    self.cache.extend(
                        cp.entries
                            .into_iter()
                            .map(|(uid, cpus)| (uid, Assignment::Pod(cpus))),
                    );
                    n
                } else {
                    info!("cpu manager policy is {:?}, not static. no dedicated cpus", cp.policy_name);
                    0
                };
                return Ok(RefreshStatus {
                    schema: Schema::V1,
                    policy: cp.policy_name,
                    merged,
                });
            }
            Err(e) => e,
        };

        match serde_json::from_str::<CheckpointV2>(&raw) {
            Ok(cp) => {
                let merged = if cp.policy_name == POLICY_STATIC {
                    let n = cp.entries.len();
                    self.cache.extend(
                        cp.entries
                            .into_iter()
                            .map(|(uid, containers)| (uid, Assignment::PerContainer(containers))),
                    );
                    n
                } else {
                    info!("cpu manager policy is {:?}, not static. no dedicated cpus", cp.policy_name);
                    0
                };
                Ok(RefreshStatus {
                    schema: Schema::V2,
                    policy: cp.policy_name,
                    merged,
                })
            }
            Err(v2_err) => {
                error!("error in reading v2 cpu state: {}", v2_err);
                Err(CheckpointError::Unreadable {
                    path: self.path.clone(),
                    v1: v1_err.to_string(),
                    v2: v2_err.to_string(),
                })
            }
        }
    }

    // FRESH READ, THEN CACHE LOOKUP. EMPTY STRING MEANS NO DEDICATED CPUS.
    pub fn get_assigned_cpus(&mut self, uid: &str) -> Result<String, CheckpointError> {
        self.refresh()?;
        Ok(self.get_assigned_cpus_from_cache(uid))
    }

    // NO STORAGE ACCESS. FOR PODS ALREADY PURGED FROM THE CHECKPOINT.
    pub fn get_assigned_cpus_from_cache(&self, uid: &str) -> String {
        self.cache.get(uid).map(Assignment::cpus).unwrap_or_default()
    }

    pub fn remove(&mut self, uid: &str) {
        self.cache.remove(uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD_A: &str = "8631b3ef-066d-4723-a4b2-797d9d095c4f";
    const POD_B: &str = "9631b3ef-066d-4723-a4b2-797d9d095c50";

    fn write_checkpoint(dir: &Path, body: &str) {
        fs::write(dir.join(CHECKPOINT_FILE), body).unwrap();
    }

    #[test]
    fn open_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Store::open(dir.path()).is_ok());

        let missing = dir.path().join("nope");
        assert!(matches!(Store::open(&missing), Err(CheckpointError::Directory { .. })));

        let file = dir.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(Store::open(&file), Err(CheckpointError::Directory { .. })));
    }

    #[test]
    fn empty_cache_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_assigned_cpus_from_cache("test"), "");
    }

    #[test]
    fn cache_v1_remove() {
        let mut store = Store::with_entries(
            "/nonexistent",
            [(POD_A.to_string(), Assignment::Pod("1-2,29".to_string()))],
        );
        assert_eq!(store.get_assigned_cpus_from_cache(POD_A), "1-2,29");
        store.remove(POD_A);
        assert_eq!(store.get_assigned_cpus_from_cache(POD_A), "");
    }

    #[test]
    fn cache_v2_flattens_containers() {
        let mut b = BTreeMap::new();
        b.insert("c1".to_string(), "3-5,30".to_string());
        b.insert("c2".to_string(), "6-7".to_string());
        let mut a = BTreeMap::new();
        a.insert("busybox".to_string(), "1-2,29".to_string());

        let mut store = Store::with_entries(
            "/nonexistent",
            [
                (POD_A.to_string(), Assignment::PerContainer(a)),
                (POD_B.to_string(), Assignment::PerContainer(b)),
            ],
        );
        assert_eq!(store.get_assigned_cpus_from_cache(POD_A), "1-2,29");
        store.remove(POD_A);
        assert_eq!(store.get_assigned_cpus_from_cache(POD_A), "");

        let cpus = store.get_assigned_cpus_from_cache(POD_B);
        assert!(cpus.contains("3-5,30"));
        assert!(cpus.contains("6-7"));
        assert_eq!(cpus, "3-5,30,6-7");
    }

    #[test]
    fn refresh_v1_static() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(
            dir.path(),
            r#"{"policyName":"static","defaultCpuSet":"0,3-63","entries":{"8631b3ef-066d-4723-a4b2-797d9d095c4f":"1-2"},"checksum":1234}"#,
        );
        let mut store = Store::open(dir.path()).unwrap();
        let status = store.refresh().unwrap();
        assert_eq!(status.schema, Schema::V1);
        assert_eq!(status.merged, 1);
        assert!(status.is_static());
        assert_eq!(store.get_assigned_cpus(POD_A).unwrap(), "1-2");
    }

    #[test]
    fn refresh_v2_static() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(
            dir.path(),
            r#"{"policyName":"static","defaultCpuSet":"0,8-63","entries":{"9631b3ef-066d-4723-a4b2-797d9d095c50":{"c2":"6-7","c1":"3-5"}},"checksum":99}"#,
        );
        let mut store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_assigned_cpus(POD_B).unwrap(), "3-5,6-7");
        assert_eq!(store.refresh().unwrap().schema, Schema::V2);
    }

    #[test]
    fn refresh_v2_non_static_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(
            dir.path(),
            r#"{"policyName":"none","defaultCpuSet":"","entries":{"9631b3ef-066d-4723-a4b2-797d9d095c50":{"c1":"3-5"}},"checksum":1}"#,
        );
        let mut store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_assigned_cpus(POD_B).unwrap(), "");
        assert_eq!(store.cached(), 0);
    }

    #[test]
    fn refresh_merges_without_replacing() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(
            dir.path(),
            r#"{"policyName":"static","entries":{"8631b3ef-066d-4723-a4b2-797d9d095c4f":"1-2"}}"#,
        );
        let mut store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_assigned_cpus(POD_A).unwrap(), "1-2");

        // POD_A PURGED BY KUBELET, POD_B ADDED
        write_checkpoint(
            dir.path(),
            r#"{"policyName":"static","entries":{"9631b3ef-066d-4723-a4b2-797d9d095c50":"4"}}"#,
        );
        assert_eq!(store.get_assigned_cpus(POD_B).unwrap(), "4");
        assert_eq!(store.get_assigned_cpus(POD_A).unwrap(), "1-2");

        store.remove(POD_A);
        assert_eq!(store.get_assigned_cpus_from_cache(POD_A), "");
        assert_eq!(store.get_assigned_cpus(POD_A).unwrap(), "");
    }

    #[test]
    fn refresh_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        // MISSING FILE
        assert!(matches!(store.get_assigned_cpus(POD_A), Err(CheckpointError::Unreadable { .. })));

        write_checkpoint(dir.path(), "{not json");
        assert!(matches!(store.refresh(), Err(CheckpointError::Unreadable { .. })));

        write_checkpoint(dir.path(), r#"{"policyName":"static","entries":{"x":7}}"#);
        assert!(matches!(store.refresh(), Err(CheckpointError::Unreadable { .. })));

        // UNRELATED JSON IS NOT A CHECKPOINT WITH A NON-STATIC POLICY
        write_checkpoint(dir.path(), r#"{"unrelated":true}"#);
        assert!(matches!(store.get_assigned_cpus("x"), Err(CheckpointError::Unreadable { .. })));
        write_checkpoint(dir.path(), r#"{"entries":{}}"#);
        assert!(matches!(store.refresh(), Err(CheckpointError::Unreadable { .. })));
    }
}
