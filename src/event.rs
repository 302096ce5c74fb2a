// IRQSMP POD LIFECYCLE EVENTS
// THE RECONCILER ONLY SEES WorkloadEvent. EVERYTHING KUBERNETES-SHAPED
// STAYS IN THIS FILE.
//
// SOURCE: A STREAM OF WATCH EVENTS AS PRINTED BY
//   kubectl get pods --watch --output-watch-events -o json
// i.e. CONCATENATED {"type": "ADDED", "object": {<pod>}} DOCUMENTS.
// ADDED -> Created, DELETED -> Deleted. MODIFIED IS IGNORED: CPU REQUESTS
// OF A RUNNING POD ARE IMMUTABLE AND A LABEL CHANGE SURFACES AS ADD/DELETE
// THROUGH THE LABEL SELECTOR.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Deleted,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "added",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
    Unknown(String),
}

impl QosClass {
    pub fn parse(s: &str) -> Self {
        match s {
            "Guaranteed" => Self::Guaranteed,
            "Burstable" => Self::Burstable,
            "BestEffort" => Self::BestEffort,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Guaranteed => "Guaranteed",
            Self::Burstable => "Burstable",
            Self::BestEffort => "BestEffort",
            Self::Unknown(s) => s,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadEvent {
    pub kind: EventKind,
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub qos_class: QosClass,
    pub phase: String,
    pub node_name: String,
}

// --- WIRE FORMAT ---

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct Pod {
    metadata: ObjectMeta,
    spec: PodSpec,
    status: PodStatus,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ObjectMeta {
    name: String,
    namespace: String,
    uid: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PodSpec {
    node_name: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PodStatus {
    phase: String,
    qos_class: String,
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<serde_json::Value>,
}

// UIDS OF A `kubectl get pods -o json` LIST. UNDECODABLE ITEMS ARE SKIPPED.
pub fn parse_pod_list(raw: &[u8]) -> Result<HashSet<String>, serde_json::Error> {
    let list: PodList = serde_json::from_slice(raw)?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<Pod>(item).ok())
        .map(|pod| pod.metadata.uid)
        .filter(|uid| !uid.is_empty())
        .collect())
}

// DECODES A WATCH STREAM INTO WorkloadEvents. A MALFORMED POD OBJECT IS
// LOGGED AND SKIPPED. A SYNTAX ERROR IN THE STREAM ITSELF ENDS IT.
pub struct WatchStream<R: Read> {
    inner: serde_json::StreamDeserializer<'static, serde_json::de::IoRead<R>, RawWatchEvent>,
}

impl<R: Read> WatchStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: serde_json::Deserializer::from_reader(reader).into_iter(),
        }
    }
}

impl<R: Read> Iterator for WatchStream<R> {
    type Item = Result<WorkloadEvent, serde_json::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.inner.next()? {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e)),
            };

            let kind = match raw.kind.as_str() {
                "ADDED" => EventKind::Created,
                "DELETED" => EventKind::Deleted,
                "MODIFIED" | "BOOKMARK" => {
                    debug!("ignoring {} watch event", raw.kind);
                    continue;
                }
                "ERROR" => {
                    warn!("watch error event: {}", raw.object);
                    continue;
                }
                other => {
                    warn!("unknown watch event type {:?}", other);
                    continue;
                }
            };

            let pod: Pod = match serde_json::from_value(raw.object) {
                Ok(pod) => pod,
                Err(e) => {
                    warn!("skipping undecodable pod in {} event: {}", raw.kind, e);
                    continue;
                }
            };
            if pod.metadata.uid.is_empty() {
                warn!("skipping {} event for pod {:?} without uid", raw.kind, pod.metadata.name);
                continue;
            }

            return Some(Ok(WorkloadEvent {
                kind,
                uid: pod.metadata.uid,
                name: pod.metadata.name,
                namespace: pod.metadata.namespace,
                qos_class: QosClass::parse(&pod.status.qos_class),
                phase: pod.status.phase,
                node_name: pod.spec.node_name,
            }));
        }
    }
}

// FORWARD EVERY DECODED EVENT. RETURNS THE NUMBER SENT. STOPS EARLY IF
// THE RECEIVER IS GONE.
pub fn pump<R: Read>(reader: R, tx: &Sender<WorkloadEvent>) -> Result<u64> {
    pump_observed(reader, tx, |_| {})
}

// SAME AS pump, SHOWING EVERY EVENT TO `observe` BEFORE IT IS SENT
pub fn pump_observed<R: Read>(
    reader: R,
    tx: &Sender<WorkloadEvent>,
    mut observe: impl FnMut(&WorkloadEvent),
) -> Result<u64> {
    let mut sent = 0u64;
    for event in WatchStream::new(reader) {
        let event = event.context("malformed watch stream")?;
        observe(&event);
        if tx.send(event).is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

// PODS FORWARDED AS CREATED AND NOT YET DELETED. A RESTARTED WATCH ONLY
// LISTS PODS THAT STILL EXIST, SO A POD DELETED WHILE THE WATCH WAS DOWN
// IS FOUND BY DIFFING THIS SET AGAINST A FRESH LIST.
#[derive(Default)]
pub struct LiveSet {
    pods: BTreeMap<String, WorkloadEvent>,
}

impl LiveSet {
    pub fn observe(&mut self, event: &WorkloadEvent) {
        match event.kind {
            EventKind::Created => {
                self.pods.insert(event.uid.clone(), event.clone());
            }
            EventKind::Deleted => {
                self.pods.remove(&event.uid);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    // Deleted EVENTS FOR TRACKED PODS MISSING FROM `listed`, IN UID ORDER
    pub fn vanished(&self, listed: &HashSet<String>) -> Vec<WorkloadEvent> {
        self.pods
            .values()
            .filter(|ev| !listed.contains(&ev.uid))
            .map(|ev| WorkloadEvent {
                kind: EventKind::Deleted,
                ..ev.clone()
            })
            .collect()
    }
}

// --- SOURCES ---

// KILLS A RUNNING SOURCE PROCESS SO ITS READER SEES EOF
#[derive(Clone, Default)]
pub struct StopHandle {
    child: Option<Arc<Mutex<Option<Child>>>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if let Some(slot) = &self.child {
            let mut slot = slot.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(child) = slot.as_mut() {
                let _ = child.kill();
            }
        }
    }
}

pub trait EventSource: Send {
    fn describe(&self) -> String;

    // BLOCKS UNTIL THE STREAM ENDS
    fn run(&mut self, tx: &Sender<WorkloadEvent>) -> Result<u64>;

    fn stop_handle(&self) -> StopHandle;

    // LONG-LIVED SOURCES ARE RESTARTED WHEN THEY END UNEXPECTEDLY
    fn restartable(&self) -> bool;
}

pub struct KubectlSource {
    kubectl: String,
    node: String,
    selector: String,
    child: Arc<Mutex<Option<Child>>>,
    live: LiveSet,
}

impl KubectlSource {
    pub fn new(kubectl: &str, node: &str, selector: &str) -> Self {
        Self {
            kubectl: kubectl.to_string(),
            node: node.to_string(),
            selector: selector.to_string(),
            child: Arc::new(Mutex::new(None)),
            live: LiveSet::default(),
        }
    }

    fn selector_args(&self) -> Vec<String> {
        vec![
            "-l".to_string(),
            self.selector.clone(),
            "--field-selector".to_string(),
            format!("spec.nodeName={},status.phase=Running", self.node),
        ]
    }

    // NODE-, LABEL- AND PHASE-SCOPED POD WATCH
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "get",
            "pods",
            "--all-namespaces",
            "--watch",
            "--output-watch-events",
            "-o",
            "json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(self.selector_args());
        args
    }

    // ONE-SHOT LIST WITH THE SAME SCOPE AS THE WATCH
    pub fn list_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["get", "pods", "--all-namespaces", "-o", "json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.selector_args());
        args
    }

    fn list_uids(&self) -> Result<HashSet<String>> {
        let out = Command::new(&self.kubectl)
            .args(self.list_args())
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.kubectl))?;
        if !out.status.success() {
            anyhow::bail!(
                "{} get pods failed ({}): {}",
                self.kubectl,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        parse_pod_list(&out.stdout).context("malformed pod list")
    }

    // EMIT Deleted FOR TRACKED PODS THE API SERVER NO LONGER LISTS. A FAILED
    // LIST KEEPS THEM TRACKED FOR THE NEXT RESTART.
    fn resync(&mut self, tx: &Sender<WorkloadEvent>) -> u64 {
        if self.live.is_empty() {
            return 0;
        }
        let listed = match self.list_uids() {
            Ok(listed) => listed,
            Err(e) => {
                warn!("relisting {} tracked pods failed: {:#}", self.live.len(), e);
                return 0;
            }
        };

        let mut sent = 0;
        for event in self.live.vanished(&listed) {
            info!("pod {}/{} disappeared while the watch was down", event.namespace, event.name);
            self.live.observe(&event);
            if tx.send(event).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }
}

impl EventSource for KubectlSource {
    fn describe(&self) -> String {
        format!("{} {}", self.kubectl, self.args().join(" "))
    }

    fn run(&mut self, tx: &Sender<WorkloadEvent>) -> Result<u64> {
        let mut child = Command::new(&self.kubectl)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start {}", self.kubectl))?;
        let stdout = child
            .stdout
            .take()
            .context("kubectl stdout not captured")?;

        *self.child.lock().unwrap_or_else(|p| p.into_inner()) = Some(child);
        info!("starting irq labeled pod watch on node {}", self.node);

        // LIST AFTER THE WATCH IS STARTED: A POD DELETED IN BETWEEN IS
        // EITHER MISSING FROM THE LIST OR REPORTED BY THE WATCH
        let resynced = self.resync(tx);

        let live = &mut self.live;
        let result = pump_observed(stdout, tx, |ev| live.observe(ev)).map(|n| n + resynced);

        if let Some(mut child) = self.child.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = child.kill();
            match child.wait() {
                Ok(status) => info!("irq labeled pod watch is stopped ({})", status),
                Err(e) => warn!("waiting for kubectl failed: {}", e),
            }
        }
        result
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle {
            child: Some(self.child.clone()),
        }
    }

    fn restartable(&self) -> bool {
        true
    }
}

// REPLAYS A RECORDED WATCH STREAM FROM A FILE, OR STDIN FOR "-"
pub struct ReaderSource {
    path: PathBuf,
}

impl ReaderSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EventSource for ReaderSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn run(&mut self, tx: &Sender<WorkloadEvent>) -> Result<u64> {
        if self.path.as_os_str() == "-" {
            return pump(io::stdin().lock(), tx);
        }
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        pump(io::BufReader::new(file), tx)
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::default()
    }

    fn restartable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const ADDED: &str = r#"{"type":"ADDED","object":{"kind":"Pod","metadata":{"name":"dpdk-0","namespace":"default","uid":"8631b3ef-066d-4723-a4b2-797d9d095c4f","labels":{"irq-load-balancing.docker.io":"true"}},"spec":{"nodeName":"worker-1","containers":[]},"status":{"phase":"Running","qosClass":"Guaranteed"}}}"#;

    const DELETED_PRETTY: &str = r#"
{
    "type": "DELETED",
    "object": {
        "metadata": {"name": "web-1", "namespace": "prod", "uid": "u-2"},
        "spec": {"nodeName": "worker-1"},
        "status": {"phase": "Running", "qosClass": "Burstable"}
    }
}"#;

    #[test]
    fn decodes_added_event() {
        let events: Vec<_> = WatchStream::new(ADDED.as_bytes()).collect();
        assert_eq!(events.len(), 1);
        let ev = events[0].as_ref().unwrap();
        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(ev.uid, "8631b3ef-066d-4723-a4b2-797d9d095c4f");
        assert_eq!(ev.name, "dpdk-0");
        assert_eq!(ev.qos_class, QosClass::Guaranteed);
        assert_eq!(ev.phase, "Running");
        assert_eq!(ev.node_name, "worker-1");
    }

    #[test]
    fn decodes_concatenated_pretty_stream() {
        let stream = format!(
            "{}\n{}\n{}",
            ADDED,
            r#"{"type":"MODIFIED","object":{"metadata":{"uid":"x"}}}"#,
            DELETED_PRETTY
        );
        let events: Vec<WorkloadEvent> = WatchStream::new(stream.as_bytes())
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Deleted);
        assert_eq!(events[1].qos_class, QosClass::Burstable);
        assert_eq!(events[1].namespace, "prod");
    }

    #[test]
    fn skips_error_and_uidless_events() {
        let stream = concat!(
            r#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version"}}"#,
            r#"{"type":"ADDED","object":{"metadata":{"name":"no-uid"}}}"#,
            r#"{"type":"ADDED","object":{"metadata":{"uid":7}}}"#,
        );
        assert_eq!(WatchStream::new(stream.as_bytes()).count(), 0);
    }

    #[test]
    fn syntax_error_surfaces() {
        let stream = format!("{}\n{{\"type\": ", ADDED);
        let mut iter = WatchStream::new(stream.as_bytes());
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
    }

    #[test]
    fn qos_class_labels() {
        assert_eq!(QosClass::parse("BestEffort"), QosClass::BestEffort);
        assert_eq!(QosClass::parse(""), QosClass::Unknown(String::new()));
        assert_eq!(QosClass::parse("Odd").label(), "Odd");
    }

    #[test]
    fn pump_forwards_events() {
        let (tx, rx) = mpsc::channel();
        let stream = format!("{}{}", ADDED, DELETED_PRETTY);
        assert_eq!(pump(stream.as_bytes(), &tx).unwrap(), 2);
        drop(tx);
        let kinds: Vec<EventKind> = rx.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Deleted]);
    }

    #[test]
    fn kubectl_args_scope_to_node() {
        let src = KubectlSource::new("kubectl", "worker-1", "irq-load-balancing.docker.io=true");
        let args = src.args();
        assert!(args.contains(&"--output-watch-events".to_string()));
        assert!(args.contains(&"irq-load-balancing.docker.io=true".to_string()));
        assert_eq!(
            args.last().unwrap(),
            "spec.nodeName=worker-1,status.phase=Running"
        );
    }

    fn created(uid: &str) -> WorkloadEvent {
        WorkloadEvent {
            kind: EventKind::Created,
            uid: uid.to_string(),
            name: format!("pod-{}", uid),
            namespace: "default".to_string(),
            qos_class: QosClass::Guaranteed,
            phase: "Running".to_string(),
            node_name: "worker-1".to_string(),
        }
    }

    #[test]
    fn live_set_reports_vanished_pods() {
        let mut live = LiveSet::default();
        live.observe(&created("a"));
        live.observe(&created("b"));
        live.observe(&created("c"));
        live.observe(&WorkloadEvent { kind: EventKind::Deleted, ..created("c") });
        assert_eq!(live.len(), 2);

        let listed: HashSet<String> = ["b".to_string()].into_iter().collect();
        let gone = live.vanished(&listed);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].uid, "a");
        assert_eq!(gone[0].kind, EventKind::Deleted);
        assert_eq!(gone[0].qos_class, QosClass::Guaranteed);

        assert!(live.vanished(&["a".to_string(), "b".to_string()].into_iter().collect()).is_empty());
    }

    #[test]
    fn pod_list_uids() {
        let raw = br#"{"apiVersion":"v1","kind":"List","items":[
            {"metadata":{"name":"a","uid":"u-1"},"status":{"phase":"Running"}},
            {"metadata":{"name":"no-uid"}},
            {"metadata":{"uid":7}}
        ]}"#;
        let uids = parse_pod_list(raw).unwrap();
        assert_eq!(uids.len(), 1);
        assert!(uids.contains("u-1"));
        assert!(parse_pod_list(b"{\"kind\":\"Status\"}").is_err());
    }

    #[test]
    fn list_args_match_watch_scope() {
        let src = KubectlSource::new("kubectl", "worker-1", "irq=true");
        let list = src.list_args();
        assert!(!list.contains(&"--watch".to_string()));
        assert_eq!(list[list.len() - 4..], src.args()[src.args().len() - 4..]);
    }

    // KUBECTL STAND-IN: THE FIRST WATCH REPORTS PODS A AND B, LATER WATCHES
    // ONLY B. THE LIST ONLY KNOWS B.
    #[test]
    fn restart_emits_deletes_missed_while_down() {
        use std::os::unix::fs::PermissionsExt;

        let pod = |uid: &str| {
            format!(
                r#"{{"type":"ADDED","object":{{"metadata":{{"name":"{uid}","namespace":"default","uid":"{uid}"}},"spec":{{"nodeName":"worker-1"}},"status":{{"phase":"Running","qosClass":"Guaranteed"}}}}}}"#,
                uid = uid
            )
        };
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("watch1.json"), format!("{}\n{}\n", pod("a"), pod("b"))).unwrap();
        std::fs::write(dir.path().join("watch2.json"), format!("{}\n", pod("b"))).unwrap();
        std::fs::write(
            dir.path().join("list.json"),
            r#"{"items":[{"metadata":{"name":"b","uid":"b"}}]}"#,
        )
        .unwrap();

        let script = dir.path().join("kubectl");
        std::fs::write(
            &script,
            r#"#!/bin/sh
d=$(dirname "$0")
case " $* " in
  *" --watch "*)
    if [ -e "$d/watched" ]; then cat "$d/watch2.json"; else touch "$d/watched"; cat "$d/watch1.json"; fi ;;
  *) cat "$d/list.json" ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut src = KubectlSource::new(script.to_str().unwrap(), "worker-1", "irq=true");
        assert_eq!(src.run(&tx).unwrap(), 2);
        assert_eq!(src.run(&tx).unwrap(), 2);
        drop(tx);

        let seen: Vec<(EventKind, String)> = rx.iter().map(|e| (e.kind, e.uid)).collect();
        assert_eq!(
            seen,
            vec![
                (EventKind::Created, "a".to_string()),
                (EventKind::Created, "b".to_string()),
                (EventKind::Deleted, "a".to_string()),
                (EventKind::Created, "b".to_string()),
            ]
        );
        assert_eq!(src.live.len(), 1);
    }

    #[test]
    fn reader_source_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, ADDED).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut src = ReaderSource::new(&path);
        assert!(!src.restartable());
        assert_eq!(src.run(&tx).unwrap(), 1);
        assert_eq!(rx.recv().unwrap().name, "dpdk-0");
    }
}
