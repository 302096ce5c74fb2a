// IRQSMP BANNED FILE WATCHER
// WATCHES THE BANNED CPUS FILE AND REFRESHES THE BALANCER WHENEVER ITS
// CONTENT CHANGES, WHOEVER WROTE IT. USEFUL WHEN THE RECONCILER RUNS
// WITHOUT DIRECT REFRESH, OR WHEN AN OPERATOR EDITS THE FILE BY HAND.
//
// THE DEDUPE STATE LIVES IN THE BALANCER, NOT IN THE RECONCILER LOCK:
// THE TWO PATHS ONLY MEET THROUGH THE FILE ON DISK.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::event::{AccessKind, AccessMode, EventKind};
use notify::{RecursiveMode, Watcher};

use crate::balancer::{Balancer, RefreshOutcome};
use crate::banned::{self, BannedFormat};
use crate::mask::AffinityMask;

const POLL: Duration = Duration::from_millis(200);

pub struct BannedWatcher {
    path: PathBuf,
    format: BannedFormat,
    balancer: Arc<Balancer>,
}

impl BannedWatcher {
    pub fn new(path: &Path, format: BannedFormat, balancer: Arc<Balancer>) -> Self {
        Self {
            path: path.to_path_buf(),
            format,
            balancer,
        }
    }

    // INOTIFY NEEDS THE FILE TO EXIST
    pub fn prepare(&self) -> io::Result<()> {
        if !self.path.exists() {
            info!("creating empty {}", self.path.display());
            fs::File::create(&self.path)?;
        }
        Ok(())
    }

    // READ, VALIDATE, REFRESH. None WHEN NOTHING WAS RUN.
    pub fn on_change(&self) -> Option<RefreshOutcome> {
        let banned = match banned::read_banned(&self.path, self.format) {
            Ok(Some(b)) => b,
            Ok(None) => {
                debug!("{} holds no banned mask", self.path.display());
                return None;
            }
            Err(e) => {
                error!("failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        if let Err(e) = AffinityMask::decode(&banned) {
            warn!("ignoring banned cpus {:?} in {}: {}", banned, self.path.display(), e);
            return None;
        }
        self.balancer.refresh_if_changed(&banned)
    }

    // THE WATCH IS REGISTERED BEFORE RETURNING, SO A BAD PATH FAILS HERE
    // AND NOT INSIDE THE THREAD
    pub fn spawn(self, shutdown: &'static AtomicBool) -> Result<JoinHandle<()>> {
        self.prepare()
            .with_context(|| format!("failed to create {}", self.path.display()))?;

        let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(tx).context("failed to create file watcher")?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.path.display()))?;
        info!("watching {} for banned cpus", self.path.display());

        // PICK UP WHATEVER IS ALREADY THERE
        self.on_change();

        let handle = thread::Builder::new()
            .name("banned-watch".to_string())
            .spawn(move || {
                let _watcher = watcher;
                while !shutdown.load(Ordering::Relaxed) {
                    match rx.recv_timeout(POLL) {
                        Ok(Ok(event)) => {
                            if is_write(&event.kind) {
                                debug!("{:?} on {}", event.kind, self.path.display());
                                self.on_change();
                            }
                        }
                        Ok(Err(e)) => error!("file watch error: {}", e),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("banned file watch stopped");
            })
            .context("failed to spawn watcher thread")?;
        Ok(handle)
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{CommandRunner, CommandSpec, RunError};
    use notify::event::{CreateKind, ModifyKind};
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<CommandSpec>>>);

    impl CommandRunner for Recorder {
        fn run(&self, cmd: &CommandSpec) -> Result<(), RunError> {
            self.0.lock().unwrap().push(cmd.clone());
            Ok(())
        }
    }

    fn watcher(path: &Path, format: BannedFormat) -> (BannedWatcher, Arc<Mutex<Vec<CommandSpec>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let balancer = Balancer::new(Box::new(Recorder(calls.clone())), "irqbalance", "irqbalance");
        (BannedWatcher::new(path, format, Arc::new(balancer)), calls)
    }

    #[test]
    fn change_refreshes_once_per_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod_irq_banned_cpus");
        let (w, calls) = watcher(&path, BannedFormat::Bare);
        w.prepare().unwrap();
        assert!(w.on_change().is_none());

        fs::write(&path, "ff000000,0000001f\n").unwrap();
        assert!(w.on_change().unwrap().applied());
        assert!(w.on_change().is_none());

        fs::write(&path, "ff000000,00000006").unwrap();
        assert!(w.on_change().is_some());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].env[0].1, "ff000000,00000006");
    }

    #[test]
    fn invalid_content_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod_irq_banned_cpus");
        fs::write(&path, "not a mask").unwrap();
        let (w, calls) = watcher(&path, BannedFormat::Bare);
        assert!(w.on_change().is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn shell_format_reads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("irqbalance");
        fs::write(&path, "IRQBALANCE_ARGS=\"\"\nIRQBALANCE_BANNED_CPUS=\"0000000f\"\n").unwrap();
        let (w, calls) = watcher(&path, BannedFormat::Shell);
        assert!(w.on_change().is_some());
        assert_eq!(calls.lock().unwrap()[0].env[0].1, "0000000f");
    }

    #[test]
    fn write_kinds() {
        assert!(is_write(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_write(&EventKind::Create(CreateKind::File)));
        assert!(is_write(&EventKind::Access(AccessKind::Close(AccessMode::Write))));
        assert!(!is_write(&EventKind::Access(AccessKind::Open(AccessMode::Any))));
    }
}
