// IRQSMP AFFINITY RECONCILER
// KEEPS IRQ BALANCING OFF CPUS EXCLUSIVELY OWNED BY GUARANTEED PODS.
//
// ONE LOCK GUARDS EVERYTHING: CHECKPOINT LOOKUP, CACHE MUTATION, THE
// READ-MODIFY-WRITE OF THE AFFINITY MASK, THE BANNED FILE WRITE AND THE
// BALANCER REFRESH. TWO PODS ON OVERLAPPING CPUS CREATED/DELETED BACK TO
// BACK WOULD OTHERWISE LOSE UPDATES.
//
// WRITE ORDER MATTERS: MASK FILE FIRST, BANNED FILE SECOND. A FILE WATCHER
// FIRES ON THE BANNED FILE AND MUST SEE THE MASK ALREADY UPDATED.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::balancer::{Balancer, RefreshOutcome};
use crate::banned::{self, BannedFormat};
use crate::checkpoint::{CheckpointError, Store};
use crate::config::Config;
use crate::event::{EventKind, QosClass, WorkloadEvent};
use crate::mask::{self, MaskError, MaskUpdate};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ReconcileError + '_ {
    move |source| ReconcileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ONE SUCCESSFUL apply_affinity
#[derive(Debug)]
pub struct Applied {
    pub cpus: String,
    pub enable: bool,
    pub update: MaskUpdate,
    // None WHEN DIRECT REFRESH IS OFF
    pub refresh: Option<RefreshOutcome>,
}

#[derive(Debug)]
pub enum Outcome {
    Applied(Applied),
    // POD HOLDS NO EXCLUSIVE CPUS (OR POLICY IS NOT STATIC)
    NoCpus,
    Ignored(&'static str),
}

pub struct Reconciler {
    node: String,
    mask_file: PathBuf,
    banned_file: PathBuf,
    banned_format: BannedFormat,
    balancer: Option<Arc<Balancer>>,
    // THE RECONCILIATION LOCK. THE STORE LIVES INSIDE IT SO THE CACHE IS
    // ONLY EVER TOUCHED UNDER THE LOCK.
    state: Mutex<Store>,
}

impl Reconciler {
    pub fn new(config: &Config, store: Store, balancer: Option<Arc<Balancer>>) -> Self {
        Self {
            node: config.node.clone(),
            mask_file: config.mask_file.clone(),
            banned_file: config.banned_file.clone(),
            banned_format: config.banned_format,
            balancer: if config.direct_refresh { balancer } else { None },
            state: Mutex::new(store),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // CREATE THE BANNED FILE FROM THE CURRENT MASK IF IT HOLDS NO MASK YET.
    // RETURNS THE BANNED MASK WRITTEN, IF ANY.
    pub fn initialize(&self) -> Result<Option<String>, ReconcileError> {
        let _guard = self.lock();

        match banned::read_banned(&self.banned_file, self.banned_format) {
            Ok(Some(existing)) => {
                debug!("banned cpus file {} holds {}", self.banned_file.display(), existing);
                return Ok(None);
            }
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&self.banned_file)(e)),
        }

        let current = self.read_mask()?;
        let inverted = mask::invert_mask_text(&current)?;
        banned::write_banned(&self.banned_file, self.banned_format, &inverted)
            .map_err(io_err(&self.banned_file))?;
        info!("initialized {} with banned cpus {}", self.banned_file.display(), inverted);
        Ok(Some(inverted))
    }

    pub fn current_mask(&self) -> Result<String, ReconcileError> {
        let _guard = self.lock();
        self.read_mask()
    }

    fn read_mask(&self) -> Result<String, ReconcileError> {
        let content = fs::read_to_string(&self.mask_file).map_err(io_err(&self.mask_file))?;
        Ok(content.trim().to_string())
    }

    // ENABLE=false RESERVES THE CPUS (NO IRQS), ENABLE=true RELEASES THEM
    pub fn apply_affinity(&self, cpus: &str, enable: bool) -> Result<Applied, ReconcileError> {
        let _guard = self.lock();
        self.apply_locked(cpus, enable)
    }

    // CALLER HOLDS THE LOCK
    fn apply_locked(&self, cpus: &str, enable: bool) -> Result<Applied, ReconcileError> {
        let current = self.read_mask()?;
        let update = mask::update_affinity_mask(cpus, &current, enable)?;

        fs::write(&self.mask_file, &update.mask).map_err(io_err(&self.mask_file))?;
        info!("irqbalance banned cpus {}", update.banned);

        // MUST STAY AFTER THE MASK WRITE
        banned::write_banned(&self.banned_file, self.banned_format, &update.banned)
            .map_err(io_err(&self.banned_file))?;

        let refresh = self.balancer.as_ref().map(|b| b.refresh(&update.banned));

        Ok(Applied {
            cpus: cpus.to_string(),
            enable,
            update,
            refresh,
        })
    }

    pub fn handle_event(&self, event: &WorkloadEvent) -> Result<Outcome, ReconcileError> {
        info!(
            "pod {} {}/{}, {}, {}, {}",
            event.kind.label(),
            event.namespace,
            event.name,
            event.phase,
            event.qos_class.label(),
            event.node_name
        );

        if !event.node_name.is_empty() && event.node_name != self.node {
            debug!("pod {} is on node {}. ignoring", event.name, event.node_name);
            return Ok(Outcome::Ignored("other node"));
        }
        if event.qos_class != QosClass::Guaranteed {
            info!("pod {} is with {} qos class. ignoring", event.name, event.qos_class.label());
            return Ok(Outcome::Ignored("not guaranteed"));
        }

        match event.kind {
            EventKind::Created => self.on_create(event),
            EventKind::Deleted => self.on_delete(event),
        }
    }

    fn on_create(&self, event: &WorkloadEvent) -> Result<Outcome, ReconcileError> {
        let mut store = self.lock();

        let cpus = store.get_assigned_cpus(&event.uid).map_err(|e| {
            error!("error in retrieving assigned cpus for pod {}: {}", event.name, e);
            e
        })?;
        info!("assigned cpus {:?} for pod {}", cpus, event.name);
        if cpus.is_empty() {
            return Ok(Outcome::NoCpus);
        }

        match self.apply_locked(&cpus, false) {
            Ok(applied) => Ok(Outcome::Applied(applied)),
            Err(e) => {
                error!("set irq load balancing for pod {} failed: {}", event.name, e);
                Err(e)
            }
        }
    }

    // THE CHECKPOINT USUALLY NO LONGER LISTS A DELETED POD. FALL BACK TO
    // THE CACHE, AND DROP THE CACHE ENTRY WHATEVER HAPPENS.
    fn on_delete(&self, event: &WorkloadEvent) -> Result<Outcome, ReconcileError> {
        let mut store = self.lock();

        let cpus = match store.get_assigned_cpus(&event.uid) {
            Ok(cpus) => cpus,
            Err(e) => {
                warn!("not able to retrieve assigned cpus for pod {}: {}", event.name, e);
                store.get_assigned_cpus_from_cache(&event.uid)
            }
        };
        info!("assigned cpus {:?} for pod {}", cpus, event.name);

        let result = if cpus.is_empty() {
            Ok(Outcome::NoCpus)
        } else {
            self.apply_locked(&cpus, true).map(Outcome::Applied).map_err(|e| {
                error!("reset irq load balancing for pod {} failed: {}", event.name, e);
                e
            })
        };

        store.remove(&event.uid);
        result
    }

    pub fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> T {
        let mut store = self.lock();
        f(&mut store)
    }
}
