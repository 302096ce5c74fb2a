// IRQSMP CONFIGURATION
// DEFAULT PATHS ASSUME THE HOST FILESYSTEM IS MOUNTED AT /host (DAEMONSET).
// THE CLI RESOLVES EVERYTHING INTO ONE Config BEFORE ANY COMPONENT IS BUILT.

use std::path::PathBuf;
use std::time::Duration;

use crate::banned::BannedFormat;
use crate::checkpoint::CHECKPOINT_FILE;

pub const DEFAULT_SMP_AFFINITY_FILE: &str = "/host/proc/irq/default_smp_affinity";
pub const DEFAULT_BANNED_CPUS_FILE: &str = "/host/etc/sysconfig/pod_irq_banned_cpus";
pub const DEFAULT_CHECKPOINT_ROOT: &str = "/host/var/lib/kubelet/";

// PODS OPT IN TO IRQ MASKING WITH THIS LABEL
pub const DEFAULT_LABEL_SELECTOR: &str = "irq-load-balancing.docker.io=true";
pub const NODE_NAME_ENV: &str = "WORKER_NODE_NAME";

pub const DEFAULT_BALANCER_SERVICE: &str = "irqbalance";
pub const DEFAULT_BALANCER_BINARY: &str = "irqbalance";
pub const DEFAULT_BALANCER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KUBECTL: &str = "kubectl";

// SHUTDOWN: HOW LONG TO WAIT FOR THE EVENT SOURCE, AND HOW OFTEN TO LOOK
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(600);
// DELAY BEFORE RESTARTING A WATCH THAT ENDED ON ITS OWN
pub const SOURCE_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub node: String,
    pub mask_file: PathBuf,
    pub banned_file: PathBuf,
    pub banned_format: BannedFormat,
    pub checkpoint_root: PathBuf,
    pub label_selector: String,
    pub kubectl: String,
    pub balancer_service: String,
    pub balancer_binary: String,
    pub balancer_timeout: Duration,
    // REFRESH THE BALANCER FROM THE RECONCILER ITSELF
    pub direct_refresh: bool,
    // ALSO WATCH THE BANNED FILE FOR OUT-OF-BAND EDITS
    pub watch_banned: bool,
    // REPLAY EVENTS FROM A FILE INSTEAD OF WATCHING THE API SERVER
    pub events_from: Option<PathBuf>,
}

impl Config {
    pub fn for_node(node: &str) -> Self {
        Self {
            node: node.to_string(),
            mask_file: PathBuf::from(DEFAULT_SMP_AFFINITY_FILE),
            banned_file: PathBuf::from(DEFAULT_BANNED_CPUS_FILE),
            banned_format: BannedFormat::Bare,
            checkpoint_root: PathBuf::from(DEFAULT_CHECKPOINT_ROOT),
            label_selector: DEFAULT_LABEL_SELECTOR.to_string(),
            kubectl: DEFAULT_KUBECTL.to_string(),
            balancer_service: DEFAULT_BALANCER_SERVICE.to_string(),
            balancer_binary: DEFAULT_BALANCER_BINARY.to_string(),
            balancer_timeout: Duration::from_secs(DEFAULT_BALANCER_TIMEOUT_SECS),
            direct_refresh: true,
            watch_banned: false,
            events_from: None,
        }
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint_root.join(CHECKPOINT_FILE)
    }
}
