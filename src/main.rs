// IRQSMP -- IRQ AFFINITY RECONCILER FOR KUBERNETES WORKER NODES
// MOVES DEVICE INTERRUPTS OFF CPUS THAT KUBELET PINNED TO GUARANTEED PODS
//
// EVENT SOURCE -> CHANNEL -> RECONCILER (ONE LOCK) -> MASK FILE, BANNED FILE
// -> irqbalance REFRESH. OPTIONAL SECOND PATH: BANNED FILE WATCH -> REFRESH.

mod cli;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};

use irqsmp::balancer::Balancer;
use irqsmp::banned::BannedFormat;
use irqsmp::checkpoint::Store;
use irqsmp::config::{
    Config, DEFAULT_BALANCER_BINARY, DEFAULT_BALANCER_SERVICE, DEFAULT_BALANCER_TIMEOUT_SECS,
    DEFAULT_BANNED_CPUS_FILE, DEFAULT_CHECKPOINT_ROOT, DEFAULT_KUBECTL, DEFAULT_LABEL_SELECTOR,
    DEFAULT_SMP_AFFINITY_FILE, SHUTDOWN_GRACE, SHUTDOWN_POLL, SOURCE_RESTART_DELAY,
};
use irqsmp::event::{EventSource, KubectlSource, ReaderSource, WorkloadEvent};
use irqsmp::reconcile::{Outcome, Reconciler};
use irqsmp::watch::BannedWatcher;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "irqsmp", version)]
#[command(about = "IRQSMP -- KEEPS IRQS OFF EXCLUSIVELY ALLOCATED POD CPUS")]
struct Cli {
    // APPEND LOG OUTPUT TO THIS FILE INSTEAD OF STDERR
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    // DEBUG LOGGING (RUST_LOG STILL WINS)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    // RECONCILE DAEMON: WATCH PODS, UPDATE MASKS, REFRESH THE BALANCER
    Run(RunArgs),
    // ONLY WATCH THE BANNED CPUS FILE AND REFRESH THE BALANCER ON CHANGE
    WatchBanned(WatchArgs),
    // REPORT WHETHER THIS HOST CAN RUN THE DAEMON
    Check(CheckArgs),
    // OFFLINE MASK CALCULATOR
    Mask(cli::mask::MaskArgs),
}

#[derive(Args, Clone)]
pub struct PathArgs {
    // HOST DEFAULT IRQ AFFINITY MASK
    #[arg(long, default_value = DEFAULT_SMP_AFFINITY_FILE)]
    pub mask_file: PathBuf,

    // FILE THE BALANCER READS ITS BANNED CPUS FROM
    #[arg(long, default_value = DEFAULT_BANNED_CPUS_FILE)]
    pub banned_file: PathBuf,

    #[arg(long, value_enum, default_value_t = BannedFormat::Bare)]
    pub banned_format: BannedFormat,

    // DIRECTORY HOLDING KUBELET'S cpu_manager_state
    #[arg(long, default_value = DEFAULT_CHECKPOINT_ROOT)]
    pub checkpoint_root: PathBuf,
}

#[derive(Args, Clone)]
pub struct BalancerArgs {
    #[arg(long, default_value = DEFAULT_BALANCER_SERVICE)]
    pub balancer_service: String,

    #[arg(long, default_value = DEFAULT_BALANCER_BINARY)]
    pub balancer_binary: String,

    // KILL A BALANCER COMMAND AFTER THIS MANY SECONDS
    #[arg(long, default_value_t = DEFAULT_BALANCER_TIMEOUT_SECS)]
    pub balancer_timeout_secs: u64,
}

#[derive(Args)]
struct RunArgs {
    // NODE THIS DAEMON RUNS ON
    #[arg(long, env = "WORKER_NODE_NAME")]
    node: String,

    #[command(flatten)]
    paths: PathArgs,

    #[command(flatten)]
    balancer: BalancerArgs,

    // PODS WITHOUT THIS LABEL ARE NEVER SEEN
    #[arg(long, default_value = DEFAULT_LABEL_SELECTOR)]
    label_selector: String,

    #[arg(long, default_value = DEFAULT_KUBECTL)]
    kubectl: String,

    // DO NOT TOUCH THE BALANCER FROM THE RECONCILER (USE WITH --watch-banned
    // OR A SEPARATE watch-banned PROCESS)
    #[arg(long)]
    no_direct_refresh: bool,

    // ALSO RUN THE BANNED FILE WATCHER IN THIS PROCESS
    #[arg(long)]
    watch_banned: bool,

    // REPLAY WATCH EVENTS FROM A FILE ("-" FOR STDIN) INSTEAD OF kubectl
    #[arg(long)]
    events_from: Option<PathBuf>,
}

#[derive(Args)]
struct WatchArgs {
    #[command(flatten)]
    paths: PathArgs,

    #[command(flatten)]
    balancer: BalancerArgs,
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    paths: PathArgs,

    #[arg(long, default_value = DEFAULT_KUBECTL)]
    kubectl: String,
}

fn apply_paths(config: &mut Config, paths: &PathArgs) {
    config.mask_file = paths.mask_file.clone();
    config.banned_file = paths.banned_file.clone();
    config.banned_format = paths.banned_format;
    config.checkpoint_root = paths.checkpoint_root.clone();
}

fn apply_balancer(config: &mut Config, balancer: &BalancerArgs) {
    config.balancer_service = balancer.balancer_service.clone();
    config.balancer_binary = balancer.balancer_binary.clone();
    config.balancer_timeout = Duration::from_secs(balancer.balancer_timeout_secs);
}

impl RunArgs {
    fn config(&self) -> Result<Config> {
        let node = self.node.trim();
        if node.is_empty() {
            return Err(anyhow!("node name is empty (set --node or WORKER_NODE_NAME)"));
        }
        let mut config = Config::for_node(node);
        apply_paths(&mut config, &self.paths);
        apply_balancer(&mut config, &self.balancer);
        config.label_selector = self.label_selector.clone();
        config.kubectl = self.kubectl.clone();
        config.direct_refresh = !self.no_direct_refresh;
        config.watch_banned = self.watch_banned;
        config.events_from = self.events_from.clone();
        Ok(config)
    }
}

impl WatchArgs {
    fn config(&self) -> Config {
        let mut config = Config::for_node("");
        apply_paths(&mut config, &self.paths);
        apply_balancer(&mut config, &self.balancer);
        config
    }
}

impl CheckArgs {
    fn config(&self) -> Config {
        let mut config = Config::for_node("");
        apply_paths(&mut config, &self.paths);
        config.kubectl = self.kubectl.clone();
        config
    }
}

fn init_logging(log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init().context("failed to initialize logger")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref(), cli.verbose)?;

    match cli.cmd {
        Cmd::Run(args) => {
            let config = args.config()?;
            ctrlc::set_handler(move || {
                SHUTDOWN.store(true, Ordering::Relaxed);
            })?;
            run_daemon(config)
        }
        Cmd::WatchBanned(args) => {
            ctrlc::set_handler(move || {
                SHUTDOWN.store(true, Ordering::Relaxed);
            })?;
            cli::watch::run_watch(&args.config(), &SHUTDOWN)
        }
        Cmd::Check(args) => cli::check::run_check(&args.config()),
        Cmd::Mask(args) => cli::mask::run_mask(&args),
    }
}

fn banner(config: &Config) {
    println!("IRQSMP v{}", env!("CARGO_PKG_VERSION"));
    println!("NODE:            {}", config.node);
    println!("MASK FILE:       {}", config.mask_file.display());
    println!(
        "BANNED FILE:     {} ({})",
        config.banned_file.display(),
        config.banned_format.label()
    );
    println!("CHECKPOINT:      {}", config.checkpoint_file().display());
    match &config.events_from {
        Some(path) => println!("EVENTS:          {}", path.display()),
        None => println!("EVENTS:          {} (-l {})", config.kubectl, config.label_selector),
    }
    println!(
        "BALANCER:        service {} restart, fallback {} --oneshot (timeout {}s)",
        config.balancer_service,
        config.balancer_binary,
        config.balancer_timeout.as_secs()
    );
    println!("DIRECT REFRESH:  {}", config.direct_refresh);
    println!("WATCH BANNED:    {}", config.watch_banned);
    println!();
}

fn build_source(config: &Config) -> Box<dyn EventSource> {
    match &config.events_from {
        Some(path) => Box::new(ReaderSource::new(path)),
        None => Box::new(KubectlSource::new(
            &config.kubectl,
            &config.node,
            &config.label_selector,
        )),
    }
}

// SLEEP IN POLL STEPS SO CTRL+C IS NOT DELAYED BY A RESTART BACKOFF
fn sleep_unless_shutdown(total: Duration) {
    let mut slept = Duration::ZERO;
    while slept < total && !SHUTDOWN.load(Ordering::Relaxed) {
        thread::sleep(SHUTDOWN_POLL);
        slept += SHUTDOWN_POLL;
    }
}

fn run_daemon(config: Config) -> Result<()> {
    banner(&config);

    // STARTUP FAILURES ABORT BEFORE ANY THREAD STARTS
    let store = Store::open(&config.checkpoint_root)
        .context("cpu manager checkpoint directory is not usable")?;
    let balancer = Arc::new(Balancer::system(&config));
    let reconciler = Arc::new(Reconciler::new(&config, store, Some(balancer.clone())));
    reconciler
        .initialize()
        .context("failed to initialize banned cpus file")?;

    let watcher = if config.watch_banned {
        let w = BannedWatcher::new(&config.banned_file, config.banned_format, balancer);
        Some(w.spawn(&SHUTDOWN)?)
    } else {
        None
    };

    let mut source = build_source(&config);
    let stop = source.stop_handle();
    info!("event source: {}", source.describe());

    let (tx, rx) = mpsc::channel::<WorkloadEvent>();
    let source_running = Arc::new(AtomicBool::new(true));

    let running = source_running.clone();
    let source_thread = thread::Builder::new()
        .name("event-source".to_string())
        .spawn(move || {
            loop {
                match source.run(&tx) {
                    Ok(n) => info!("event source ended after {} events", n),
                    Err(e) => error!("event source failed: {:#}", e),
                }
                if SHUTDOWN.load(Ordering::Relaxed) || !source.restartable() {
                    break;
                }
                warn!("restarting event source in {:?}", SOURCE_RESTART_DELAY);
                sleep_unless_shutdown(SOURCE_RESTART_DELAY);
                if SHUTDOWN.load(Ordering::Relaxed) {
                    break;
                }
            }
            running.store(false, Ordering::Relaxed);
        })
        .context("failed to spawn event source thread")?;

    let consumer = thread::Builder::new()
        .name("reconcile".to_string())
        .spawn(move || loop {
            match rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(event) => match reconciler.handle_event(&event) {
                    Ok(Outcome::Applied(applied)) => debug!(
                        "pod {}: cpus {} enable={} mask {} banned {}",
                        event.name, applied.cpus, applied.enable, applied.update.mask, applied.update.banned
                    ),
                    Ok(Outcome::NoCpus) => debug!("pod {}: no exclusive cpus", event.name),
                    Ok(Outcome::Ignored(why)) => debug!("pod {}: ignored ({})", event.name, why),
                    Err(e) => error!("pod {} {}: {}", event.kind.label(), event.name, e),
                },
                Err(RecvTimeoutError::Timeout) => {
                    if SHUTDOWN.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .context("failed to spawn reconcile thread")?;

    println!("IRQSMP IS ACTIVE (CTRL+C TO EXIT)");

    while !SHUTDOWN.load(Ordering::Relaxed) && source_running.load(Ordering::Relaxed) {
        thread::sleep(SHUTDOWN_POLL);
    }

    println!("IRQSMP IS SHUTTING DOWN");
    SHUTDOWN.store(true, Ordering::Relaxed);
    stop.stop();

    let mut waited = Duration::ZERO;
    while source_running.load(Ordering::Relaxed) && waited < SHUTDOWN_GRACE {
        thread::sleep(SHUTDOWN_POLL);
        waited += SHUTDOWN_POLL;
    }
    if source_running.load(Ordering::Relaxed) {
        warn!("event source did not stop within {:?}", SHUTDOWN_GRACE);
    } else if source_thread.join().is_err() {
        error!("event source thread panicked");
    }

    consumer
        .join()
        .map_err(|_| anyhow!("reconcile thread panicked"))?;
    if let Some(handle) = watcher {
        handle
            .join()
            .map_err(|_| anyhow!("banned file watcher panicked"))?;
    }

    println!("IRQSMP OUT.");
    Ok(())
}
