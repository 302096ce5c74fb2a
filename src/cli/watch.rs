use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};

use irqsmp::balancer::Balancer;
use irqsmp::config::{Config, SHUTDOWN_POLL};
use irqsmp::watch::BannedWatcher;

pub fn run_watch(config: &Config, shutdown: &'static AtomicBool) -> Result<()> {
    println!("IRQSMP BANNED FILE WATCH");
    println!(
        "BANNED FILE:     {} ({})",
        config.banned_file.display(),
        config.banned_format.label()
    );
    println!(
        "BALANCER:        service {} restart, fallback {} --oneshot",
        config.balancer_service, config.balancer_binary
    );
    println!();

    let balancer = Arc::new(Balancer::system(config));
    let handle = BannedWatcher::new(&config.banned_file, config.banned_format, balancer)
        .spawn(shutdown)?;

    println!("IRQSMP IS WATCHING (CTRL+C TO EXIT)");
    while !shutdown.load(Ordering::Relaxed) && !handle.is_finished() {
        thread::sleep(SHUTDOWN_POLL);
    }
    shutdown.store(true, Ordering::Relaxed);
    handle.join().map_err(|_| anyhow!("banned file watcher panicked"))?;

    println!("IRQSMP OUT.");
    Ok(())
}
