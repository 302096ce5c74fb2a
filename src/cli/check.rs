use std::io;
use std::process::Command;

use anyhow::Result;

use irqsmp::banned;
use irqsmp::checkpoint::Store;
use irqsmp::config::Config;
use irqsmp::mask;

fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn check_mask_file(config: &Config) -> bool {
    let text = match std::fs::read_to_string(&config.mask_file) {
        Ok(t) => t,
        Err(e) => {
            println!("  {:<24}UNREADABLE ({})", "mask file", e);
            return false;
        }
    };
    match mask::mask_to_cpuset(text.trim()) {
        Ok(cpus) => {
            println!("  {:<24}OK ({} -> cpus {})", "mask file", text.trim(), cpus);
            true
        }
        Err(e) => {
            println!("  {:<24}INVALID ({})", "mask file", e);
            false
        }
    }
}

// A MISSING OR EMPTY BANNED FILE IS FINE: THE DAEMON CREATES IT
fn check_banned_file(config: &Config) -> bool {
    match banned::read_banned(&config.banned_file, config.banned_format) {
        Ok(Some(m)) => match mask::mask_to_cpuset(&m) {
            Ok(cpus) => {
                println!("  {:<24}OK ({} -> cpus {})", "banned file", m, cpus);
                true
            }
            Err(e) => {
                println!("  {:<24}INVALID ({})", "banned file", e);
                false
            }
        },
        Ok(None) => {
            println!("  {:<24}EMPTY (INITIALIZED AT STARTUP)", "banned file");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("  {:<24}MISSING (CREATED AT STARTUP)", "banned file");
            true
        }
        Err(e) => {
            println!("  {:<24}UNREADABLE ({})", "banned file", e);
            false
        }
    }
}

fn check_checkpoint(config: &Config) -> bool {
    let mut store = match Store::open(&config.checkpoint_root) {
        Ok(s) => s,
        Err(e) => {
            println!("  {:<24}NOT USABLE ({})", "checkpoint", e);
            return false;
        }
    };
    match store.refresh() {
        Ok(status) if status.is_static() => {
            println!(
                "  {:<24}OK ({} schema, policy {}, {} pods)",
                "checkpoint",
                status.schema.label(),
                status.policy,
                status.merged
            );
            true
        }
        Ok(status) => {
            println!(
                "  {:<24}POLICY {:?} (NO CPUS WILL BE RESERVED)",
                "checkpoint", status.policy
            );
            true
        }
        Err(e) => {
            println!("  {:<24}UNREADABLE ({})", "checkpoint", e);
            false
        }
    }
}

pub fn run_check(config: &Config) -> Result<()> {
    println!("IRQSMP HOST CHECK");
    println!();

    let mut ok = true;
    let tools = ["service", config.balancer_binary.as_str(), config.kubectl.as_str()];
    for tool in &tools {
        if check_tool(tool) {
            println!("  {:<24}OK", tool);
        } else {
            println!("  {:<24}MISSING", tool);
            ok = false;
        }
    }
    println!();

    if is_root() {
        println!("  {:<24}OK", "root");
    } else {
        println!("  {:<24}NOT ROOT (MASK WRITES WILL FAIL)", "root");
        ok = false;
    }
    println!();

    println!("FILES:");
    ok &= check_mask_file(config);
    ok &= check_banned_file(config);
    ok &= check_checkpoint(config);
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        if !check_tool(&config.balancer_binary) {
            println!("  Install irqbalance: apt install irqbalance");
        }
        std::process::exit(1);
    }

    Ok(())
}
