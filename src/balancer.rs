// IRQSMP BALANCER REFRESH
// TELLS irqbalance ABOUT A NEW BANNED MASK. TWO STEPS:
//   1. service <name> restart          (GRACEFUL, PICKS UP THE NEW CONFIG)
//   2. <binary> --oneshot              (ONLY IF STEP 1 FAILED)
// BOTH RUN WITH IRQBALANCE_BANNED_CPUS=<mask> IN THE ENVIRONMENT.
//
// A FAILED REFRESH IS NEVER AN ERROR FOR THE CALLER: THE MASK FILES ARE
// ALREADY ON DISK AND THE BALANCER PICKS THEM UP ON ITS NEXT START.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;

use crate::banned::BANNED_CPUS_KEY;
use crate::config::Config;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with status {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exit { program: String, code: Option<i32> },
    #[error("{program} did not finish within {limit:?}, killed")]
    Timeout { program: String, limit: Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    // ADDED ON TOP OF THE INHERITED ENVIRONMENT
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn render(&self) -> String {
        let mut s = String::new();
        for (k, v) in &self.env {
            s.push_str(&format!("{}={} ", k, v));
        }
        s.push_str(&self.program);
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &CommandSpec) -> Result<(), RunError>;
}

// REAL PROCESS RUNNER. POLLS THE CHILD UNTIL IT EXITS OR THE DEADLINE
// PASSES, THEN KILLS IT.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<(), RunError> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(RunError::Exit {
                        program: cmd.program.clone(),
                        code: status.code(),
                    });
                }
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(source) => {
                    return Err(RunError::Spawn {
                        program: cmd.program.clone(),
                        source,
                    });
                }
            }
        }

        let _ = child.kill();
        let _ = child.wait();
        Err(RunError::Timeout {
            program: cmd.program.clone(),
            limit: self.timeout,
        })
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Restarted,
    OneShot { primary: RunError },
    Failed { primary: RunError, fallback: RunError },
}

impl RefreshOutcome {
    pub fn applied(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

pub struct Balancer {
    runner: Box<dyn CommandRunner>,
    service: String,
    binary: String,
    // LAST MASK THE BALANCER ACCEPTED. THE LOCK ALSO SERIALIZES RESTARTS.
    last: Mutex<Option<String>>,
}

impl Balancer {
    pub fn new(runner: Box<dyn CommandRunner>, service: &str, binary: &str) -> Self {
        Self {
            runner,
            service: service.to_string(),
            binary: binary.to_string(),
            last: Mutex::new(None),
        }
    }

    // REAL SUBPROCESSES, BOUNDED BY THE CONFIGURED TIMEOUT
    pub fn system(config: &Config) -> Self {
        Self::new(
            Box::new(SystemRunner::new(config.balancer_timeout)),
            &config.balancer_service,
            &config.balancer_binary,
        )
    }

    pub fn restart_command(&self, banned: &str) -> CommandSpec {
        CommandSpec {
            program: "service".to_string(),
            args: vec![self.service.clone(), "restart".to_string()],
            env: vec![(BANNED_CPUS_KEY.to_string(), banned.to_string())],
        }
    }

    pub fn oneshot_command(&self, banned: &str) -> CommandSpec {
        CommandSpec {
            program: self.binary.clone(),
            args: vec!["--oneshot".to_string()],
            env: vec![(BANNED_CPUS_KEY.to_string(), banned.to_string())],
        }
    }

    pub fn refresh(&self, banned: &str) -> RefreshOutcome {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let outcome = self.run_steps(banned);
        if outcome.applied() {
            *last = Some(banned.to_string());
        }
        outcome
    }

    // SKIP WHEN THE BALANCER ALREADY RUNS WITH THIS MASK. A SINGLE WRITE
    // OFTEN RAISES SEVERAL MODIFY EVENTS.
    pub fn refresh_if_changed(&self, banned: &str) -> Option<RefreshOutcome> {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if last.as_deref() == Some(banned) {
            return None;
        }
        let outcome = self.run_steps(banned);
        if outcome.applied() {
            *last = Some(banned.to_string());
        }
        Some(outcome)
    }

    fn run_steps(&self, banned: &str) -> RefreshOutcome {
        info!("restart irqbalance with banned cpus {}", banned);

        let primary = match self.runner.run(&self.restart_command(banned)) {
            Ok(()) => {
                info!("irqbalance service is restarted");
                return RefreshOutcome::Restarted;
            }
            Err(e) => e,
        };
        warn!("error restarting {} service: {}", self.service, primary);

        match self.runner.run(&self.oneshot_command(banned)) {
            Ok(()) => {
                info!("{} --oneshot applied banned cpus {}", self.binary, banned);
                RefreshOutcome::OneShot { primary }
            }
            Err(fallback) => {
                error!("irqbalance with banned cpus {} failed: {}; {}", banned, primary, fallback);
                RefreshOutcome::Failed { primary, fallback }
            }
        }
    }
}
