// IRQSMP BANNED CPUS FILE
// THE BALANCER LEARNS WHICH CPUS TO LEAVE ALONE FROM THIS FILE. TWO LAYOUTS:
//   BARE:  THE BANNED MASK TEXT AND NOTHING ELSE
//   SHELL: A SYSCONFIG FILE WHERE ONLY THE IRQBALANCE_BANNED_CPUS="..." LINE
//          IS OURS. EVERY OTHER LINE IS PRESERVED VERBATIM.
//
// THE FILE IS REWRITTEN IN PLACE (NO RENAME): A WATCHER HOLDS AN INOTIFY
// WATCH ON THIS INODE.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

pub const BANNED_CPUS_KEY: &str = "IRQBALANCE_BANNED_CPUS";

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum BannedFormat {
    Bare,
    Shell,
}

impl BannedFormat {
    pub fn label(self) -> &'static str {
        match self {
            Self::Bare => "bare",
            Self::Shell => "shell",
        }
    }
}

// ACTIVE (UNCOMMENTED) ASSIGNMENT OF THE KEY, VALUE OPTIONALLY QUOTED
fn key_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*(?:export\s+)?IRQBALANCE_BANNED_CPUS=(?:"([^"]*)"|'([^']*)'|(\S*))\s*$"#)
            .expect("static regex")
    })
}

pub fn config_line(banned: &str) -> String {
    format!("{}=\"{}\"", BANNED_CPUS_KEY, banned)
}

// REPLACE EVERY ACTIVE KEY LINE, OR APPEND ONE IF NONE EXISTS
pub fn upsert(existing: &str, banned: &str) -> String {
    let line = config_line(banned);
    let mut found = false;
    let mut lines: Vec<&str> = Vec::new();
    for l in existing.split('\n') {
        if key_line().is_match(l) {
            found = true;
            lines.push(&line);
        } else {
            lines.push(l);
        }
    }

    let mut out = lines.join("\n");
    if !found {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

// LAST ACTIVE KEY LINE WINS, AS IN A SHELL
pub fn extract(content: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|l| key_line().captures(l))
        .last()
        .and_then(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .map(|m| m.as_str().to_string())
}

pub fn render(format: BannedFormat, existing: Option<&str>, banned: &str) -> String {
    match format {
        BannedFormat::Bare => banned.to_string(),
        BannedFormat::Shell => upsert(existing.unwrap_or(""), banned),
    }
}

pub fn write_banned(path: &Path, format: BannedFormat, banned: &str) -> io::Result<()> {
    let existing = match format {
        BannedFormat::Bare => None,
        BannedFormat::Shell => match fs::read_to_string(path) {
            Ok(s) => Some(s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        },
    };
    let content = render(format, existing.as_deref(), banned);

    // TRUNCATE + WRITE ON THE SAME INODE
    let mut file = fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.flush()
}

// CURRENT BANNED MASK, OR None IF THE FILE HOLDS NO MASK YET
pub fn read_banned(path: &Path, format: BannedFormat) -> io::Result<Option<String>> {
    let content = fs::read_to_string(path)?;
    let mask = match format {
        BannedFormat::Bare => Some(content.trim().to_string()),
        BannedFormat::Shell => extract(&content),
    };
    Ok(mask.filter(|m| !m.is_empty()))
}
