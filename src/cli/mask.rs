// OFFLINE MASK CALCULATOR. SAME CODE PATH AS THE DAEMON, NO FILES WRITTEN.
//   irqsmp mask --current 00ffffff,ffffffff --cpus 1-2
//   irqsmp mask --mask-file /proc/irq/default_smp_affinity --cpus 1-2 --enable

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use irqsmp::mask;

#[derive(Args)]
pub struct MaskArgs {
    // CPU LIST, e.g. 1-2,5
    #[arg(long)]
    pub cpus: String,

    // CURRENT AFFINITY MASK TEXT
    #[arg(long, conflicts_with = "mask_file")]
    pub current: Option<String>,

    // READ THE CURRENT MASK FROM THIS FILE
    #[arg(long)]
    pub mask_file: Option<PathBuf>,

    // RELEASE THE CPUS INSTEAD OF RESERVING THEM
    #[arg(long)]
    pub enable: bool,
}

pub fn run_mask(args: &MaskArgs) -> Result<()> {
    let current = match (&args.current, &args.mask_file) {
        (Some(text), _) => text.trim().to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .trim()
            .to_string(),
        (None, None) => bail!("one of --current or --mask-file is required"),
    };

    let update = mask::update_affinity_mask(&args.cpus, &current, args.enable)?;
    let before = mask::mask_to_cpuset(&current)?;
    let after = mask::mask_to_cpuset(&update.mask)?;

    println!("CURRENT:         {} (cpus {})", current, before);
    println!("{:<17}{}", if args.enable { "ENABLE:" } else { "DISABLE:" }, args.cpus);
    println!("MASK:            {} (cpus {})", update.mask, after);
    println!("BANNED:          {}", update.banned);
    Ok(())
}
