// IRQSMP CPU SET
// TEXTUAL CPU LISTS AS USED BY THE KUBELET CPU MANAGER: "0,3-4,29"
// SINGLE INDICES AND INCLUSIVE RANGES, COMMA SEPARATED.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::mask::MaskError;

// A 4096-BYTE MASK. NR_CPUS TOPS OUT WELL BELOW THIS. CHECKED BEFORE A
// RANGE IS EXPANDED SO A DAMAGED LIST CANNOT ALLOCATE WITHOUT BOUND.
pub const MAX_CPUS: usize = 32_768;

fn bounded(cpu: usize) -> Result<usize, MaskError> {
    if cpu >= MAX_CPUS {
        return Err(MaskError::CpuOutOfRange { cpu, width: MAX_CPUS });
    }
    Ok(cpu)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    // PARSE A CPU LIST. EMPTY INPUT IS REJECTED: A WORKLOAD WITH NO
    // DEDICATED CPUS NEVER REACHES THE MASK CODEC.
    pub fn parse(spec: &str) -> Result<Self, MaskError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(MaskError::EmptySpec);
        }

        let malformed = || MaskError::MalformedSpec(spec.to_string());
        let mut cpus = BTreeSet::new();

        for range in spec.split(',') {
            let parts: Vec<&str> = range.split('-').collect();
            match parts.len() {
                1 => {
                    let cpu = parts[0].parse::<usize>().map_err(|_| malformed())?;
                    cpus.insert(bounded(cpu)?);
                }
                2 => {
                    let lo = parts[0].parse::<usize>().map_err(|_| malformed())?;
                    let hi = parts[1].parse::<usize>().map_err(|_| malformed())?;
                    if lo > hi {
                        return Err(malformed());
                    }
                    cpus.extend(lo..=bounded(hi)?);
                }
                _ => return Err(malformed()),
            }
        }

        Ok(Self { cpus })
    }

    pub fn insert(&mut self, cpu: usize) {
        self.cpus.insert(cpu);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    // ASCENDING ORDER
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }
}

impl FromStr for CpuSet {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self { cpus: iter.into_iter().collect() }
    }
}

// CANONICAL FORM: CONSECUTIVE RUNS COLLAPSED INTO RANGES
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&(hi + 1)) {
                hi += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}-{}", lo, hi)?;
            }
        }
        Ok(())
    }
}
