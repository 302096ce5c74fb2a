// IRQSMP MASK CODEC
// TRANSLATES BETWEEN THE KERNEL'S COMMA-GROUPED HEX AFFINITY MASK
// ("00ffffff,ffffffff") AND A PER-CPU BIT ARRAY.
//
// TEXT IS BIG-ENDIAN: MOST SIGNIFICANT 32-BIT GROUP FIRST. INTERNALLY THE
// DECODED BYTES ARE REVERSED SO THAT CPU i LIVES IN BYTE i/8, BIT i%8.
// DECODE ONLY PADS TO AN EVEN DIGIT COUNT. ENCODE PADS THE HIGH END WITH
// ZERO BYTES UP TO A MULTIPLE OF 8 BYTES (64 BITS). THE ASYMMETRY IS
// WHAT A NON-32-BIT-ALIGNED INPUT TURNS INTO ON WRITE-BACK.

use thiserror::Error;

use crate::cpuset::CpuSet;

// HEX DIGITS PER COMMA GROUP (32 BITS)
const GROUP_DIGITS: usize = 8;
// ENCODE ALIGNMENT IN BYTES
const ENCODE_ALIGN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaskError {
    #[error("malformed cpu set specification: {0:?}")]
    MalformedSpec(String),
    #[error("empty cpu set specification")]
    EmptySpec,
    #[error("non ascii character detected: {0:?}")]
    NonAscii(String),
    #[error("invalid hex digit {digit:?} in mask {mask:?}")]
    InvalidHex { mask: String, digit: char },
    #[error("empty affinity mask")]
    EmptyMask,
    #[error("cpu {cpu} outside of {width}-bit affinity mask")]
    CpuOutOfRange { cpu: usize, width: usize },
}

// RESULT OF ONE MASK UPDATE. BOTH TEXTS ARE ALWAYS PRODUCED TOGETHER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskUpdate {
    pub mask: String,
    pub banned: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityMask {
    // INDEX 0 HOLDS CPUS 0-7
    bytes: Vec<u8>,
}

impl AffinityMask {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    // PARSE MASK TEXT. COMMAS ARE STRIPPED, AN ODD DIGIT COUNT IS
    // LEFT-PADDED WITH ONE ZERO, THEN THE BYTE ORDER IS REVERSED.
    pub fn decode(text: &str) -> Result<Self, MaskError> {
        if !text.is_ascii() {
            return Err(MaskError::NonAscii(text.to_string()));
        }

        let mut digits: Vec<u8> = text.bytes().filter(|&b| b != b',').collect();
        if digits.is_empty() {
            return Err(MaskError::EmptyMask);
        }
        if digits.len() % 2 != 0 {
            digits.insert(0, b'0');
        }

        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let hi = nibble(pair[0]).ok_or_else(|| invalid_hex(text, pair[0]))?;
            let lo = nibble(pair[1]).ok_or_else(|| invalid_hex(text, pair[1]))?;
            bytes.push((hi << 4) | lo);
        }
        bytes.reverse();

        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    // NUMBER OF CPUS ADDRESSABLE BY THIS MASK
    pub fn width(&self) -> usize {
        self.bytes.len() * 8
    }

    // BITWISE COMPLEMENT OF EVERY BYTE, SAME LENGTH
    pub fn invert(&self) -> Self {
        Self {
            bytes: self.bytes.iter().map(|b| 0xff - b).collect(),
        }
    }

    pub fn is_set(&self, cpu: usize) -> bool {
        self.bytes
            .get(cpu / 8)
            .map_or(false, |b| b & cpu_bit(cpu) != 0)
    }

    pub fn set(&mut self, cpu: usize) -> Result<(), MaskError> {
        let width = self.width();
        let byte = self
            .bytes
            .get_mut(cpu / 8)
            .ok_or(MaskError::CpuOutOfRange { cpu, width })?;
        *byte |= cpu_bit(cpu);
        Ok(())
    }

    pub fn clear(&mut self, cpu: usize) -> Result<(), MaskError> {
        let width = self.width();
        let byte = self
            .bytes
            .get_mut(cpu / 8)
            .ok_or(MaskError::CpuOutOfRange { cpu, width })?;
        *byte &= !cpu_bit(cpu);
        Ok(())
    }

    pub fn cpus(&self) -> CpuSet {
        (0..self.width()).filter(|&cpu| self.is_set(cpu)).collect()
    }

    // ZERO-PAD TO 8 BYTES, REVERSE BACK, HEX ENCODE, COMMA EVERY 8 DIGITS
    pub fn encode(&self) -> String {
        let mut bytes = self.bytes.clone();
        let rem = bytes.len() % ENCODE_ALIGN;
        if rem != 0 {
            bytes.resize(bytes.len() + ENCODE_ALIGN - rem, 0);
        }
        bytes.reverse();

        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let mut out = String::with_capacity(hex.len() + hex.len() / GROUP_DIGITS);
        for (i, group) in hex.as_bytes().chunks(GROUP_DIGITS).enumerate() {
            if i > 0 {
                out.push(',');
            }
            // HEX OUTPUT IS ASCII
            out.extend(group.iter().map(|&b| b as char));
        }
        out
    }
}

// ENABLE: SET THE CPU IN THE AFFINITY MASK AND CLEAR IT IN THE BANNED MASK.
// DISABLE: THE OPPOSITE. THE CPU IS RESERVED AND KEPT FREE OF IRQS.
pub fn set_or_clear(
    mask: &mut AffinityMask,
    banned: &mut AffinityMask,
    cpu: usize,
    enable: bool,
) -> Result<(), MaskError> {
    if enable {
        mask.set(cpu)?;
        banned.clear(cpu)
    } else {
        mask.clear(cpu)?;
        banned.set(cpu)
    }
}

// COMPOSED OPERATION: PARSE THE CPU SET, DECODE THE CURRENT MASK, DERIVE
// THE BANNED MASK FROM IT, APPLY EVERY CPU, RE-ENCODE BOTH.
pub fn update_affinity_mask(
    cpus: &str,
    current: &str,
    enable: bool,
) -> Result<MaskUpdate, MaskError> {
    let cpuset = CpuSet::parse(cpus)?;

    let mut mask = AffinityMask::decode(current)?;
    let mut banned = mask.invert();

    for cpu in cpuset.iter() {
        set_or_clear(&mut mask, &mut banned, cpu, enable)?;
    }

    Ok(MaskUpdate {
        mask: mask.encode(),
        banned: banned.encode(),
    })
}

// INVERT A MASK STRING, KEEPING THE COMMA GROUPING
pub fn invert_mask_text(text: &str) -> Result<String, MaskError> {
    Ok(AffinityMask::decode(text)?.invert().encode())
}

pub fn mask_to_cpuset(text: &str) -> Result<CpuSet, MaskError> {
    Ok(AffinityMask::decode(text)?.cpus())
}

fn cpu_bit(cpu: usize) -> u8 {
    1 << (cpu % 8)
}

fn nibble(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

fn invalid_hex(mask: &str, digit: u8) -> MaskError {
    MaskError::InvalidHex {
        mask: mask.to_string(),
        digit: digit as char,
    }
}
