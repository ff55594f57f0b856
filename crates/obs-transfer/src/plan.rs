//! Part planning
//!
//! Splits an object of known size into numbered, contiguous parts. Plans are
//! deterministic so a checkpoint written by one run lines up with the plan
//! recomputed by the next.

use crate::types::ByteRange;
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Smallest part size accepted from callers (100 KiB)
pub const MIN_PART_SIZE: u64 = 100 * 1024;

/// Largest part size accepted from callers (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Default part size (9 MiB)
pub const DEFAULT_PART_SIZE: u64 = 9 * 1024 * 1024;

/// Service limit on the number of parts in one multipart upload
pub const MAX_PART_COUNT: u64 = 10_000;

/// Clamp a requested part size into `[MIN_PART_SIZE, MAX_PART_SIZE]`
pub fn clamp_part_size(part_size: u64) -> u64 {
    part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE)
}

/// Part size actually used for an object: the clamped request, raised if
/// needed so the object fits in `MAX_PART_COUNT` parts
pub fn effective_part_size(total_size: u64, requested: u64) -> u64 {
    let clamped = clamp_part_size(requested);
    let minimum_for_count = total_size.div_ceil(MAX_PART_COUNT);
    clamped.max(minimum_for_count).min(MAX_PART_SIZE)
}

/// One part of a transfer plan
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSpec {
    /// Part number, starting at 1
    pub part_number: u32,
    /// Byte offset in the object
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl PartSpec {
    /// Byte range covered by the part
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.length)
    }

    /// Offset one past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Ordered partition of `[0, total_size)` into parts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    total_size: u64,
    part_size: u64,
    parts: Vec<PartSpec>,
}

impl TransferPlan {
    /// Plan `total_size` bytes in parts of `part_size`.
    ///
    /// An empty object still gets one zero-length part so the object is
    /// created on the server.
    pub fn new(total_size: u64, part_size: u64) -> Result<Self> {
        if part_size == 0 {
            return Err(TransferError::InvalidArgument(
                "part size must be greater than zero".to_string(),
            ));
        }

        let count = total_size.div_ceil(part_size).max(1);
        if count > u64::from(u32::MAX) {
            return Err(TransferError::InvalidArgument(format!(
                "{} bytes in parts of {} would need {} parts",
                total_size, part_size, count
            )));
        }

        let mut parts = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        for index in 0..count {
            let length = part_size.min(total_size - offset);
            parts.push(PartSpec {
                part_number: (index + 1) as u32,
                offset,
                length,
            });
            offset += length;
        }

        Ok(Self {
            total_size,
            part_size,
            parts,
        })
    }

    /// Total object size
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Nominal part size
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// All parts, ascending by part number
    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Plans always hold at least one part
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Look up a part by number
    pub fn part(&self, part_number: u32) -> Option<&PartSpec> {
        part_number
            .checked_sub(1)
            .and_then(|i| self.parts.get(i as usize))
    }

    /// Parts not yet in `completed`, ascending
    pub fn pending_parts(&self, completed: &BTreeSet<u32>) -> Vec<PartSpec> {
        self.parts
            .iter()
            .filter(|p| !completed.contains(&p.part_number))
            .copied()
            .collect()
    }

    /// Hex BLAKE3 digest identifying this plan
    pub fn plan_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obs-transfer-plan-v1");
        hasher.update(&self.total_size.to_le_bytes());
        hasher.update(&self.part_size.to_le_bytes());
        for part in &self.parts {
            hasher.update(&part.part_number.to_le_bytes());
            hasher.update(&part.offset.to_le_bytes());
            hasher.update(&part.length.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
