//! Single-put vs multipart decision and part layout

use crate::config::EngineConfig;
use crate::error::{StorageError, StorageResult};
use crate::providers::MAX_PART_NUMBER;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    Single,
    Multipart { part_size: u64, parts: Vec<PartRange> },
}

/// Objects at or below the threshold go in one put; larger ones are split
/// into `part_size` parts with the remainder in the last part. The part
/// size grows (in whole MiB) when the object would need more than
/// `max_parts` parts.
pub fn plan_upload(total: u64, config: &EngineConfig) -> StorageResult<UploadPlan> {
    if total <= config.multipart_threshold {
        return Ok(UploadPlan::Single);
    }

    let max_parts = u64::from(config.max_parts.min(MAX_PART_NUMBER));
    let mut part_size = config.part_size.max(config.min_part_size);
    if part_size == 0 || max_parts == 0 {
        return Err(StorageError::Validation(
            "part size and part limit must be non-zero".to_string(),
        ));
    }
    if total.div_ceil(part_size) > max_parts {
        part_size = total.div_ceil(max_parts).div_ceil(MIB) * MIB;
    }

    let count = total.div_ceil(part_size);
    if count > max_parts {
        return Err(StorageError::Validation(format!(
            "{} bytes need {} parts, more than the limit of {}",
            total, count, max_parts
        )));
    }

    let parts = (0..count)
        .map(|index| {
            let offset = index * part_size;
            PartRange {
                number: index as u32 + 1,
                offset,
                len: part_size.min(total - offset),
            }
        })
        .collect();

    Ok(UploadPlan::Multipart { part_size, parts })
}
