//! Copy planning: decides between a single server-side copy and a multipart
//! tiling of the object, under the platform's part-count and part-size limits.

use crate::clients::store::ByteRange;
use crate::runtime::config::{MAX_PARTS, PART_SIZE_MAX};
use crate::runtime::error::MirrorError;
use anyhow::{anyhow, bail, Result};

/// How one object will be copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyPlan {
    /// One server-side copy call.
    Single,
    /// Parallel range copies committed as a multipart upload.
    Multipart {
        part_size: u64,
        parts: Vec<PlannedPart>,
    },
}

/// One tile of a multipart plan. Numbers are 1-based as the store requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPart {
    pub number: i32,
    pub range: ByteRange,
}

impl CopyPlan {
    /// Selects a plan for an object of `size` bytes.
    pub fn select(key: &str, size: u64, part_size: u64, single_copy_ceiling: u64) -> Result<Self> {
        if size < single_copy_ceiling {
            return Ok(CopyPlan::Single);
        }
        Self::multipart(key, size, part_size)
    }

    /// Builds a multipart tiling of `[0, size)`.
    ///
    /// The preferred part size is doubled until the part count fits under
    /// [`MAX_PARTS`]; if the object cannot be tiled even with the largest
    /// permitted parts, the plan fails with [`MirrorError::ObjectTooLarge`].
    pub fn multipart(key: &str, size: u64, preferred_part_size: u64) -> Result<Self> {
        if size == 0 {
            bail!("multipart plan requires a nonzero object size");
        }

        let mut part_size = preferred_part_size.max(1);
        while part_count(size, part_size) > MAX_PARTS {
            part_size = part_size.saturating_mul(2);
            if part_size >= PART_SIZE_MAX {
                part_size = PART_SIZE_MAX;
                break;
            }
        }

        if part_count(size, part_size) > MAX_PARTS {
            return Err(anyhow!(MirrorError::ObjectTooLarge {
                key: key.to_owned(),
                size,
            }));
        }

        let mut parts = Vec::with_capacity(part_count(size, part_size) as usize);
        let mut offset = 0u64;
        let mut number = 1i32;
        while offset < size {
            let end = offset.saturating_add(part_size).min(size) - 1;
            parts.push(PlannedPart {
                number,
                range: ByteRange { start: offset, end },
            });
            offset = end + 1;
            number += 1;
        }

        Ok(CopyPlan::Multipart { part_size, parts })
    }
}

fn part_count(size: u64, part_size: u64) -> u64 {
    size.div_ceil(part_size)
}
