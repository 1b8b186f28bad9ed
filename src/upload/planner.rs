//! Part planner
//!
//! Splits an object into contiguous, uniformly sized parts. Every part has
//! the chosen part size except the last, which takes the remainder.

use super::UploadError;
use serde::Serialize;

/// Minimum part size (5MB) - S3 requirement for every part but the last
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum part size (5GB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum parts allowed
pub const MAX_PARTS: u32 = 10000;

/// One part of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartSpec {
    /// 1-based position in the plan
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartSpec {
    /// Offset one past the last byte of the part
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Immutable split of one object into parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPlan {
    object_size: u64,
    part_size: u64,
    parts: Vec<PartSpec>,
}

impl UploadPlan {
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Size of every part except possibly the last
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn is_single_part(&self) -> bool {
        self.parts.len() == 1
    }

    /// Look up a part by its number
    pub fn part(&self, part_number: u32) -> Option<&PartSpec> {
        let index = usize::try_from(part_number).ok()?.checked_sub(1)?;
        self.parts.get(index)
    }
}

/// Part size limits enforced by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u32,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            max_parts: MAX_PARTS,
        }
    }
}

/// Computes upload plans under a set of limits
#[derive(Debug, Clone, Copy, Default)]
pub struct PartPlanner {
    limits: PlannerLimits,
}

impl PartPlanner {
    pub fn new(limits: PlannerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> PlannerLimits {
        self.limits
    }

    /// Plan an upload of `object_size` bytes.
    ///
    /// The part size is the configured size (raised to the minimum part
    /// size) or the smallest size that keeps the part count within
    /// `max_parts`, whichever is larger. `max_parts` is additionally capped
    /// by the planner's own limit.
    ///
    /// The last part takes the remainder and may be smaller than
    /// `min_part_size` (12 MiB in 5 MiB parts ends with a 2 MiB part). The
    /// service only enforces the minimum on parts that are not last.
    pub fn plan(
        &self,
        object_size: u64,
        configured_part_size: u64,
        configured_max_parts: u32,
    ) -> Result<UploadPlan, UploadError> {
        if object_size == 0 {
            return Err(UploadError::PlanningError(
                "object size must be greater than zero".into(),
            ));
        }
        if configured_max_parts == 0 {
            return Err(UploadError::PlanningError(
                "max parts must be greater than zero".into(),
            ));
        }

        let max_parts = u64::from(configured_max_parts.min(self.limits.max_parts));
        let required = object_size.div_ceil(max_parts);
        if required > self.limits.max_part_size {
            return Err(UploadError::PlanningError(format!(
                "object of {} bytes needs parts of {} bytes to fit in {} parts, above the {} byte limit",
                object_size, required, max_parts, self.limits.max_part_size
            )));
        }

        let part_size = configured_part_size
            .max(self.limits.min_part_size)
            .min(self.limits.max_part_size)
            .max(required)
            .max(1);

        if object_size <= part_size {
            return Ok(UploadPlan {
                object_size,
                part_size: object_size,
                parts: vec![PartSpec {
                    part_number: 1,
                    offset: 0,
                    length: object_size,
                }],
            });
        }

        let count = object_size.div_ceil(part_size);
        let mut parts = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
        let mut offset = 0;
        let mut part_number = 1u32;
        while offset < object_size {
            let length = part_size.min(object_size - offset);
            parts.push(PartSpec {
                part_number,
                offset,
                length,
            });
            offset += length;
            part_number += 1;
        }

        tracing::debug!(
            object_size = object_size,
            part_size = part_size,
            parts = parts.len(),
            "Planned multipart upload"
        );

        Ok(UploadPlan {
            object_size,
            part_size,
            parts,
        })
    }
}

/// Plan with the default service limits
pub fn plan(
    object_size: u64,
    configured_part_size: u64,
    configured_max_parts: u32,
) -> Result<UploadPlan, UploadError> {
    PartPlanner::default().plan(object_size, configured_part_size, configured_max_parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn assert_plan_invariants(plan: &UploadPlan, object_size: u64) {
        let parts = plan.parts();
        assert!(!parts.is_empty());
        assert_eq!(parts.iter().map(|p| p.length).sum::<u64>(), object_size);

        let mut expected_offset = 0;
        for (index, part) in parts.iter().enumerate() {
            assert_eq!(part.part_number as usize, index + 1);
            assert_eq!(part.offset, expected_offset);
            assert!(part.length > 0);
            if index + 1 < parts.len() {
                assert_eq!(part.length, plan.part_size());
            } else {
                assert!(part.length <= plan.part_size());
            }
            expected_offset = part.end();
        }
    }

    #[test]
    fn test_fifty_megabytes_in_twenty_megabyte_parts() {
        let plan = plan(50_000_000, 20_000_000, MAX_PARTS).unwrap();
        let lengths: Vec<u64> = plan.parts().iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![20_000_000, 20_000_000, 10_000_000]);
        assert_eq!(plan.part(3).unwrap().offset, 40_000_000);
    }

    #[test]
    fn test_exact_multiple_has_no_short_part() {
        let plan = plan(60_000_000, 20_000_000, MAX_PARTS).unwrap();
        assert_eq!(plan.part_count(), 3);
        assert!(plan.parts().iter().all(|p| p.length == 20_000_000));
    }

    #[test]
    fn test_small_object_is_single_part() {
        let plan = plan(1024, 20_000_000, MAX_PARTS).unwrap();
        assert!(plan.is_single_part());
        assert_eq!(plan.parts()[0].length, 1024);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            plan(0, MIN_PART_SIZE, MAX_PARTS),
            Err(UploadError::PlanningError(_))
        ));
    }

    #[test]
    fn test_part_size_raised_to_minimum() {
        let plan = plan(12 * 1024 * 1024, 1024, MAX_PARTS).unwrap();
        assert_eq!(plan.part_size(), MIN_PART_SIZE);
        assert_eq!(plan.part_count(), 3);
    }

    #[test]
    fn test_last_part_may_be_below_minimum() {
        let plan = plan(12 * 1024 * 1024, MIN_PART_SIZE, MAX_PARTS).unwrap();
        let lengths: Vec<u64> = plan.parts().iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![MIN_PART_SIZE, MIN_PART_SIZE, 2 * 1024 * 1024]);
    }

    #[test]
    fn test_part_size_grows_to_respect_max_parts() {
        let object_size = 100 * MIN_PART_SIZE;
        let plan = plan(object_size, MIN_PART_SIZE, 10).unwrap();
        assert_eq!(plan.part_count(), 10);
        assert_eq!(plan.part_size(), 10 * MIN_PART_SIZE);
    }

    #[test]
    fn test_object_too_large() {
        let result = plan(MAX_PART_SIZE * 3 + 1, MIN_PART_SIZE, 3);
        assert!(matches!(result, Err(UploadError::PlanningError(_))));
    }

    #[test]
    fn test_custom_limits() {
        let planner = PartPlanner::new(PlannerLimits {
            min_part_size: 1,
            max_part_size: 1024,
            max_parts: 4,
        });
        let plan = planner.plan(10, 3, 100).unwrap();
        let lengths: Vec<u64> = plan.parts().iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![3, 3, 3, 1]);

        // max_parts of the planner caps the configured one
        let plan = planner.plan(100, 3, 100).unwrap();
        assert_eq!(plan.part_count(), 4);
        assert_eq!(plan.part_size(), 25);
    }

    #[test]
    fn test_part_lookup_out_of_range() {
        let plan = plan(50_000_000, 20_000_000, MAX_PARTS).unwrap();
        assert!(plan.part(0).is_none());
        assert!(plan.part(4).is_none());
    }

    #[test]
    fn test_random_sizes_satisfy_invariants() {
        let planner = PartPlanner::new(PlannerLimits {
            min_part_size: 1,
            max_part_size: u64::MAX,
            max_parts: 10_000,
        });
        let mut rng = rand::rng();

        for _ in 0..500 {
            let object_size = rng.random_range(1..5_000_000u64);
            let part_size = rng.random_range(1..1_000_000u64);
            let max_parts = rng.random_range(1..=10_000u32);

            let plan = planner.plan(object_size, part_size, max_parts).unwrap();
            assert!(plan.part_count() as u64 <= u64::from(max_parts));
            assert!(plan.part_size() >= part_size.min(object_size));
            assert_plan_invariants(&plan, object_size);
        }
    }
}
