//! Visibility regions
//!
//! Spans and lights carry a bit mask of the regions they belong to. A
//! [`VisRegionFilter`] supplied per frame admits or rejects both.

use serde::{Deserialize, Serialize};

/// Set of visibility regions, one bit per region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisRegionMask(pub u64);

impl VisRegionMask {
    /// Belongs to no region
    pub const NONE: Self = Self(0);

    /// Mask with a single region
    pub const fn region(index: u32) -> Self {
        Self(1 << index)
    }

    /// Union of two masks
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when the masks share a region
    pub const fn overlaps(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True when no region is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Inclusion and exclusion sets applied to a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisRegionFilter {
    /// When non-empty, only objects in one of these regions pass
    pub include: VisRegionMask,
    /// Objects in any of these regions are rejected
    pub exclude: VisRegionMask,
}

impl VisRegionFilter {
    /// Filter that admits everything
    pub const fn all() -> Self {
        Self { include: VisRegionMask::NONE, exclude: VisRegionMask::NONE }
    }

    /// Whether an object with `mask` passes. Objects in no region are only
    /// subject to the exclusion set.
    pub fn admits(&self, mask: VisRegionMask) -> bool {
        if mask.overlaps(self.exclude) {
            return false;
        }
        self.include.is_empty() || mask.is_empty() || mask.overlaps(self.include)
    }
}
