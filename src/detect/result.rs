/// Connected group of changed pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionRegion {
    /// Left edge of the bounding box.
    pub x: u32,
    /// Top edge of the bounding box.
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of changed pixels in the region.
    pub area: u64,
}

impl MotionRegion {
    /// Area of the bounding box (always >= `area`).
    pub fn bounding_area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

/// Result of analyzing one frame against the background.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MotionResult {
    /// Did the surviving regions reach the motion threshold?
    pub motion_detected: bool,
    /// Sum of surviving region areas.
    pub total_area: u64,
    /// Regions at or above the minimum area, largest first.
    pub regions: Vec<MotionRegion>,
    /// Pixels over the delta threshold before morphology and area filtering.
    pub changed_pixels: u64,
    /// `changed_pixels` as a fraction of the frame.
    pub changed_fraction: f32,
}

impl MotionResult {
    pub fn largest_region(&self) -> Option<&MotionRegion> {
        self.regions.first()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
