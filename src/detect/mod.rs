mod analyzer;
mod result;

pub use analyzer::MotionAnalyzer;
pub use result::{MotionRegion, MotionResult};
