pub mod cli;
pub mod detection;
pub mod geometry;
pub mod transform;

pub use cli::Cli;
pub use detection::{
    parse_corner_response, CornerDetector, DetectedCorners, DetectionError, DetectorConfig,
    VisionDetector,
};
pub use geometry::{
    compute_homography, estimate_area, measure_floor, normalize_corners, polygon_area,
    FloorMeasurement, GeometryError, Homography, Point2D, Quadrilateral, ReferenceObjectSpec,
};
pub use transform::{draw_overlay, rectify_floor};
