use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, Matrix3, Vector3};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Square feet per square meter
pub const SQ_FT_PER_SQ_M: f64 = 10.7639;

/// Relative tolerance for the collinearity tests on reference and floor corners
const COLLINEAR_TOLERANCE: f64 = 1e-9;

/// Relative tolerance on the second-smallest singular value of the DLT system
const RANK_TOLERANCE: f64 = 1e-9;

/// Smallest |w| relative to |x| + |y| accepted before perspective division
const HORIZON_TOLERANCE: f64 = 1e-9;

/// Errors raised by the geometry core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Wrong corner count, non-finite coordinate or non-positive dimension
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Collinear or duplicate corners, or a transform that cannot be solved
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),
}

/// A point in pixel space (origin top-left, y down) or in metric space
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<[f64; 2]> for Point2D {
    fn from([x, y]: [f64; 2]) -> Self {
        Self::new(x, y)
    }
}

impl From<Point2D> for [f64; 2] {
    fn from(p: Point2D) -> Self {
        [p.x, p.y]
    }
}

impl From<(f64, f64)> for Point2D {
    fn from((x, y): (f64, f64)) -> Self {
        Self::new(x, y)
    }
}

impl fmt::Display for Point2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// Exactly four corners of a four-sided region.
///
/// After [`Quadrilateral::normalized`] the order is top-left, top-right,
/// bottom-right, bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quadrilateral([Point2D; 4]);

impl Quadrilateral {
    pub fn new(corners: [Point2D; 4]) -> Result<Self, GeometryError> {
        if let Some(p) = corners.iter().find(|p| !p.is_finite()) {
            return Err(GeometryError::InvalidInput(format!(
                "corner coordinates must be finite, got {p}"
            )));
        }
        Ok(Self(corners))
    }

    pub fn points(&self) -> &[Point2D; 4] {
        &self.0
    }

    pub fn top_left(&self) -> Point2D {
        self.0[0]
    }

    pub fn top_right(&self) -> Point2D {
        self.0[1]
    }

    pub fn bottom_right(&self) -> Point2D {
        self.0[2]
    }

    pub fn bottom_left(&self) -> Point2D {
        self.0[3]
    }

    /// Reorder corners by the sum/difference extrema convention.
    ///
    /// Min(x+y) is top-left, max(x+y) bottom-right, min(y-x) top-right and
    /// max(y-x) bottom-left. Ties resolve to the first index. When two roles
    /// land on the same corner (collinear or duplicate points) the result
    /// repeats that corner; the rectifier rejects such a quad later.
    pub fn normalized(&self) -> Self {
        let sums = self.0.map(|p| p.x + p.y);
        let diffs = self.0.map(|p| p.y - p.x);

        let tl = argmin(&sums);
        let br = argmax(&sums);
        let tr = argmin(&diffs);
        let bl = argmax(&diffs);

        Self([tl, tr, br, bl].map(|i| self.0[i]))
    }

    /// True when two corners are the same point, as `normalized` produces
    /// for collinear or duplicate input
    pub fn has_repeated_corner(&self) -> bool {
        (0..4).any(|i| (i + 1..4).any(|j| self.0[i] == self.0[j]))
    }
}

impl TryFrom<&[Point2D]> for Quadrilateral {
    type Error = GeometryError;

    fn try_from(points: &[Point2D]) -> Result<Self, Self::Error> {
        let corners: [Point2D; 4] = points.try_into().map_err(|_| {
            GeometryError::InvalidInput(format!(
                "a quadrilateral needs exactly 4 points, got {}",
                points.len()
            ))
        })?;
        Self::new(corners)
    }
}

impl TryFrom<Vec<Point2D>> for Quadrilateral {
    type Error = GeometryError;

    fn try_from(points: Vec<Point2D>) -> Result<Self, Self::Error> {
        Self::try_from(points.as_slice())
    }
}

fn argmin(values: &[f64; 4]) -> usize {
    let mut best = 0;
    for i in 1..values.len() {
        if values[i] < values[best] {
            best = i;
        }
    }
    best
}

fn argmax(values: &[f64; 4]) -> usize {
    let mut best = 0;
    for i in 1..values.len() {
        if values[i] > values[best] {
            best = i;
        }
    }
    best
}

/// Validate an arbitrary-order point list and return it in TL, TR, BR, BL order
pub fn normalize_corners(points: &[Point2D]) -> Result<Quadrilateral, GeometryError> {
    Ok(Quadrilateral::try_from(points)?.normalized())
}

/// Known real-world size of the calibration object, in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReferenceObjectSpec {
    width_m: f64,
    height_m: f64,
}

impl ReferenceObjectSpec {
    /// ISO 216 A4 sheet (210 mm x 297 mm)
    pub const A4: Self = Self {
        width_m: 0.210,
        height_m: 0.297,
    };

    /// ISO 216 A3 sheet (297 mm x 420 mm)
    pub const A3: Self = Self {
        width_m: 0.297,
        height_m: 0.420,
    };

    /// US Letter sheet (8.5 in x 11 in)
    pub const US_LETTER: Self = Self {
        width_m: 0.2159,
        height_m: 0.2794,
    };

    pub fn new(width_m: f64, height_m: f64) -> Result<Self, GeometryError> {
        for (name, value) in [("width", width_m), ("height", height_m)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(GeometryError::InvalidInput(format!(
                    "reference {name} must be a positive number of meters, got {value}"
                )));
            }
        }
        Ok(Self { width_m, height_m })
    }

    pub fn width_m(&self) -> f64 {
        self.width_m
    }

    pub fn height_m(&self) -> f64 {
        self.height_m
    }

    /// Destination corners of the reference in the metric frame, TL, TR, BR, BL
    fn metric_corners(&self) -> [Point2D; 4] {
        [
            Point2D::new(0.0, 0.0),
            Point2D::new(self.width_m, 0.0),
            Point2D::new(self.width_m, self.height_m),
            Point2D::new(0.0, self.height_m),
        ]
    }
}

impl Default for ReferenceObjectSpec {
    fn default() -> Self {
        Self::A4
    }
}

impl FromStr for ReferenceObjectSpec {
    type Err = GeometryError;

    /// Accepts `a4`, `a3`, `letter` or `WxH` in meters (e.g. `0.2x0.3`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a4" => Ok(Self::A4),
            "a3" => Ok(Self::A3),
            "letter" | "us-letter" => Ok(Self::US_LETTER),
            other => {
                let (w, h) = other.split_once('x').ok_or_else(|| {
                    GeometryError::InvalidInput(format!(
                        "unknown reference '{s}', expected a4, a3, letter or WxH in meters"
                    ))
                })?;
                let parse = |v: &str| {
                    v.trim().parse::<f64>().map_err(|_| {
                        GeometryError::InvalidInput(format!("invalid reference dimension '{v}'"))
                    })
                };
                Self::new(parse(w)?, parse(h)?)
            }
        }
    }
}

/// Planar projective transform from pixel space to the metric frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(Matrix3<f64>);

impl Homography {
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self(matrix)
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    pub fn rows(&self) -> [[f64; 3]; 3] {
        std::array::from_fn(|r| std::array::from_fn(|c| self.0[(r, c)]))
    }

    /// Transform a point: multiply by H, then divide by the homogeneous w
    pub fn apply(&self, p: Point2D) -> Result<Point2D, GeometryError> {
        let v = self.0 * Vector3::new(p.x, p.y, 1.0);
        if v.z.abs() <= HORIZON_TOLERANCE * (v.x.abs() + v.y.abs()) {
            return Err(GeometryError::DegenerateGeometry(format!(
                "point {p} maps to the line at infinity"
            )));
        }
        let out = Point2D::new(v.x / v.z, v.y / v.z);
        if !out.is_finite() {
            return Err(GeometryError::DegenerateGeometry(format!(
                "point {p} has no finite image under the homography"
            )));
        }
        Ok(out)
    }

    /// The inverse transform (metric frame back to pixels)
    pub fn inverse(&self) -> Result<Self, GeometryError> {
        self.0.try_inverse().map(Self).ok_or_else(|| {
            GeometryError::DegenerateGeometry("homography is not invertible".to_string())
        })
    }
}

impl Serialize for Homography {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.rows().serialize(serializer)
    }
}

/// Map normalized reference corners onto an axis-aligned metric rectangle.
///
/// TL, TR, BR, BL go to (0,0), (w,0), (w,h), (0,h). The transform is the
/// normalized DLT solution of the four correspondences.
pub fn compute_homography(
    reference_corners: &Quadrilateral,
    width_m: f64,
    height_m: f64,
) -> Result<Homography, GeometryError> {
    let reference = ReferenceObjectSpec::new(width_m, height_m)?;
    ensure_no_collinear_triple(reference_corners.points())?;

    let dst = reference.metric_corners();
    let h = solve_dlt(reference_corners.points(), &dst)?;

    let residual = reference_corners
        .points()
        .iter()
        .zip(dst.iter())
        .map(|(src, dst)| {
            h.apply(*src)
                .map(|p| ((p.x - dst.x).powi(2) + (p.y - dst.y).powi(2)).sqrt())
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .fold(0.0, f64::max);
    tracing::debug!(residual_m = residual, "solved reference homography");

    Ok(h)
}

/// Reject corner sets where any three points are (nearly) collinear
fn ensure_no_collinear_triple(points: &[Point2D; 4]) -> Result<(), GeometryError> {
    let extent = extent(points);
    if extent <= 0.0 {
        return Err(GeometryError::DegenerateGeometry(
            "all reference corners coincide".to_string(),
        ));
    }
    let tolerance = COLLINEAR_TOLERANCE * extent * extent;

    for skip in 0..4 {
        let [a, b, c]: [usize; 3] = match skip {
            0 => [1, 2, 3],
            1 => [0, 2, 3],
            2 => [0, 1, 3],
            _ => [0, 1, 2],
        };
        let (pa, pb, pc) = (points[a], points[b], points[c]);
        let cross = (pb.x - pa.x) * (pc.y - pa.y) - (pb.y - pa.y) * (pc.x - pa.x);
        if cross.abs() <= tolerance {
            return Err(GeometryError::DegenerateGeometry(format!(
                "reference corners {pa}, {pb} and {pc} are collinear"
            )));
        }
    }
    Ok(())
}

/// The floor must enclose some area in pixels; the homography preserves
/// collinearity, so a flat pixel quad is flat in meters too
fn ensure_floor_encloses_area(floor: &Quadrilateral) -> Result<(), GeometryError> {
    let extent = extent(floor.points());
    if extent <= 0.0 {
        return Err(GeometryError::DegenerateGeometry(
            "all floor corners coincide".to_string(),
        ));
    }
    if polygon_area(floor.points()) <= COLLINEAR_TOLERANCE * extent * extent {
        return Err(GeometryError::DegenerateGeometry(
            "floor corners are collinear and enclose no area".to_string(),
        ));
    }
    Ok(())
}

/// Larger side of the axis-aligned bounding box
fn extent(points: &[Point2D; 4]) -> f64 {
    let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    (max_x - min_x).max(max_y - min_y)
}

/// Conditioning transform: centroid to origin, mean distance sqrt(2)
fn conditioning(points: &[Point2D; 4]) -> Result<Matrix3<f64>, GeometryError> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    if mean_dist <= f64::EPSILON {
        return Err(GeometryError::DegenerateGeometry(
            "points have no spatial extent".to_string(),
        ));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;

    #[rustfmt::skip]
    let t = Matrix3::new(
        s, 0.0, -s * cx,
        0.0, s, -s * cy,
        0.0, 0.0, 1.0,
    );
    Ok(t)
}

/// Solve `dst ~ H src` for four correspondences via SVD of the DLT system
fn solve_dlt(src: &[Point2D; 4], dst: &[Point2D; 4]) -> Result<Homography, GeometryError> {
    let t_src = conditioning(src)?;
    let t_dst = conditioning(dst)?;
    let condition = |t: &Matrix3<f64>, p: &Point2D| {
        let v = t * Vector3::new(p.x, p.y, 1.0);
        (v.x, v.y)
    };

    // 8 equations padded with a zero row so the SVD yields the full 9x9 V
    let mut a = DMatrix::<f64>::zeros(9, 9);
    for (i, (ps, pd)) in src.iter().zip(dst.iter()).enumerate() {
        let (x, y) = condition(&t_src, ps);
        let (u, v) = condition(&t_dst, pd);
        let (r0, r1) = (2 * i, 2 * i + 1);

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| {
        GeometryError::DegenerateGeometry("SVD of the DLT system failed".to_string())
    })?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let largest = svd.singular_values[order[order.len() - 1]];
    let second_smallest = svd.singular_values[order[1]];

    // A unique solution leaves exactly one null direction
    if second_smallest <= RANK_TOLERANCE * largest {
        return Err(GeometryError::DegenerateGeometry(
            "reference corners do not determine a unique homography".to_string(),
        ));
    }

    let h_vec = v_t.row(order[0]);
    let mut h = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h[(r, c)] = h_vec[3 * r + c];
        }
    }

    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        GeometryError::DegenerateGeometry("conditioning transform not invertible".to_string())
    })?;
    let mut h = t_dst_inv * h * t_src;

    let scale = h[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h /= scale;
    }

    if h.iter().any(|v| !v.is_finite()) {
        return Err(GeometryError::DegenerateGeometry(
            "homography has non-finite entries".to_string(),
        ));
    }

    Ok(Homography(h))
}

/// Shoelace area of a closed polygon (absolute value)
pub fn polygon_area(points: &[Point2D]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    for i in 0..n {
        let j = (i + 1) % n;
        twice_area += points[i].x * points[j].y;
        twice_area -= points[j].x * points[i].y;
    }
    (twice_area / 2.0).abs()
}

/// Full result of one floor estimation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FloorMeasurement {
    /// Estimated floor area in square meters
    pub area_m2: f64,
    /// Reference object the scale was taken from
    pub reference: ReferenceObjectSpec,
    /// Normalized paper corners in pixels
    pub paper_corners: Quadrilateral,
    /// Normalized floor corners in pixels
    pub floor_corners: Quadrilateral,
    /// Floor corners in the metric frame, meters
    pub floor_metric: [Point2D; 4],
    /// Pixel to metric transform
    pub homography: Homography,
}

impl FloorMeasurement {
    pub fn area_ft2(&self) -> f64 {
        self.area_m2 * SQ_FT_PER_SQ_M
    }
}

/// Normalize both quads, rectify against the reference and measure the floor
pub fn measure_floor(
    paper_corners: &[Point2D],
    floor_corners: &[Point2D],
    reference: &ReferenceObjectSpec,
) -> Result<FloorMeasurement, GeometryError> {
    let paper = normalize_corners(paper_corners)?;
    let floor = normalize_corners(floor_corners)?;
    if floor.has_repeated_corner() {
        tracing::warn!(
            corners = ?floor_corners,
            "floor corner ordering is ambiguous; extrema do not pick four distinct corners"
        );
    }
    ensure_floor_encloses_area(&floor)?;

    let homography = compute_homography(&paper, reference.width_m(), reference.height_m())?;

    let mut floor_metric = [Point2D::default(); 4];
    for (metric, pixel) in floor_metric.iter_mut().zip(floor.points()) {
        *metric = homography.apply(*pixel)?;
    }

    let area_m2 = polygon_area(&floor_metric);
    tracing::debug!(area_m2, "estimated floor area");

    Ok(FloorMeasurement {
        area_m2,
        reference: *reference,
        paper_corners: paper,
        floor_corners: floor,
        floor_metric,
        homography,
    })
}

/// Floor area in square meters
pub fn estimate_area(
    paper_corners: &[Point2D],
    floor_corners: &[Point2D],
    reference: &ReferenceObjectSpec,
) -> Result<f64, GeometryError> {
    measure_floor(paper_corners, floor_corners, reference).map(|m| m.area_m2)
}
