use clap::Parser;
use std::path::PathBuf;

use crate::detection::{DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES, DEFAULT_MODEL, DEFAULT_RETRY_DELAY_SECS};
use crate::geometry::{Point2D, ReferenceObjectSpec};

/// Corners typed on the command line
#[derive(Debug, Clone, PartialEq)]
pub struct CornerList(pub Vec<Point2D>);

#[derive(Parser, Debug)]
#[command(name = "floor-area")]
#[command(version, about = "Estimate floor area from a photo with a sheet of paper as scale reference")]
pub struct Cli {
    /// Input photo (JPEG or PNG)
    #[arg(required = true)]
    pub input: PathBuf,

    /// Paper corners in pixels, "x,y;x,y;x,y;x,y" (skips the vision model together with --floor)
    #[arg(long, value_parser = parse_corners, requires = "floor")]
    pub paper: Option<CornerList>,

    /// Floor corners in pixels, "x,y;x,y;x,y;x,y"
    #[arg(long, value_parser = parse_corners, requires = "paper")]
    pub floor: Option<CornerList>,

    /// Reference object: a4, a3, letter or WxH in meters
    #[arg(short, long, default_value = "a4", value_parser = parse_reference)]
    pub reference: ReferenceObjectSpec,

    /// Write the photo with paper and floor outlines to this path
    #[arg(long)]
    pub overlay: Option<PathBuf>,

    /// Write a top-down view of the floor to this path
    #[arg(long)]
    pub rectified: Option<PathBuf>,

    /// Resolution of the top-down view
    #[arg(long, default_value = "200")]
    pub pixels_per_meter: f64,

    /// Print the full measurement as JSON
    #[arg(long)]
    pub json: bool,

    /// Show detection and geometry details
    #[arg(short, long)]
    pub verbose: bool,

    /// API key for the vision model
    #[arg(long, env = "FLOOR_AREA_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "FLOOR_AREA_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Vision model name
    #[arg(long, env = "FLOOR_AREA_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Retry attempts for failed model requests
    #[arg(long, env = "FLOOR_AREA_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Delay between retries in seconds
    #[arg(long, env = "FLOOR_AREA_RETRY_DELAY", default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    pub retry_delay: u64,
}

impl Cli {
    /// Corners given on the command line, if both quads were supplied
    pub fn manual_corners(&self) -> Option<(&[Point2D], &[Point2D])> {
        match (&self.paper, &self.floor) {
            (Some(paper), Some(floor)) => Some((paper.0.as_slice(), floor.0.as_slice())),
            _ => None,
        }
    }

    /// Key from the flag or FLOOR_AREA_API_KEY, falling back to GEMINI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }
}

fn parse_corners(s: &str) -> Result<CornerList, String> {
    s.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (x, y) = part
                .split_once(',')
                .ok_or_else(|| format!("Invalid corner '{}', expected x,y", part.trim()))?;
            let x: f64 = x
                .trim()
                .parse()
                .map_err(|_| format!("Invalid x coordinate: {}", x.trim()))?;
            let y: f64 = y
                .trim()
                .parse()
                .map_err(|_| format!("Invalid y coordinate: {}", y.trim()))?;
            Ok(Point2D::new(x, y))
        })
        .collect::<Result<Vec<_>, String>>()
        .map(CornerList)
}

fn parse_reference(s: &str) -> Result<ReferenceObjectSpec, String> {
    s.parse().map_err(|e: crate::geometry::GeometryError| e.to_string())
}
