use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use tracing_subscriber::EnvFilter;

use floor_area::{
    draw_overlay, measure_floor, rectify_floor, Cli, CornerDetector, DetectedCorners,
    DetectorConfig, VisionDetector,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so clap sees its variables
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "floor_area=debug,warn"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Load input image
    let img = ImageReader::open(&cli.input)
        .with_context(|| format!("Failed to open input file: {:?}", cli.input))?
        .with_guessed_format()
        .with_context(|| format!("Failed to read input file: {:?}", cli.input))?
        .decode()
        .with_context(|| format!("Failed to decode image: {:?}", cli.input))?;

    tracing::debug!(
        input = ?cli.input,
        width = img.width(),
        height = img.height(),
        reference_w = cli.reference.width_m(),
        reference_h = cli.reference.height_m(),
        "loaded photo"
    );

    let corners = match cli.manual_corners() {
        Some((paper, floor)) => DetectedCorners {
            paper_corners: paper.to_vec(),
            floor_corners: floor.to_vec(),
        },
        None => {
            let api_key = cli.resolved_api_key().context(
                "No API key: pass --api-key or set FLOOR_AREA_API_KEY / GEMINI_API_KEY \
                 (or give both --paper and --floor)",
            )?;
            let config = DetectorConfig::default()
                .with_base_url(&cli.base_url)
                .with_api_key(api_key)
                .with_model_name(&cli.model)
                .with_max_retries(cli.max_retries)
                .with_retry_delay(cli.retry_delay);
            let detector = VisionDetector::new(config)?;

            eprintln!("Locating paper and floor corners with {}...", cli.model);
            detector
                .detect(&img)
                .await
                .context("Failed to detect paper and floor corners")?
        }
    };

    tracing::debug!(
        paper = ?corners.paper_corners,
        floor = ?corners.floor_corners,
        "corners in pixel space"
    );

    let measurement = measure_floor(&corners.paper_corners, &corners.floor_corners, &cli.reference)
        .context("Failed to estimate floor area")?;

    if cli.verbose {
        let rows = measurement.homography.rows();
        tracing::debug!("Homography (pixels -> meters):");
        for row in rows {
            tracing::debug!("  [{:12.6e}, {:12.6e}, {:12.6e}]", row[0], row[1], row[2]);
        }
        for (pixel, metric) in measurement
            .floor_corners
            .points()
            .iter()
            .zip(measurement.floor_metric.iter())
        {
            tracing::debug!("floor corner {} px -> {} m", pixel, metric);
        }
    }

    let rgba = img.to_rgba8();

    if let Some(path) = &cli.overlay {
        save_image(draw_overlay(&rgba, &measurement), path)?;
        eprintln!("Saved overlay: {:?}", path);
    }

    if let Some(path) = &cli.rectified {
        let top_down = rectify_floor(&rgba, &measurement, cli.pixels_per_meter)
            .context("Failed to render rectified floor")?;
        save_image(top_down, path)?;
        eprintln!("Saved rectified floor: {:?}", path);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&measurement)?);
    } else {
        println!(
            "Floor area: {:.2} m² ({:.1} ft²)",
            measurement.area_m2,
            measurement.area_ft2()
        );
    }

    Ok(())
}

/// Save an RGBA buffer, dropping alpha for formats that cannot store it
fn save_image(img: RgbaImage, path: &Path) -> Result<()> {
    let dynamic = DynamicImage::ImageRgba8(img);
    let result = match ImageFormat::from_path(path) {
        Ok(ImageFormat::Jpeg) => DynamicImage::ImageRgb8(dynamic.to_rgb8()).save(path),
        _ => dynamic.save(path),
    };
    result.with_context(|| format!("Failed to save output: {:?}", path))
}
