//! Corner detection through a multimodal model.
//!
//! The geometry core never talks to the network. Anything that can turn a
//! photo into paper and floor corners implements [`CornerDetector`];
//! [`VisionDetector`] does so with an OpenAI-compatible chat completions API.

use std::borrow::Cow;
use std::io::Cursor;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

use crate::geometry::Point2D;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Gemini's OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Instruction sent alongside the photo.
pub const CORNER_PROMPT: &str = r#"Look at this image. There is a standard A4 paper (210mm x 297mm) on the floor.
1. Identify the 4 corners of the A4 paper.
2. Identify the 4 visible corners of the floor/room area.

Coordinates are pixels in the image as sent, origin at the top-left, y pointing down.
Return ONLY a JSON object with this format, no other text:
{
    "paper_corners": [[x1, y1], [x2, y2], [x3, y3], [x4, y4]],
    "floor_corners": [[x1, y1], [x2, y2], [x3, y3], [x4, y4]]
}"#;

/// Corner detection errors.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("no API key configured for the vision model")]
    MissingApiKey,
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse corner response: {0}")]
    Parse(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

impl DetectionError {
    /// Network failures, rate limits and server errors are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            DetectionError::Request(_) => true,
            DetectionError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Raw corners as reported by a detector, pixel coordinates of the source image.
///
/// Counts are not checked here; the geometry core rejects anything but four.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedCorners {
    pub paper_corners: Vec<Point2D>,
    pub floor_corners: Vec<Point2D>,
}

impl DetectedCorners {
    /// Map coordinates from a resized upload back to the original image.
    pub fn rescaled(self, scale_x: f64, scale_y: f64) -> Self {
        let rescale = |pts: Vec<Point2D>| -> Vec<Point2D> {
            pts.into_iter()
                .map(|p| Point2D::new(p.x * scale_x, p.y * scale_y))
                .collect()
        };
        Self {
            paper_corners: rescale(self.paper_corners),
            floor_corners: rescale(self.floor_corners),
        }
    }
}

/// Anything that can locate the reference sheet and the floor in a photo.
#[allow(async_fn_in_trait)]
pub trait CornerDetector {
    async fn detect(&self, image: &DynamicImage) -> Result<DetectedCorners, DetectionError>;
}

/// Configuration for the vision model.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    /// Photos with a longer side are downscaled before upload (0 disables).
    pub max_image_side: u32,
    pub timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model_name: DEFAULT_MODEL.to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            max_image_side: 1600,
            timeout_secs: 60,
        }
    }
}

impl DetectorConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    pub fn with_max_image_side(mut self, max_image_side: u32) -> Self {
        self.max_image_side = max_image_side;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

/// Photo payload ready for upload plus the factors mapping it back.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub base64_jpeg: String,
    pub scale_x: f64,
    pub scale_y: f64,
}

/// JPEG-encode a photo, downscaling so its longer side is at most `max_side`.
pub fn encode_image(image: &DynamicImage, max_side: u32) -> Result<EncodedImage, DetectionError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(DetectionError::Encode("image has no pixels".to_string()));
    }

    let upload = if max_side > 0 && width.max(height) > max_side {
        Cow::Owned(image.resize(max_side, max_side, FilterType::Triangle))
    } else {
        Cow::Borrowed(image)
    };

    let scale_x = width as f64 / upload.width() as f64;
    let scale_y = height as f64 / upload.height() as f64;

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(upload.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Jpeg)
        .map_err(|e| DetectionError::Encode(e.to_string()))?;

    Ok(EncodedImage {
        base64_jpeg: STANDARD.encode(buffer.into_inner()),
        scale_x,
        scale_y,
    })
}

/// Pull the corner JSON out of a model reply.
///
/// Models like to wrap JSON in a markdown code fence or add prose around it, so
/// the object between the first `{` and the last `}` is what gets parsed.
pub fn parse_corner_response(content: &str) -> Result<DetectedCorners, DetectionError> {
    let mut text = content.trim();
    if let Some((_, rest)) = text.split_once("```json") {
        text = rest.split("```").next().unwrap_or(rest);
    } else if let Some((_, rest)) = text.split_once("```") {
        text = rest.split("```").next().unwrap_or(rest);
    }

    let start = text.find('{');
    let end = text.rfind('}');
    let json_text = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(DetectionError::Parse(format!(
                "no JSON object in model reply: {:?}",
                truncate(content, 200)
            )))
        }
    };

    serde_json::from_str(json_text).map_err(|e| DetectionError::Parse(e.to_string()))
}

fn truncate(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => Cow::Owned(format!("{}...", &s[..idx])),
        None => Cow::Borrowed(s),
    }
}

/// Corner detector backed by an OpenAI-compatible vision-language model.
pub struct VisionDetector {
    config: DetectorConfig,
    client: Client,
}

impl VisionDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, DetectionError> {
        if config.api_key.trim().is_empty() {
            return Err(DetectionError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn request_body(&self, image_base64: &str) -> Value {
        json!({
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": CORNER_PROMPT },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:image/jpeg;base64,{}", image_base64)
                            }
                        }
                    ]
                }
            ]
        })
    }

    /// Send the request, retrying transient failures.
    async fn request(&self, body: &Value) -> Result<String, DetectionError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let max_attempts = self.config.max_retries + 1;
        let mut last_error: Option<DetectionError> = None;

        for attempt in 1..=max_attempts {
            match self.send_request(&url, body).await {
                Ok(content) => return Ok(content),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            error = %e,
                            "vision request failed, retrying in {}s",
                            self.config.retry_delay_secs
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(DetectionError::MaxRetriesExceeded(
            max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    async fn send_request(&self, url: &str, body: &Value) -> Result<String, DetectionError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DetectionError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| DetectionError::Parse("no content in model response".to_string()))
    }
}

impl CornerDetector for VisionDetector {
    async fn detect(&self, image: &DynamicImage) -> Result<DetectedCorners, DetectionError> {
        let encoded = encode_image(image, self.config.max_image_side)?;
        tracing::debug!(
            model = %self.config.model_name,
            scale_x = encoded.scale_x,
            scale_y = encoded.scale_y,
            payload_bytes = encoded.base64_jpeg.len(),
            "sending photo to vision model"
        );

        let body = self.request_body(&encoded.base64_jpeg);
        let content = self.request(&body).await?;
        tracing::debug!(reply = %content, "vision model replied");

        let corners = parse_corner_response(&content)?;
        Ok(corners.rescaled(encoded.scale_x, encoded.scale_y))
    }
}
