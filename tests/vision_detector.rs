//! Corner detector seam and the OpenAI-compatible client, exercised against
//! an in-process HTTP stub so no real model is ever contacted.

use floor_area::{
    estimate_area, CornerDetector, DetectedCorners, DetectionError, DetectorConfig, Point2D,
    ReferenceObjectSpec, VisionDetector,
};
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// ============================================================================
// Test helpers
// ============================================================================

/// Serve one canned `(status, body)` per incoming connection and hand back
/// the raw requests that were received.
async fn stub_server(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/v1", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut socket).await);

            let response = format!(
                "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
        requests
    });

    (base_url, handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn completion(content: &str) -> String {
    json!({
        "choices": [
            { "index": 0, "message": { "role": "assistant", "content": content } }
        ]
    })
    .to_string()
}

fn photo(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([120, 110, 100, 255])))
}

fn config(base_url: &str) -> DetectorConfig {
    DetectorConfig::default()
        .with_base_url(base_url)
        .with_api_key("test-key")
        .with_model_name("stub-vlm")
        .with_retry_delay(0)
}

// ============================================================================
// VisionDetector against the stub
// ============================================================================

#[tokio::test]
async fn test_detect_rescales_to_original_frame() {
    // Corners in the 400x300 upload frame, half the original size
    let reply = "```json\n{\"paper_corners\": [[50, 50], [150, 50], [150, 125], [50, 125]],\n \"floor_corners\": [[0, 0], [300, 0], [300, 225], [0, 225]]}\n```";
    let (base_url, server) = stub_server(vec![(200, completion(reply))]).await;

    let detector = VisionDetector::new(config(&base_url).with_max_image_side(400)).unwrap();
    let corners = detector.detect(&photo(800, 600)).await.unwrap();

    assert_eq!(corners.paper_corners[0], Point2D::new(100.0, 100.0));
    assert_eq!(corners.floor_corners[2], Point2D::new(600.0, 450.0));

    let area = estimate_area(
        &corners.paper_corners,
        &corners.floor_corners,
        &ReferenceObjectSpec::A4,
    )
    .unwrap();
    assert!((area - 0.56133).abs() < 1e-6, "area = {}", area);

    let requests = server.await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = requests[0].to_lowercase();
    assert!(request.starts_with("post /v1/chat/completions"));
    assert!(request.contains("authorization: bearer test-key"));
    assert!(request.contains("data:image/jpeg;base64,"));
    assert!(request.contains("stub-vlm"));
}

#[tokio::test]
async fn test_detect_retries_server_errors() {
    let reply = "{\"paper_corners\": [[1,1],[2,1],[2,2],[1,2]], \"floor_corners\": [[0,0],[9,0],[9,9],[0,9]]}";
    let (base_url, server) = stub_server(vec![
        (503, "{\"error\": \"overloaded\"}".to_string()),
        (200, completion(reply)),
    ])
    .await;

    let detector = VisionDetector::new(config(&base_url).with_max_retries(2)).unwrap();
    let corners = detector.detect(&photo(64, 48)).await.unwrap();

    assert_eq!(corners.floor_corners[1], Point2D::new(9.0, 0.0));
    assert_eq!(server.await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_detect_does_not_retry_client_errors() {
    let (base_url, server) =
        stub_server(vec![(401, "{\"error\": \"bad key\"}".to_string())]).await;

    let detector = VisionDetector::new(config(&base_url).with_max_retries(3)).unwrap();
    let err = detector.detect(&photo(64, 48)).await.unwrap_err();

    match err {
        DetectionError::Api { status, body } => {
            assert_eq!(status, 401);
            assert!(body.contains("bad key"));
        }
        other => panic!("expected Api error, got {:?}", other),
    }
    assert_eq!(server.await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_detect_gives_up_after_retries() {
    let (base_url, server) = stub_server(vec![
        (500, "{}".to_string()),
        (502, "{}".to_string()),
    ])
    .await;

    let detector = VisionDetector::new(config(&base_url).with_max_retries(1)).unwrap();
    let err = detector.detect(&photo(64, 48)).await.unwrap_err();

    assert!(matches!(err, DetectionError::MaxRetriesExceeded(2, _)), "{:?}", err);
    assert_eq!(server.await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_detect_reports_unparseable_reply() {
    let (base_url, server) =
        stub_server(vec![(200, completion("Sorry, I can't find any paper."))]).await;

    let detector = VisionDetector::new(config(&base_url)).unwrap();
    let err = detector.detect(&photo(64, 48)).await.unwrap_err();

    assert!(matches!(err, DetectionError::Parse(_)), "{:?}", err);
    assert_eq!(server.await.unwrap().len(), 1);
}

// ============================================================================
// The detector seam
// ============================================================================

struct FixedDetector(DetectedCorners);

impl CornerDetector for FixedDetector {
    async fn detect(&self, _image: &DynamicImage) -> Result<DetectedCorners, DetectionError> {
        Ok(self.0.clone())
    }
}

struct FailingDetector;

impl CornerDetector for FailingDetector {
    async fn detect(&self, _image: &DynamicImage) -> Result<DetectedCorners, DetectionError> {
        Err(DetectionError::Parse("missing floor_corners".to_string()))
    }
}

async fn area_from<D: CornerDetector>(detector: &D) -> anyhow::Result<f64> {
    let corners = detector.detect(&photo(8, 8)).await?;
    Ok(estimate_area(
        &corners.paper_corners,
        &corners.floor_corners,
        &ReferenceObjectSpec::A4,
    )?)
}

fn square(origin: f64, side: f64) -> Vec<Point2D> {
    vec![
        Point2D::new(origin, origin),
        Point2D::new(origin + side, origin),
        Point2D::new(origin + side, origin + side),
        Point2D::new(origin, origin + side),
    ]
}

#[tokio::test]
async fn test_fixed_detector_feeds_geometry() {
    let detector = FixedDetector(DetectedCorners {
        paper_corners: square(10.0, 100.0),
        floor_corners: square(0.0, 400.0),
    });
    let area = area_from(&detector).await.unwrap();
    assert!((area - 16.0 * 0.210 * 0.297).abs() < 1e-6);
}

#[tokio::test]
async fn test_short_detector_output_is_rejected() {
    let mut paper = square(10.0, 100.0);
    paper.pop();
    let detector = FixedDetector(DetectedCorners {
        paper_corners: paper,
        floor_corners: square(0.0, 400.0),
    });
    let err = area_from(&detector).await.unwrap_err();
    assert!(err.to_string().contains("exactly 4 points"), "{}", err);
}

#[tokio::test]
async fn test_detection_failure_propagates() {
    let err = area_from(&FailingDetector).await.unwrap_err();
    assert!(err.downcast_ref::<DetectionError>().is_some());
}
