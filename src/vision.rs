use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Cursor;
use std::time::Duration;
use tokio::time::sleep;

use crate::driver::{AutomationDriver, Point, Snapshot};
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementPrediction {
    pub point: Point,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionVerdict {
    Yes,
    No,
    Unsure,
}

/// UI Understanding Provider: turns a snapshot into element locations,
/// yes/no screen assessments and free text.
#[async_trait]
pub trait UiUnderstandingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn locate(&self, snapshot: &Snapshot, description: &str) -> AgentResult<Option<ElementPrediction>>;

    async fn assess(&self, snapshot: &Snapshot, condition: &str) -> AgentResult<VisionVerdict>;

    async fn read_text(&self, snapshot: &Snapshot, instruction: &str) -> AgentResult<Option<String>>;
}

/// Provider used when no vision model is configured. Never claims anything.
pub struct NullProvider;

#[async_trait]
impl UiUnderstandingProvider for NullProvider {
    fn name(&self) -> &str {
        "none"
    }

    async fn locate(&self, _snapshot: &Snapshot, _description: &str) -> AgentResult<Option<ElementPrediction>> {
        Ok(None)
    }

    async fn assess(&self, _snapshot: &Snapshot, _condition: &str) -> AgentResult<VisionVerdict> {
        Ok(VisionVerdict::Unsure)
    }

    async fn read_text(&self, _snapshot: &Snapshot, _instruction: &str) -> AgentResult<Option<String>> {
        Ok(None)
    }
}

// =====================================================
// VISION MODEL PROVIDER (chat-completions compatible)
// =====================================================

pub struct VisionModelProvider {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl VisionModelProvider {
    pub fn new(api_url: &str, api_key: &str, model: &str) -> AgentResult<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_retries: 3,
        })
    }

    /// Retries on network errors, 5xx and 429 with exponential backoff (1s, 2s, 4s).
    async fn post_with_retry(&self, body: &Value) -> AgentResult<reqwest::Response> {
        let mut attempt = 0;
        let mut backoff = Duration::from_secs(1);

        loop {
            attempt += 1;
            match self
                .client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await
            {
                Ok(resp) => {
                    let retryable = resp.status().is_server_error()
                        || resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt > self.max_retries {
                        return Ok(resp);
                    }
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(AgentError::Http(e));
                    }
                    tracing::warn!(attempt, max = self.max_retries, error = %e, "vision request failed, retrying");
                }
            }
            sleep(backoff).await;
            backoff *= 2;
        }
    }

    async fn ask(&self, prompt: &str, snapshot: &Snapshot) -> AgentResult<Option<(String, f32)>> {
        let Some(raw) = snapshot.screenshot_b64.as_deref() else {
            return Ok(None);
        };
        let (jpeg_b64, scale) = prepare_screenshot(raw)?;

        let body = json!({
            "model": &self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": format!("data:image/jpeg;base64,{}", jpeg_b64) } }
                ]
            }],
            "temperature": 0.0,
            "max_tokens": 800
        });

        let resp = self.post_with_retry(&body).await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::TransientUi(format!("vision API error: {}", text)));
        }
        let payload: Value = resp.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(Some((content, scale)))
    }
}

#[async_trait]
impl UiUnderstandingProvider for VisionModelProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn locate(&self, snapshot: &Snapshot, description: &str) -> AgentResult<Option<ElementPrediction>> {
        let prompt = format!(
            "Find the UI element: '{}'.\nReply ONLY with JSON: {{\"found\": true|false, \"x\": <int>, \"y\": <int>, \"confidence\": <0..1>}} \
             where x,y is the element centre in image pixels.",
            description
        );
        match self.ask(&prompt, snapshot).await? {
            Some((content, scale)) => Ok(parse_prediction(&content, scale)),
            None => Ok(None),
        }
    }

    async fn assess(&self, snapshot: &Snapshot, condition: &str) -> AgentResult<VisionVerdict> {
        let prompt = format!(
            "Screen Verification Task.\nCondition to verify: '{}'.\nReply ONLY with 'YES', 'NO' or 'UNSURE'.",
            condition
        );
        match self.ask(&prompt, snapshot).await? {
            Some((content, _)) => Ok(parse_verdict(&content)),
            None => Ok(VisionVerdict::Unsure),
        }
    }

    async fn read_text(&self, snapshot: &Snapshot, instruction: &str) -> AgentResult<Option<String>> {
        let prompt = format!(
            "{}\nReply with the text only, exactly as shown. Reply NONE if there is no such text.",
            instruction
        );
        match self.ask(&prompt, snapshot).await? {
            Some((content, _)) => {
                let text = content.trim();
                if text.is_empty() || text.eq_ignore_ascii_case("none") {
                    Ok(None)
                } else {
                    Ok(Some(text.to_string()))
                }
            }
            None => Ok(None),
        }
    }
}

#[derive(Deserialize)]
struct RawPrediction {
    found: bool,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

pub fn parse_prediction(content: &str, scale: f32) -> Option<ElementPrediction> {
    let raw = JSON_OBJECT.find(content)?.as_str();
    let parsed: RawPrediction = serde_json::from_str(raw).ok()?;
    if !parsed.found {
        return None;
    }
    Some(ElementPrediction {
        point: Point::new((parsed.x as f32 * scale) as i32, (parsed.y as f32 * scale) as i32),
        confidence: parsed.confidence,
    })
}

pub fn parse_verdict(content: &str) -> VisionVerdict {
    let upper = content.trim().to_uppercase();
    if upper.starts_with("YES") {
        VisionVerdict::Yes
    } else if upper.starts_with("NO") {
        VisionVerdict::No
    } else {
        VisionVerdict::Unsure
    }
}

// =====================================================
// SCREENSHOT HELPERS
// =====================================================

fn decode_image(b64: &str) -> AgentResult<image::DynamicImage> {
    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| AgentError::TransientUi(format!("screenshot is not base64: {}", e)))?;
    image::load_from_memory(&bytes).map_err(|e| AgentError::TransientUi(format!("screenshot decode failed: {}", e)))
}

/// Downscale to at most 1920px wide and re-encode as JPEG. Returns the
/// factor that maps model coordinates back to screen coordinates.
pub fn prepare_screenshot(b64: &str) -> AgentResult<(String, f32)> {
    let img = decode_image(b64)?;
    let max_dim = 1920u32;
    let scale_factor = if img.width() > max_dim {
        img.width() as f32 / max_dim as f32
    } else {
        1.0
    };

    let resized = if scale_factor > 1.0 {
        img.resize(max_dim, max_dim, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(resized.to_rgb8())
        .write_to(&mut buffer, image::ImageOutputFormat::Jpeg(80))
        .map_err(|e| AgentError::TransientUi(format!("screenshot encode failed: {}", e)))?;
    Ok((general_purpose::STANDARD.encode(buffer.get_ref()), scale_factor))
}

/// Fraction of differing pixels between two screenshots (0.0 to 1.0).
pub fn screen_diff(a_b64: &str, b_b64: &str) -> AgentResult<f64> {
    let img1 = decode_image(a_b64)?;
    let img2 = decode_image(b_b64)?;
    Ok(image_diff(&img1, &img2))
}

fn image_diff(img1: &image::DynamicImage, img2: &image::DynamicImage) -> f64 {
    use image::GenericImageView;
    if img1.dimensions() != img2.dimensions() {
        return 1.0;
    }

    let thumb1 = img1.resize_exact(256, 144, image::imageops::FilterType::Nearest);
    let thumb2 = img2.resize_exact(256, 144, image::imageops::FilterType::Nearest);

    let mut diff_pixels = 0u32;
    let total_pixels = 256 * 144;
    for y in 0..144 {
        for x in 0..256 {
            let p1 = thumb1.get_pixel(x, y);
            let p2 = thumb2.get_pixel(x, y);
            let r_diff = (p1[0] as i32 - p2[0] as i32).abs();
            let g_diff = (p1[1] as i32 - p2[1] as i32).abs();
            let b_diff = (p1[2] as i32 - p2[2] as i32).abs();
            if r_diff + g_diff + b_diff > 30 {
                diff_pixels += 1;
            }
        }
    }
    diff_pixels as f64 / total_pixels as f64
}

/// Wait until two consecutive screenshots are near-identical, so structural
/// checks do not race an animation. Gives up silently on timeout or when
/// the backend cannot capture.
pub async fn wait_for_ui_settle(driver: &dyn AutomationDriver, timeout: Duration) {
    if timeout.is_zero() {
        return;
    }
    let start = std::time::Instant::now();
    let threshold = 0.01;
    let required_stable_frames = 2;
    let mut stable_frames = 0;

    let Ok(mut prev) = driver.screenshot().await else {
        return;
    };

    while start.elapsed() < timeout {
        sleep(Duration::from_millis(200)).await;
        let Ok(next) = driver.screenshot().await else {
            return;
        };
        match screen_diff(&prev, &next) {
            Ok(diff) if diff < threshold => {
                stable_frames += 1;
                if stable_frames >= required_stable_frames {
                    tracing::debug!("UI settled");
                    return;
                }
            }
            Ok(diff) => {
                stable_frames = 0;
                tracing::debug!(diff_pct = diff * 100.0, "UI moving");
            }
            Err(_) => return,
        }
        prev = next;
    }
    tracing::debug!(waited_ms = timeout.as_millis() as u64, "UI settle timed out, proceeding");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> String {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, image::ImageOutputFormat::Png)
            .unwrap();
        general_purpose::STANDARD.encode(buffer.get_ref())
    }

    #[test]
    fn verdicts_are_conservative() {
        assert_eq!(parse_verdict("YES"), VisionVerdict::Yes);
        assert_eq!(parse_verdict(" no, the overlay is open"), VisionVerdict::No);
        assert_eq!(parse_verdict("I think so"), VisionVerdict::Unsure);
        assert_eq!(parse_verdict(""), VisionVerdict::Unsure);
    }

    #[test]
    fn predictions_are_scaled_back() {
        let content = "Sure: {\"found\": true, \"x\": 100, \"y\": 40, \"confidence\": 0.9}";
        let prediction = parse_prediction(content, 2.0).unwrap();
        assert_eq!(prediction.point, Point::new(200, 80));
        assert!(parse_prediction("{\"found\": false}", 1.0).is_none());
        assert!(parse_prediction("nothing here", 1.0).is_none());
    }

    #[test]
    fn identical_screens_have_no_diff() {
        let a = solid_png(64, 64, [10, 10, 10]);
        let b = solid_png(64, 64, [250, 250, 250]);
        assert_eq!(screen_diff(&a, &a).unwrap(), 0.0);
        assert!(screen_diff(&a, &b).unwrap() > 0.99);
        assert_eq!(screen_diff(&a, &solid_png(32, 64, [10, 10, 10])).unwrap(), 1.0);
    }

    #[test]
    fn large_screenshots_are_downscaled() {
        let big = solid_png(3840, 100, [0, 0, 0]);
        let (_, scale) = prepare_screenshot(&big).unwrap();
        assert!((scale - 2.0).abs() < f32::EPSILON);
    }
}
