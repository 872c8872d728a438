//! One-shot generation requests: images, image edits, video jobs and
//! video analysis. Each call is a plain request/response against the REST
//! API; only video generation polls.

use crate::error::StudioError;
use crate::gemini::{api_error_message, REST_BASE};
use crate::settings::Settings;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info};
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const NO_ANALYSIS: &str = "No analysis generated.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[default]
    Square,
    Portrait,
    Landscape,
    Portrait3x4,
    Landscape4x3,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
        }
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1:1" => Ok(AspectRatio::Square),
            "9:16" => Ok(AspectRatio::Portrait),
            "16:9" => Ok(AspectRatio::Landscape),
            "3:4" => Ok(AspectRatio::Portrait3x4),
            "4:3" => Ok(AspectRatio::Landscape4x3),
            other => Err(format!("unsupported aspect ratio '{}'", other)),
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video jobs only accept the two widescreen orientations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoAspect {
    #[default]
    Landscape,
    Portrait,
}

impl VideoAspect {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoAspect::Landscape => "16:9",
            VideoAspect::Portrait => "9:16",
        }
    }
}

impl FromStr for VideoAspect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "16:9" => Ok(VideoAspect::Landscape),
            "9:16" => Ok(VideoAspect::Portrait),
            other => Err(format!("video aspect must be 16:9 or 9:16, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    #[default]
    OneK,
    TwoK,
    FourK,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::OneK => "1K",
            ImageSize::TwoK => "2K",
            ImageSize::FourK => "4K",
        }
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(ImageSize::OneK),
            "2K" => Ok(ImageSize::TwoK),
            "4K" => Ok(ImageSize::FourK),
            other => Err(format!("unsupported image size '{}'", other)),
        }
    }
}

/// Bytes plus MIME type, as sent in an `inlineData` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl Media {
    pub fn from_path(path: &Path) -> Result<Self, String> {
        let data = std::fs::read(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Ok(Self {
            data,
            mime_type: mime_for_path(path).to_string(),
        })
    }

    fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.data),
            },
        })
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mpeg" | "mpg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Failed(String),
    Done(Option<String>),
}

/// First inline image of the first candidate, as a data URI.
pub fn first_inline_image(response: &Value) -> Option<String> {
    response["candidates"][0]["content"]["parts"]
        .as_array()?
        .iter()
        .find_map(|part| {
            let inline = part.get("inlineData")?;
            let data = inline.get("data")?.as_str()?;
            let mime = inline
                .get("mimeType")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png");
            Some(format!("data:{};base64,{}", mime, data))
        })
}

/// Concatenated text parts of the first candidate.
pub fn response_text(response: &Value) -> Option<String> {
    let parts = response["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Read a long-running operation snapshot.
pub fn job_status(operation: &Value) -> JobStatus {
    if !operation["done"].as_bool().unwrap_or(false) {
        return JobStatus::Pending;
    }
    if let Some(err) = operation.get("error") {
        let message = err["message"]
            .as_str()
            .unwrap_or("Video generation failed")
            .to_string();
        return JobStatus::Failed(message);
    }
    let response = &operation["response"];
    let uri = response["generateVideoResponse"]["generatedSamples"][0]["video"]["uri"]
        .as_str()
        .or_else(|| response["generatedVideos"][0]["video"]["uri"].as_str())
        .map(str::to_string);
    JobStatus::Done(uri)
}

/// Split a `data:<mime>;base64,<payload>` URI.
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>), StudioError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| StudioError::Malformed("not a data URI".into()))?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| StudioError::Malformed("data URI is not base64".into()))?;
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|e| StudioError::Malformed(e.to_string()))?;
    Ok((mime.to_string(), bytes))
}

#[derive(Debug, Clone)]
pub struct StudioModels {
    pub image: String,
    pub edit: String,
    pub video: String,
    pub analysis: String,
}

impl StudioModels {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            image: settings.image_model.clone(),
            edit: settings.edit_model.clone(),
            video: settings.video_model.clone(),
            analysis: settings.analysis_model.clone(),
        }
    }
}

pub struct StudioClient {
    client: Client,
    api_key: String,
    base_url: String,
    models: StudioModels,
    poll_every: Duration,
}

impl StudioClient {
    pub fn new(api_key: impl Into<String>, settings: &Settings) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: REST_BASE.to_string(),
            models: StudioModels::from_settings(settings),
            poll_every: Duration::from_secs(settings.video_poll_secs.max(1)),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StudioError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn generate_content(
        &self,
        model: &str,
        parts: Vec<Value>,
        config: Option<Value>,
    ) -> Result<Value, StudioError> {
        let mut body = json!({ "contents": [{ "parts": parts }] });
        if let Some(config) = config {
            body["generationConfig"] = config;
        }
        self.post(&format!("models/{}:generateContent", model), &body)
            .await
    }

    /// Returns the generated image as a data URI.
    pub async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        size: ImageSize,
    ) -> Result<String, StudioError> {
        info!(
            "[studio] generating image: model={} aspect={} size={}",
            self.models.image,
            aspect_ratio,
            size.as_str()
        );
        let config = json!({
            "responseModalities": ["TEXT", "IMAGE"],
            "imageConfig": {
                "aspectRatio": aspect_ratio.as_str(),
                "imageSize": size.as_str(),
            },
        });
        let response = self
            .generate_content(&self.models.image, vec![json!({ "text": prompt })], Some(config))
            .await?;
        first_inline_image(&response).ok_or(StudioError::NoImageReturned)
    }

    pub async fn edit_image(&self, image: &Media, prompt: &str) -> Result<String, StudioError> {
        info!("[studio] editing image: model={}", self.models.edit);
        let parts = vec![image.inline_part(), json!({ "text": prompt })];
        let response = self.generate_content(&self.models.edit, parts, None).await?;
        first_inline_image(&response).ok_or(StudioError::NoImageReturned)
    }

    /// Submit a video job, poll until it finishes, then download the result.
    pub async fn generate_video(
        &self,
        prompt: &str,
        image: Option<&Media>,
        aspect_ratio: VideoAspect,
    ) -> Result<Vec<u8>, StudioError> {
        let mut instance = json!({ "prompt": prompt });
        if let Some(image) = image {
            instance["image"] = json!({
                "bytesBase64Encoded": BASE64.encode(&image.data),
                "mimeType": image.mime_type,
            });
        }
        let body = json!({
            "instances": [instance],
            "parameters": {
                "aspectRatio": aspect_ratio.as_str(),
                "resolution": "720p",
                "sampleCount": 1,
            },
        });
        let mut operation = self
            .post(&format!("models/{}:predictLongRunning", self.models.video), &body)
            .await?;
        let name = operation["name"]
            .as_str()
            .ok_or_else(|| StudioError::Malformed("operation has no name".into()))?
            .to_string();
        info!("[studio] video job submitted: {}", name);

        let mut polls: u32 = 0;
        let uri = loop {
            match job_status(&operation) {
                JobStatus::Pending => {
                    tokio::time::sleep(self.poll_every).await;
                    polls += 1;
                    debug!("[studio] polling {} (#{})", name, polls);
                    let resp = self
                        .client
                        .get(format!("{}/{}", self.base_url, name))
                        .header("x-goog-api-key", &self.api_key)
                        .send()
                        .await?;
                    operation = read_json(resp).await?;
                }
                JobStatus::Failed(message) => return Err(StudioError::RemoteJob(message)),
                JobStatus::Done(None) => return Err(StudioError::NoVideoUri),
                JobStatus::Done(Some(uri)) => break uri,
            }
        };
        info!("[studio] video ready after {} polls", polls);
        self.download(&uri).await
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>, StudioError> {
        let resp = self
            .client
            .get(uri)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| StudioError::Download(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StudioError::Download(format!("HTTP {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StudioError::Download(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    pub async fn analyze_video(&self, video: &Media, prompt: &str) -> Result<String, StudioError> {
        info!(
            "[studio] analyzing {:.1}MB of {} with {}",
            video.data.len() as f64 / (1024.0 * 1024.0),
            video.mime_type,
            self.models.analysis
        );
        let parts = vec![video.inline_part(), json!({ "text": prompt })];
        let response = self
            .generate_content(&self.models.analysis, parts, None)
            .await?;
        Ok(response_text(&response).unwrap_or_else(|| NO_ANALYSIS.to_string()))
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value, StudioError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(StudioError::Api {
            status: status.as_u16(),
            body: api_error_message(&body),
        });
    }
    serde_json::from_str(&body).map_err(|e| StudioError::Malformed(e.to_string()))
}
