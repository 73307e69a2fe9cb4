use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sigtrade_core::ChartSignal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_PROMPT: &str = "Analyze the provided trading chart image. \
Look for the signal markers 'A' and 'Y'. Identify the marker that is furthest \
to the right on the chart (the latest signal). 'A' is a BUY signal and 'Y' is \
a SELL signal. Respond with only the letter 'A' or 'Y'.";

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Could not read image {path}: {source}")]
    Image {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No vision API key configured")]
    MissingApiKey,
    #[error("Vision request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Vision API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed vision response: {0}")]
    MalformedResponse(String),
}

impl VisionError {
    /// Sentinel recorded in place of a signal when detection fails.
    pub fn sentinel(&self) -> ChartSignal {
        match self {
            VisionError::MalformedResponse(_) => ChartSignal::ResponseError,
            _ => ChartSignal::ApiError,
        }
    }
}

/// Vision endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Base URL; the model path and `:generateContent` are appended.
    pub api_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub prompt: String,
    /// Screenshot the detector reads.
    pub image_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            model: "gemini-2.5-flash-preview-05-20".to_string(),
            api_key: None,
            prompt: DEFAULT_PROMPT.to_string(),
            image_path: PathBuf::from("chart_capture.png"),
            timeout_secs: 60,
        }
    }
}

/// Sends chart screenshots to the vision model and parses its verdict.
pub struct SignalDetector {
    config: VisionConfig,
    client: Client,
}

impl SignalDetector {
    pub fn new(config: VisionConfig) -> Result<Self, VisionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.config.api_url.trim_end_matches('/'),
            self.config.model
        )
    }

    /// Detect the latest signal on the configured screenshot.
    ///
    /// Never fails: errors are logged and reported as a sentinel signal.
    pub async fn detect(&self) -> ChartSignal {
        match self.detect_file(&self.config.image_path).await {
            Ok(signal) => {
                info!(signal = %signal, "Chart signal detected");
                signal
            }
            Err(e) => {
                error!(error = %e, "Chart signal detection failed");
                e.sentinel()
            }
        }
    }

    pub async fn detect_file(&self, path: &Path) -> Result<ChartSignal, VisionError> {
        let image = encode_image(path)?;
        let text = self.analyze(&image).await?;
        let signal = ChartSignal::from_model_reply(&text);
        if signal == ChartSignal::None {
            warn!(reply = %text, "Model reply did not name a single signal");
        }
        Ok(signal)
    }

    /// POST the image and return the model's first text part.
    pub async fn analyze(&self, base64_png: &str) -> Result<String, VisionError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(VisionError::MissingApiKey)?;

        info!(model = %self.config.model, "Sending chart to vision model");
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", key)])
            .json(&build_request(base64_png, &self.config.prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| VisionError::MalformedResponse(e.to_string()))?;
        extract_text(&body)
    }
}

pub fn encode_image(path: &Path) -> Result<String, VisionError> {
    let bytes = std::fs::read(path).map_err(|source| VisionError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

/// `generateContent` body: one user turn with the prompt and the PNG inline.
pub fn build_request(base64_png: &str, prompt: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": prompt },
                { "inlineData": { "mimeType": "image/png", "data": base64_png } }
            ]
        }]
    })
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Text of the first part of the first candidate, trimmed.
pub fn extract_text(body: &str) -> Result<String, VisionError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| VisionError::MalformedResponse(e.to_string()))?;
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .map(|t| t.trim().to_string())
        .ok_or_else(|| VisionError::MalformedResponse("no candidate text".to_string()))
}

/// Reduce a response body to a signal; malformed bodies become `RESPONSE_ERROR`.
pub fn parse_response(body: &str) -> ChartSignal {
    match extract_text(body) {
        Ok(text) => ChartSignal::from_model_reply(&text),
        Err(e) => e.sentinel(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn body_with_text(text: &str) -> String {
        json!({
            "candidates": [{ "content": { "parts": [{ "text": text }], "role": "model" } }]
        })
        .to_string()
    }

    #[test]
    fn test_parse_response_letters_and_words() {
        assert_eq!(parse_response(&body_with_text("A")), ChartSignal::Buy);
        assert_eq!(parse_response(&body_with_text(" y\n")), ChartSignal::Sell);
        assert_eq!(parse_response(&body_with_text("SELL")), ChartSignal::Sell);
        assert_eq!(parse_response(&body_with_text("no markers")), ChartSignal::None);
    }

    #[test]
    fn test_parse_response_malformed() {
        assert_eq!(parse_response("not json"), ChartSignal::ResponseError);
        assert_eq!(parse_response(r#"{"candidates": []}"#), ChartSignal::ResponseError);
        assert_eq!(
            parse_response(r#"{"candidates": [{"content": {"parts": []}}]}"#),
            ChartSignal::ResponseError
        );
        assert_eq!(
            parse_response(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#),
            ChartSignal::ResponseError
        );
    }

    #[test]
    fn test_build_request_shape() {
        let body = build_request("aGVsbG8=", "prompt");
        let parts = &body["contents"][0]["parts"];
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(parts[0]["text"], "prompt");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "aGVsbG8=");
    }

    #[test]
    fn test_endpoint() {
        let detector = SignalDetector::new(VisionConfig {
            api_url: "http://localhost:9/v1beta/models/".to_string(),
            model: "m".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            detector.endpoint(),
            "http://localhost:9/v1beta/models/m:generateContent"
        );
    }

    #[tokio::test]
    async fn test_missing_image_is_api_error() {
        let detector = SignalDetector::new(VisionConfig {
            api_key: Some("k".to_string()),
            image_path: std::env::temp_dir().join("sigtrade-does-not-exist.png"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(detector.detect().await, ChartSignal::ApiError);
    }

    /// Serve one canned HTTP response and return the captured request text.
    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/v1beta/models", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    fn image_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sigtrade-{}-{}", std::process::id(), name));
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();
        path
    }

    #[tokio::test]
    async fn test_detect_against_local_endpoint() {
        let (url, server) = serve_once("200 OK", body_with_text("Y")).await;
        let path = image_file("detect-ok.png");
        let detector = SignalDetector::new(VisionConfig {
            api_url: url,
            model: "test-model".to_string(),
            api_key: Some("secret".to_string()),
            image_path: path.clone(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(detector.detect().await, ChartSignal::Sell);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1beta/models/test-model:generateContent?key=secret"));
        assert!(request.contains("inlineData"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_http_error_is_api_error() {
        let (url, server) = serve_once("500 Internal Server Error", "{}".to_string()).await;
        let path = image_file("detect-500.png");
        let detector = SignalDetector::new(VisionConfig {
            api_url: url,
            api_key: Some("secret".to_string()),
            image_path: path.clone(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(detector.detect().await, ChartSignal::ApiError);
        server.await.unwrap();
        let _ = std::fs::remove_file(path);
    }
}
