use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mimesis_contracts::analysis::{
    analysis_from_output, AnalysisInput, AnalysisOutcome, SchemaViolation,
};
use mimesis_contracts::files::{is_image_mime, mime_for_file_name, MAX_UPLOAD_BYTES};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// The system's entire "intelligence": one static instruction plus one piece
/// of user media. No dynamic prompt construction, no multi-turn logic.
pub const ANALYSIS_INSTRUCTION: &str = "You are an expert in analyzing files to determine their \
\"why\" - what makes the media connect with its audience.\n\n\
Analyze the provided file and provide insights into its potential impact, what audience \
segments it will resonate with, and what makes it connect with its audience.\n\n\
Respond with a JSON object containing a single string field named \"analysis\".";

#[derive(Debug, Clone)]
pub struct EncodedUpload {
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub sha256_hex: String,
    pub pixel_dims: Option<(u32, u32)>,
    pub data_uri: String,
}

impl EncodedUpload {
    /// Receipt-ready metadata; deliberately excludes the encoded payload.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("name".to_string(), Value::String(self.file_name.clone()));
        out.insert(
            "mime_type".to_string(),
            Value::String(self.mime_type.clone()),
        );
        out.insert(
            "size_bytes".to_string(),
            Value::Number(self.size_bytes.into()),
        );
        out.insert(
            "sha256".to_string(),
            Value::String(self.sha256_hex.clone()),
        );
        if let Some((width, height)) = self.pixel_dims {
            out.insert("width".to_string(), Value::Number(width.into()));
            out.insert("height".to_string(), Value::Number(height.into()));
        }
        out
    }
}

/// Read a file and encode it into a self-describing Base64 data URI. MIME
/// comes from the extension map; the size cap is enforced before encoding.
pub fn encode_file_to_data_uri(path: &Path) -> Result<EncodedUpload> {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("path has no usable file name: {}", path.display()))?;
    let Some(mime_type) = mime_for_file_name(&file_name) else {
        bail!("unsupported file type '{file_name}'; expected .png, .jpg, .jpeg, or .fig");
    };

    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let size_bytes = bytes.len() as u64;
    if size_bytes > MAX_UPLOAD_BYTES {
        bail!(
            "file is too large ({size_bytes} bytes); maximum size is {MAX_UPLOAD_BYTES} bytes"
        );
    }

    let sha256_hex = hex::encode(Sha256::digest(&bytes));
    // Pixel dimensions are preview metadata only; a file that fails to
    // decode still gets analyzed.
    let pixel_dims = if is_image_mime(mime_type) {
        image::load_from_memory(&bytes)
            .ok()
            .map(|img| (img.width(), img.height()))
    } else {
        None
    };
    let data_uri = format!("data:{mime_type};base64,{}", BASE64.encode(&bytes));

    Ok(EncodedUpload {
        file_name,
        mime_type: mime_type.to_string(),
        size_bytes,
        sha256_hex,
        pixel_dims,
        data_uri,
    })
}

#[derive(Debug, Clone)]
pub struct ProviderAnalyzeRequest {
    pub input: AnalysisInput,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ProviderAnalyzeResponse {
    pub analysis: String,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, request: &ProviderAnalyzeRequest) -> Result<ProviderAnalyzeResponse>;
}

#[derive(Default)]
pub struct AnalysisProviderRegistry {
    providers: BTreeMap<String, Box<dyn AnalysisProvider>>,
}

impl AnalysisProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: AnalysisProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn AnalysisProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> AnalysisProviderRegistry {
    let mut registry = AnalysisProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(GeminiProvider::new());
    registry.register(OpenAiProvider::new());
    registry
}

/// Offline provider for tests and demos: the analysis is derived
/// deterministically from the parsed input, no network involved.
pub struct DryrunProvider;

impl AnalysisProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, request: &ProviderAnalyzeRequest) -> Result<ProviderAnalyzeResponse> {
        let input = &request.input;
        let medium = if is_image_mime(input.mime_type()) {
            "image"
        } else {
            "design file"
        };
        let analysis = format!(
            "This {medium} ({}, {}-character payload) leads with a clear focal point and a \
restrained palette, which reads as confidence rather than noise. It will resonate most with \
audiences who value craft over spectacle: early adopters, design-literate peers, and people \
who collect work that rewards a second look. The connection comes from restraint - the piece \
trusts its viewer to meet it halfway.",
            input.mime_type(),
            input.payload_base64().len(),
        );
        Ok(ProviderAnalyzeResponse {
            analysis,
            provider_request: object(json!({
                "endpoint": "dryrun-native",
                "model": request.model,
                "mime_type": input.mime_type(),
            })),
            provider_response: object(json!({ "status": "ok" })),
            warnings: Vec::new(),
        })
    }
}

pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn extract_text(response_payload: &Value) -> Result<String> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                {
                    return Ok(text.to_string());
                }
            }
        }
        Err(SchemaViolation::OutputMissing.into())
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, request: &ProviderAnalyzeRequest) -> Result<ProviderAnalyzeResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let input = &request.input;
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": input.mime_type(),
                            "data": input.payload_base64(),
                        }
                    },
                    { "text": ANALYSIS_INSTRUCTION },
                ],
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let status_code = response.status().as_u16();
        let response_payload = response_json_or_error("Gemini", response)?;

        let mut warnings = Vec::new();
        let text = Self::extract_text(&response_payload)?;
        let analysis = structured_analysis_from_text(&text, &mut warnings)?;

        Ok(ProviderAnalyzeResponse {
            analysis,
            provider_request: object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: object(json!({
                "status_code": status_code,
                "model_version": response_payload.get("modelVersion").cloned().unwrap_or(Value::Null),
                "usage": response_payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
            })),
            warnings,
        })
    }
}

pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENAI_API_KEY")
    }

    fn extract_text(response_payload: &Value) -> Result<String> {
        response_payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| SchemaViolation::OutputMissing.into())
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn analyze(&self, request: &ProviderAnalyzeRequest) -> Result<ProviderAnalyzeResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("OPENAI_API_KEY not set");
        };
        let endpoint = format!("{}/chat/completions", self.api_base);
        let input = &request.input;
        let payload = json!({
            "model": request.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": ANALYSIS_INSTRUCTION },
                    {
                        "type": "image_url",
                        "image_url": { "url": input.to_data_uri() },
                    },
                ],
            }],
            "response_format": { "type": "json_object" },
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let status_code = response.status().as_u16();
        let response_payload = response_json_or_error("OpenAI", response)?;

        let mut warnings = Vec::new();
        let text = Self::extract_text(&response_payload)?;
        let analysis = structured_analysis_from_text(&text, &mut warnings)?;

        Ok(ProviderAnalyzeResponse {
            analysis,
            provider_request: object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: object(json!({
                "status_code": status_code,
                "id": response_payload.get("id").cloned().unwrap_or(Value::Null),
                "usage": response_payload.get("usage").cloned().unwrap_or(Value::Null),
            })),
            warnings,
        })
    }
}

/// Parse the data URI and issue the single prompt call. Schema violations
/// and transport failures propagate as errors for the boundary to catch.
pub fn run_analysis(
    provider: &dyn AnalysisProvider,
    model: &str,
    file_data_uri: &str,
) -> Result<ProviderAnalyzeResponse> {
    let input = AnalysisInput::parse(file_data_uri)?;
    let request = ProviderAnalyzeRequest {
        input,
        model: model.trim().to_string(),
    };
    provider.analyze(&request)
}

/// Fold a raw invocation result into the uniform two-variant outcome. A
/// call that "succeeds" with blank text still counts as a failure so the
/// caller never renders empty output.
pub fn normalize_outcome(
    result: Result<ProviderAnalyzeResponse>,
) -> (AnalysisOutcome, Option<ProviderAnalyzeResponse>) {
    match result {
        Ok(response) => {
            if response.analysis.trim().is_empty() {
                (
                    AnalysisOutcome::failure("Analysis returned no result."),
                    Some(response),
                )
            } else {
                (
                    AnalysisOutcome::success(response.analysis.clone()),
                    Some(response),
                )
            }
        }
        Err(err) => {
            let cause = error_chain_text(&err);
            let message = if cause.trim().is_empty() {
                "An unknown error occurred.".to_string()
            } else {
                cause
            };
            (
                AnalysisOutcome::failure(format!("An error occurred during analysis: {message}")),
                None,
            )
        }
    }
}

/// Boundary call: always returns the uniform outcome, never an error. Empty
/// input short-circuits before any provider call.
pub fn analyze_file_action(
    provider: &dyn AnalysisProvider,
    model: &str,
    file_data_uri: &str,
) -> AnalysisOutcome {
    if file_data_uri.trim().is_empty() {
        return AnalysisOutcome::failure("File data is missing.");
    }
    normalize_outcome(run_analysis(provider, model, file_data_uri)).0
}

// Providers are asked for JSON, but a model may still hand back bare prose.
// An object without the analysis field is a schema violation; bare text is
// accepted with a warning.
fn structured_analysis_from_text(text: &str, warnings: &mut Vec<String>) -> Result<String> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return Ok(analysis_from_output(&value)?);
        }
    }
    warnings.push("provider returned unstructured text; using it as the analysis".to_string());
    Ok(text.trim().to_string())
}

pub fn error_chain_text(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{label} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{label} returned invalid JSON payload"))
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use base64::Engine as _;
    use image::RgbImage;
    use mimesis_contracts::analysis::AnalysisInput;
    use mimesis_contracts::files::MAX_UPLOAD_BYTES;
    use serde_json::json;

    use super::{
        analyze_file_action, default_provider_registry, encode_file_to_data_uri, normalize_outcome,
        run_analysis, structured_analysis_from_text, truncate_text, AnalysisProvider,
        DryrunProvider, GeminiProvider, ProviderAnalyzeRequest, ProviderAnalyzeResponse, BASE64,
    };

    const PNG_URI: &str = "data:image/png;base64,aGVsbG8=";

    struct StaticProvider {
        text: String,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AnalysisProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        fn analyze(
            &self,
            _request: &ProviderAnalyzeRequest,
        ) -> anyhow::Result<ProviderAnalyzeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderAnalyzeResponse {
                analysis: self.text.clone(),
                provider_request: Default::default(),
                provider_response: Default::default(),
                warnings: Vec::new(),
            })
        }
    }

    struct FailingProvider {
        message: String,
    }

    impl AnalysisProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn analyze(
            &self,
            _request: &ProviderAnalyzeRequest,
        ) -> anyhow::Result<ProviderAnalyzeResponse> {
            Err(anyhow::anyhow!(self.message.clone()))
        }
    }

    #[test]
    fn empty_input_fails_without_calling_the_provider() {
        let provider = StaticProvider::new("should not run");
        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", "");
        assert_eq!(outcome.error(), Some("File data is missing."));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", "   ");
        assert_eq!(outcome.error(), Some("File data is missing."));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn successful_call_returns_exact_provider_text() {
        let provider = StaticProvider::new("bold, warm, collector bait");
        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", PNG_URI);
        assert!(outcome.is_success());
        assert_eq!(outcome.analysis(), Some("bold, warm, collector bait"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blank_provider_text_is_reported_as_no_result() {
        let provider = StaticProvider::new("   ");
        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", PNG_URI);
        assert_eq!(outcome.error(), Some("Analysis returned no result."));
    }

    #[test]
    fn provider_error_is_normalized_with_its_cause() {
        let provider = FailingProvider {
            message: "socket closed".to_string(),
        };
        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", PNG_URI);
        assert_eq!(
            outcome.error(),
            Some("An error occurred during analysis: socket closed")
        );
    }

    #[test]
    fn blank_cause_falls_back_to_generic_message() {
        let provider = FailingProvider {
            message: "  ".to_string(),
        };
        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", PNG_URI);
        assert_eq!(
            outcome.error(),
            Some("An error occurred during analysis: An unknown error occurred.")
        );
    }

    #[test]
    fn malformed_data_uri_is_caught_at_the_boundary() {
        let provider = StaticProvider::new("should not run");
        let outcome = analyze_file_action(&provider, "gemini-2.5-flash", "not-a-data-uri");
        let error = outcome.error().unwrap_or_default();
        assert!(error.starts_with("An error occurred during analysis:"));
        assert!(error.contains("malformed"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn normalize_outcome_keeps_the_response_for_receipts() {
        let provider = StaticProvider::new("keeps response");
        let (outcome, response) =
            normalize_outcome(run_analysis(&provider, "gemini-2.5-flash", PNG_URI));
        assert!(outcome.is_success());
        assert_eq!(response.map(|r| r.analysis), Some("keeps response".to_string()));
    }

    #[test]
    fn dryrun_provider_is_deterministic_and_non_empty() {
        let provider = DryrunProvider;
        let first = analyze_file_action(&provider, "dryrun-analysis-1", PNG_URI);
        let second = analyze_file_action(&provider, "dryrun-analysis-1", PNG_URI);
        assert!(first.is_success());
        assert_eq!(first, second);
        assert!(first.analysis().unwrap_or_default().contains("image/png"));
    }

    #[test]
    fn default_registry_lists_known_providers() {
        let registry = default_provider_registry();
        assert_eq!(
            registry.names(),
            vec![
                "dryrun".to_string(),
                "gemini".to_string(),
                "openai".to_string()
            ]
        );
        assert!(registry.get("dryrun").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn encode_png_reports_dims_digest_and_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("tiny.png");
        RgbImage::new(2, 3).save(&path)?;

        let upload = encode_file_to_data_uri(&path)?;
        assert_eq!(upload.file_name, "tiny.png");
        assert_eq!(upload.mime_type, "image/png");
        assert_eq!(upload.pixel_dims, Some((2, 3)));
        assert_eq!(upload.sha256_hex.len(), 64);
        assert!(upload.data_uri.starts_with("data:image/png;base64,"));

        let input = AnalysisInput::parse(&upload.data_uri).expect("valid data uri");
        let decoded = BASE64.decode(input.payload_base64().as_bytes())?;
        assert_eq!(decoded, std::fs::read(&path)?);
        assert_eq!(upload.size_bytes, decoded.len() as u64);
        Ok(())
    }

    #[test]
    fn encode_fig_uses_design_mime_without_dims() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("board.fig");
        std::fs::write(&path, b"figma-binary")?;

        let upload = encode_file_to_data_uri(&path)?;
        assert_eq!(upload.mime_type, "application/x-figma");
        assert_eq!(upload.pixel_dims, None);
        assert!(upload.data_uri.starts_with("data:application/x-figma;base64,"));
        Ok(())
    }

    #[test]
    fn encode_rejects_unknown_extension_and_oversize_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let unknown = temp.path().join("notes.txt");
        std::fs::write(&unknown, b"hi")?;
        assert!(encode_file_to_data_uri(&unknown).is_err());

        let oversized = temp.path().join("huge.fig");
        std::fs::write(&oversized, vec![0u8; (MAX_UPLOAD_BYTES + 1) as usize])?;
        let err = encode_file_to_data_uri(&oversized).unwrap_err();
        assert!(err.to_string().contains("too large"));
        Ok(())
    }

    #[test]
    fn gemini_text_extraction_requires_a_text_part() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"analysis\": \"works\"}" }] }
            }]
        });
        assert_eq!(
            GeminiProvider::extract_text(&payload).unwrap(),
            "{\"analysis\": \"works\"}"
        );

        let empty = json!({ "candidates": [] });
        assert!(GeminiProvider::extract_text(&empty).is_err());
    }

    #[test]
    fn structured_text_parsing_is_strict_for_objects_lenient_for_prose() {
        let mut warnings = Vec::new();
        assert_eq!(
            structured_analysis_from_text("{\"analysis\": \"clean\"}", &mut warnings).unwrap(),
            "clean"
        );
        assert!(warnings.is_empty());

        // Object without the field is a schema violation, not prose.
        assert!(structured_analysis_from_text("{\"other\": 1}", &mut warnings).is_err());

        let prose = structured_analysis_from_text("just some prose", &mut warnings).unwrap();
        assert_eq!(prose, "just some prose");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn truncate_text_appends_ellipsis_only_when_needed() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdefghij", 4), "abcd...");
    }
}
