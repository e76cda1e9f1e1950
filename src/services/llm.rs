use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use url::Url;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/";

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini" or "ollama"
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_image_model")]
    pub image_model: String,
    #[serde(default = "default_gemini_speech_model")]
    pub speech_model: String,
    /// Prebuilt narration voice; chosen during setup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

pub(crate) fn default_gemini_model() -> String {
    "gemini-2.5-pro".to_string()
}
pub(crate) fn default_gemini_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
pub(crate) fn default_gemini_speech_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

pub const DEFAULT_GEMINI_VOICE: &str = "Kore";

/// Prebuilt voices offered by the Gemini speech models.
pub const GEMINI_VOICES: &[&str] = &[
    "Kore", "Puck", "Charon", "Fenrir", "Aoede", "Leda", "Orus", "Zephyr",
];

/// Binary payload returned inline by a model, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Chat constrained to a JSON response matching `schema`. Providers
    /// without structured output fall back to plain chat.
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        _schema: &serde_json::Value,
    ) -> Result<String> {
        self.chat(system, user).await
    }

    /// `Ok(None)` means the model answered without an image.
    async fn generate_image(&self, _prompt: &str) -> Result<Option<InlineData>> {
        Err(anyhow!("Image generation is not supported by this provider"))
    }

    /// `Ok(None)` means the model answered without audio.
    async fn generate_speech(&self, _text: &str) -> Result<Option<InlineData>> {
        Err(anyhow!("Speech synthesis is not supported by this provider"))
    }
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            Ok(Box::new(GeminiClient::new(cfg.clone())))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    }
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str) -> Result<Url> {
        let base = Url::parse(GEMINI_API_BASE)?;
        let mut url = base.join(&format!("models/{}:generateContent", model))?;
        url.query_pairs_mut().append_pair("key", &self.config.api_key);
        Ok(url)
    }

    async fn generate(&self, model: &str, request: &GeminiRequest) -> Result<Vec<GeminiPartResponse>> {
        self.generate_raw(model, request).await?.into_parts()
    }

    async fn generate_raw(&self, model: &str, request: &GeminiRequest) -> Result<GeminiResponse> {
        let url = self.endpoint(model)?;
        let resp = self.client.post(url).json(request).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = match serde_json::from_str(&response_text) {
            Ok(r) => r,
            Err(e) => {
                return Err(anyhow!(
                    "Failed to parse Gemini response: {}. Body: {}",
                    e,
                    response_text
                ))
            }
        };
        Ok(result)
    }

    fn user_content(text: &str) -> Vec<GeminiContent> {
        vec![GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: text.to_string(),
            }],
        }]
    }

    fn system_instruction(system: &str) -> Option<GeminiSystemInstruction> {
        if system.is_empty() {
            return None;
        }
        Some(GeminiSystemInstruction {
            parts: vec![GeminiPart {
                text: system.to_string(),
            }],
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

impl GeminiResponse {
    fn into_parts(self) -> Result<Vec<GeminiPartResponse>> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }
        let first = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| anyhow!("Gemini response contained no candidates"))?;
        match first.content {
            Some(content) if !content.parts.is_empty() => Ok(content.parts),
            _ => {
                let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
                Err(anyhow!("Gemini response empty. Finish reason: {}", reason))
            }
        }
    }

    /// First inline payload of an image or speech response. A refused
    /// request comes back as a candidate without content (finish reason
    /// `SAFETY`, `IMAGE_SAFETY`, ...) or with no candidates at all, which is
    /// `None` rather than an error.
    fn into_inline(self) -> Result<Option<InlineData>> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }
        let Some(first) = self.candidates.and_then(|c| c.into_iter().next()) else {
            debug!("Gemini media response contained no candidates");
            return Ok(None);
        };
        let inline = first.content.and_then(|content| first_inline(content.parts));
        if inline.is_none() {
            debug!(
                "Gemini media response carried no inline data. Finish reason: {}",
                first.finish_reason.as_deref().unwrap_or("UNKNOWN")
            );
        }
        Ok(inline)
    }
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    text: Option<String>,
    inline_data: Option<GeminiInlineData>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn first_text(parts: Vec<GeminiPartResponse>) -> Result<String> {
    parts
        .into_iter()
        .find_map(|p| p.text)
        .ok_or_else(|| anyhow!("Gemini response contained no text part"))
}

fn first_inline(parts: Vec<GeminiPartResponse>) -> Option<InlineData> {
    parts.into_iter().find_map(|p| {
        p.inline_data.map(|d| InlineData {
            mime_type: d.mime_type,
            data: d.data,
        })
    })
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let request = GeminiRequest {
            contents: Self::user_content(user),
            system_instruction: Self::system_instruction(system),
            generation_config: None,
        };
        first_text(self.generate(&self.config.model, &request).await?)
    }

    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        schema: &serde_json::Value,
    ) -> Result<String> {
        let request = GeminiRequest {
            contents: Self::user_content(user),
            system_instruction: Self::system_instruction(system),
            generation_config: Some(GeminiGenerationConfig {
                response_mime_type: Some("application/json".to_string()),
                response_schema: Some(schema.clone()),
                ..Default::default()
            }),
        };
        first_text(self.generate(&self.config.model, &request).await?)
    }

    async fn generate_image(&self, prompt: &str) -> Result<Option<InlineData>> {
        let request = GeminiRequest {
            contents: Self::user_content(prompt),
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                response_modalities: Some(vec!["IMAGE".to_string()]),
                ..Default::default()
            }),
        };
        self.generate_raw(&self.config.image_model, &request)
            .await?
            .into_inline()
    }

    async fn generate_speech(&self, text: &str) -> Result<Option<InlineData>> {
        let request = GeminiRequest {
            contents: Self::user_content(text),
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                response_modalities: Some(vec!["AUDIO".to_string()]),
                speech_config: Some(serde_json::json!({
                    "voiceConfig": {
                        "prebuiltVoiceConfig": {
                            "voiceName": self.config.voice.as_deref().unwrap_or(DEFAULT_GEMINI_VOICE)
                        }
                    }
                })),
                ..Default::default()
            }),
        };
        self.generate_raw(&self.config.speech_model, &request)
            .await?
            .into_inline()
    }
}

// --- Ollama ---

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, system: &str, user: &str, format: Option<serde_json::Value>) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: false,
            format,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.send(system, user, None).await
    }

    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        schema: &serde_json::Value,
    ) -> Result<String> {
        self.send(system, user, Some(schema.clone())).await
    }
}
