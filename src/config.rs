//! Service configuration, built once at start-up from the environment.
//!
//! `.env` is loaded by `main` before [`AppConfig::from_env`] runs. Parsing goes
//! through [`AppConfig::from_lookup`] so it can be exercised without touching
//! the process environment.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.mistral.ai/v1";
const DEFAULT_MODEL: &str = "pixtral-12b-2409";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TABLE: &str = "extracted_documents";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_CALLER_HEADER: &str = "x-caller-id";
const DEFAULT_MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Instruction sent alongside every image.
pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"Analyze this document image and extract all relevant data. Provide the extracted information in a structured JSON format with clear field names, values, and confidence scores (0-100) for each field. Also include the raw text content.

Return ONLY valid JSON with exactly three keys:
{
  "fields": {"field_name": "value"},
  "confidence": {"field_name": 95},
  "rawText": "the complete text content, preserving line breaks"
}

"fields" holds key-value pairs of extracted data (string or number values), "confidence" has the same keys as "fields" with a score from 0 to 100 for each, and "rawText" is the full transcription of the document."#;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    /// `None` when Supabase is not configured; documents then live in memory.
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Header carrying the caller identity used to scope history.
    pub caller_header: String,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub api_key: String,
    pub table: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = var("MISTRAL_API_KEY").context("MISTRAL_API_KEY environment variable not set")?;

        let prompt = match var("EXTRACTION_PROMPT_PATH") {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read extraction prompt: {}", path))?,
            None => DEFAULT_EXTRACTION_PROMPT.to_string(),
        };

        let timeout_secs: u64 = parse_or(var("AI_TIMEOUT_SECS"), "AI_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            anyhow::bail!("AI_TIMEOUT_SECS must be greater than zero");
        }

        let provider = ProviderConfig {
            api_key,
            base_url: var("MISTRAL_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: var("MISTRAL_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            prompt,
        };

        let storage = match (var("SUPABASE_URL"), var("SUPABASE_ANON_KEY")) {
            (Some(url), Some(api_key)) => Some(StorageConfig {
                url: url.trim_end_matches('/').to_string(),
                api_key,
                table: var("SUPABASE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            }),
            _ => None,
        };

        let server = ServerConfig {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            caller_header: var("CALLER_HEADER")
                .unwrap_or_else(|| DEFAULT_CALLER_HEADER.to_string())
                .to_ascii_lowercase(),
            max_body_bytes: parse_or(var("MAX_BODY_BYTES"), "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
        };

        Ok(Self {
            server,
            provider,
            storage,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
