//! Decoding of inbound image payloads (bare base64 or `data:` URIs).

use base64::{
    engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD},
    Engine as _,
};
use image::ImageFormat;
use thiserror::Error;

/// Mime type assumed when neither the caller nor the magic bytes tell us.
const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("No image provided")]
    Empty,
    #[error("Malformed data URI: {0}")]
    MalformedDataUri(String),
    #[error("Invalid base64 image data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Decoded image bytes plus the mime type forwarded to the vision model.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImagePayload {
    /// Parse a `data:<mime>;base64,<data>` URI or bare base64 text.
    pub fn parse(input: &str) -> Result<Self, ImageError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ImageError::Empty);
        }

        let (declared_mime, encoded) = match input.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest
                    .split_once(',')
                    .ok_or_else(|| ImageError::MalformedDataUri("missing ',' separator".into()))?;
                if !header.ends_with(";base64") {
                    return Err(ImageError::MalformedDataUri(format!(
                        "expected base64 encoding, got '{}'",
                        header
                    )));
                }
                let mime = header.split(';').next().unwrap_or_default().trim();
                (Some(mime).filter(|m| !m.is_empty()), data)
            }
            None => (None, input),
        };

        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let data = BASE64
            .decode(compact.as_bytes())
            .or_else(|_| STANDARD_NO_PAD.decode(compact.as_bytes()))?;

        Self::from_bytes(data, declared_mime)
    }

    /// Wrap raw bytes (e.g. a multipart upload), sniffing the format when
    /// no usable mime type is declared.
    pub fn from_bytes(data: Vec<u8>, declared_mime: Option<&str>) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty);
        }

        let mime_type = declared_mime
            .filter(|m| m.starts_with("image/"))
            .map(str::to_string)
            .unwrap_or_else(|| sniff_mime(&data).to_string());

        Ok(Self { mime_type, data })
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.data))
    }
}

/// Guess the mime type from magic bytes.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Bmp) => "image/bmp",
        Ok(ImageFormat::Tiff) => "image/tiff",
        _ => DEFAULT_MIME,
    }
}
