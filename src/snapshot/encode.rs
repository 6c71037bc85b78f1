//! Encoding capture surfaces into portable image references.
//!
//! Two reference kinds: `data:` URLs carrying the bytes inline, and
//! `blob:crabstream/<uuid>` object URLs whose bytes live in an
//! [`ObjectUrlStore`] until revoked.

use crate::errors::CameraError;
use crate::snapshot::rotate::CaptureSurface;
use crate::snapshot::{DataType, ImageFormat, ImageOptions};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, RgbImage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

const OBJECT_URL_PREFIX: &str = "blob:crabstream/";

/// Turns a drawn surface into an image reference and back.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, surface: &CaptureSurface, options: &ImageOptions) -> Result<String, CameraError>;

    /// Load an image reference previously produced by [`ImageEncoder::encode`].
    fn decode(&self, url: &str) -> Result<RgbImage, CameraError>;

    /// Release an object URL. Returns false for unknown or inline references.
    fn revoke(&self, url: &str) -> bool;
}

#[derive(Debug, Clone)]
struct StoredImage {
    mime: &'static str,
    bytes: Vec<u8>,
}

/// Holds encoded images behind object URLs
#[derive(Debug, Default)]
pub struct ObjectUrlStore {
    images: Mutex<HashMap<String, StoredImage>>,
}

impl ObjectUrlStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredImage>> {
        self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, mime: &'static str, bytes: Vec<u8>) -> String {
        let url = format!("{}{}", OBJECT_URL_PREFIX, uuid::Uuid::new_v4());
        self.lock().insert(url.clone(), StoredImage { mime, bytes });
        url
    }

    pub fn resolve(&self, url: &str) -> Option<Vec<u8>> {
        self.lock().get(url).map(|image| image.bytes.clone())
    }

    pub fn mime(&self, url: &str) -> Option<&'static str> {
        self.lock().get(url).map(|image| image.mime)
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.lock().remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Encode RGB pixels as JPEG or PNG.
pub fn encode_bytes(image: &RgbImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, CameraError> {
    let mut buffer = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image.clone());
    let result = match format {
        ImageFormat::Jpeg => {
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
            dynamic.write_with_encoder(encoder)
        }
        ImageFormat::Png => {
            let encoder = image::codecs::png::PngEncoder::new(&mut buffer);
            dynamic.write_with_encoder(encoder)
        }
    };
    result.map_err(|e| CameraError::EncodingError(format!("Failed to encode {}: {}", format.mime(), e)))?;
    Ok(buffer)
}

/// Built-in encoder producing data URLs and object URLs.
#[derive(Debug, Clone, Default)]
pub struct UrlEncoder {
    store: Arc<ObjectUrlStore>,
}

impl UrlEncoder {
    pub fn new(store: Arc<ObjectUrlStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ObjectUrlStore> {
        &self.store
    }
}

impl ImageEncoder for UrlEncoder {
    fn encode(&self, surface: &CaptureSurface, options: &ImageOptions) -> Result<String, CameraError> {
        let bytes = encode_bytes(surface.image(), options.image_format, options.jpeg_quality)?;
        let mime = options.image_format.mime();
        log::debug!(
            "Encoded {}x{} {} ({} bytes)",
            surface.width(),
            surface.height(),
            mime,
            bytes.len()
        );
        Ok(match options.data_type {
            DataType::DataUrl => format!("data:{};base64,{}", mime, STANDARD.encode(&bytes)),
            DataType::ObjectUrl => self.store.insert(mime, bytes),
        })
    }

    fn decode(&self, url: &str) -> Result<RgbImage, CameraError> {
        let bytes = if let Some(rest) = url.strip_prefix("data:") {
            let (_, payload) = rest
                .split_once(";base64,")
                .ok_or_else(|| CameraError::EncodingError("data URL is not base64".to_string()))?;
            STANDARD
                .decode(payload)
                .map_err(|e| CameraError::EncodingError(format!("Invalid base64 payload: {}", e)))?
        } else if url.starts_with(OBJECT_URL_PREFIX) {
            self.store
                .resolve(url)
                .ok_or_else(|| CameraError::EncodingError(format!("Object URL {} revoked or unknown", url)))?
        } else {
            return Err(CameraError::EncodingError(format!(
                "Unsupported image reference: {}",
                url.chars().take(32).collect::<String>()
            )));
        };

        image::load_from_memory(&bytes)
            .map(|img| img.to_rgb8())
            .map_err(|e| CameraError::EncodingError(format!("Failed to decode image: {}", e)))
    }

    fn revoke(&self, url: &str) -> bool {
        self.store.revoke(url)
    }
}
