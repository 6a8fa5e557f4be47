//! The OCR model itself is an external collaborator, defined only by
//! interface: a function `ocr(path) -> result`. This module carries
//! the trait that interface becomes in Rust, a lazily-initialized
//! singleton wrapper around it, and a default implementation so the
//! service runs end-to-end without a real model binary wired in.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// The OCR model contract. Implementors run a (typically expensive)
/// recognition pass over an on-disk image and return the structured
/// result the renderer later consumes.
#[async_trait]
pub trait OcrModel: Send + Sync {
    async fn recognize(&self, path: &Path) -> Result<Value, OcrError>;
}

/// Errors surfaced by the OCR model.
///
/// `MalformedImage` is a fixed, user-facing message for any image a
/// model can't decode (animated GIF, truncated file, wrong container)
/// rather than surfacing a backend-specific error to the client.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Animation file, Corrupted file or Unsupported type")]
    MalformedImage,
    #[error("{0}")]
    Failed(String),
}

/// Minimal default model: validates the image signature and returns an
/// empty-but-well-formed result. It never actually recognizes text —
/// a production deployment swaps this for a real model behind the same
/// trait.
#[derive(Default)]
pub struct DefaultOcrModel;

#[async_trait]
impl OcrModel for DefaultOcrModel {
    async fn recognize(&self, path: &Path) -> Result<Value, OcrError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| OcrError::Failed(e.to_string()))?;

        let (width, height) = sniff_dimensions(&bytes)?;

        Ok(json!({
            "version": crate::VERSION,
            "img_width": width,
            "img_height": height,
            "blocks": [],
        }))
    }
}

/// Recognize enough of a handful of image container formats to tell
/// "plausible photo" from "animated GIF / truncated / not an image at
/// all", without pulling in a full image-decoding crate.
fn sniff_dimensions(bytes: &[u8]) -> Result<(u32, u32), OcrError> {
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Err(OcrError::MalformedImage);
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Ok((0, 0)); // JPEG: dimension parsing is the renderer's concern
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Ok((0, 0));
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Ok((0, 0));
    }
    Err(OcrError::MalformedImage)
}

/// Lazily-initialized, mutex-guarded OCR model singleton.
///
/// `tokio::sync::OnceCell::get_or_init` already does the
/// double-checked lookup this needs: the first caller pays the
/// initialization cost under an internal lock, every later caller reads
/// the cached value without locking. The factory is boxed so `AppState`
/// can hold one `ModelSingleton` regardless of which concrete
/// `OcrModel` backs it.
pub struct ModelSingleton {
    cell: OnceCell<Arc<dyn OcrModel>>,
    factory: Box<dyn Fn() -> Arc<dyn OcrModel> + Send + Sync>,
}

impl ModelSingleton {
    pub fn new(factory: impl Fn() -> Arc<dyn OcrModel> + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceCell::new(),
            factory: Box::new(factory),
        }
    }

    pub fn with_default_model() -> Self {
        Self::new(|| Arc::new(DefaultOcrModel))
    }

    pub async fn get(&self) -> Arc<dyn OcrModel> {
        self.cell.get_or_init(|| async { (self.factory)() }).await.clone()
    }

    /// Submitted as a no-op job at process start in production profiles
    /// so the first real request doesn't pay the load cost.
    pub async fn warm_up(&self) {
        let _ = self.get().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn recognizes_png_signature() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0],
        )
        .unwrap();

        let model = DefaultOcrModel;
        let result = model.recognize(file.path()).await.unwrap();
        assert_eq!(result["blocks"], json!([]));
    }

    #[tokio::test]
    async fn rejects_animated_gif_with_fixed_message() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"GIF89a....").unwrap();

        let model = DefaultOcrModel;
        let err = model.recognize(file.path()).await.unwrap_err();
        assert_eq!(err.to_string(), "Animation file, Corrupted file or Unsupported type");
    }

    #[tokio::test]
    async fn rejects_unrecognized_bytes() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not an image").unwrap();

        let model = DefaultOcrModel;
        assert!(matches!(
            model.recognize(file.path()).await,
            Err(OcrError::MalformedImage)
        ));
    }

    #[derive(Default)]
    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OcrModel for CountingModel {
        async fn recognize(&self, _path: &Path) -> Result<Value, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn singleton_initializes_exactly_once() {
        let init_count = Arc::new(AtomicUsize::new(0));
        let init_count_for_factory = init_count.clone();
        let singleton = ModelSingleton::new(move || {
            init_count_for_factory.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingModel::default()) as Arc<dyn OcrModel>
        });

        let a = singleton.get().await;
        let b = singleton.get().await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(init_count.load(Ordering::SeqCst), 1);
    }
}
