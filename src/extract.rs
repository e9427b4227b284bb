use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use facematch_vision::Pipeline;
use image::DynamicImage;
use tokio::sync::Semaphore;

use crate::config::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("no face detected in image")]
    NoFace,

    #[error("face model failed: {0:#}")]
    Model(anyhow::Error),

    #[error("embedding extraction exceeded {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// Anything that turns one decoded image into one face embedding.
///
/// Implementations are called from blocking worker threads and may block.
pub trait Embedder: Send + Sync + 'static {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, ExtractError>;
}

/// [`Embedder`] backed by the YuNet + SFace pipeline. Inference is serialized
/// through a mutex since ONNX sessions need exclusive access to run.
pub struct FaceEmbedder {
    pipeline: Mutex<Pipeline>,
}

impl FaceEmbedder {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Mutex::new(pipeline),
        }
    }

    pub fn load(models: &ModelConfig) -> anyhow::Result<Self> {
        let pipeline = Pipeline::load(&models.detector, &models.recognizer, models.pipeline_options())
            .context("Failed to initialize face recognition pipeline")?;
        Ok(Self::new(pipeline))
    }
}

impl Embedder for FaceEmbedder {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, ExtractError> {
        let mut pipeline = self
            .pipeline
            .lock()
            .map_err(|_| ExtractError::Worker("face pipeline lock poisoned".to_string()))?;
        match pipeline.embed(image).map_err(ExtractError::Model)? {
            Some(embedding) => Ok(embedding.into_vec()),
            None => Err(ExtractError::NoFace),
        }
    }
}

/// Decode any format the `image` crate recognizes into an RGB raster.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ExtractError> {
    let img = image::load_from_memory(bytes)?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

/// Runs an [`Embedder`] on the blocking pool, one image at a time.
///
/// A request first waits for the single inference permit, then hands the
/// permit to its blocking worker. The whole sequence runs under the caller's
/// budget, so a request that times out while waiting never takes a blocking
/// thread. A worker that is already running cannot be interrupted; it keeps
/// the permit until the model returns and its result is discarded.
#[derive(Clone)]
pub struct Extractor {
    embedder: Arc<dyn Embedder>,
    permits: Arc<Semaphore>,
}

impl Extractor {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Decode `bytes` and embed the first face, giving up after `budget`.
    pub async fn extract(&self, bytes: Bytes, budget: Duration) -> Result<Vec<f32>, ExtractError> {
        match tokio::time::timeout(budget, self.run(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Timeout(budget)),
        }
    }

    async fn run(&self, bytes: Bytes) -> Result<Vec<f32>, ExtractError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ExtractError::Worker(e.to_string()))?;
        let embedder = self.embedder.clone();

        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let img = decode_image(&bytes)?;
            log::debug!("decoded {}x{} image", img.width(), img.height());
            embedder.embed(&img)
        });

        match work.await {
            Ok(result) => result,
            Err(join_err) => Err(ExtractError::Worker(join_err.to_string())),
        }
    }
}
