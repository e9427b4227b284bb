use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::face::{self, Detection, Embedding, FACE_SIZE};

/// Knobs for the detect → align → encode pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    /// Minimum detector confidence for a face to count.
    pub score_threshold: f32,
    /// IoU above which overlapping detections are suppressed; `>= 1.0` disables NMS.
    pub nms_threshold: f32,
    /// Scale embeddings to unit length.
    pub normalize: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            nms_threshold: 0.3,
            normalize: false,
        }
    }
}

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    detector: Session,
    encoder: Session,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn load(detector: &Path, recognizer: &Path, options: PipelineOptions) -> Result<Self> {
        Ok(Self {
            detector: crate::model::detector_session(detector)?,
            encoder: crate::model::recog_session(recognizer)?,
            options,
        })
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Detect faces and encode the first one (highest detector score).
    /// Returns `Ok(None)` when the image contains no face.
    pub fn process_image(&mut self, img: &DynamicImage) -> Result<Option<(Detection, Embedding)>> {
        let detections = face::detect_faces(
            &mut self.detector,
            img,
            self.options.score_threshold,
            self.options.nms_threshold,
        )
        .context("detecting faces")?;

        let Some(first) = detections.into_iter().next() else {
            return Ok(None);
        };
        log::debug!("encoding face with score {:.3}", first.score);

        let face_img = face::align_face(img, &first, FACE_SIZE).context("aligning face")?;
        let embedding = face::encode_face(&mut self.encoder, &face_img, self.options.normalize)
            .context("encoding face")?;

        Ok(Some((first, embedding)))
    }

    /// Process and return only embedding (convenience method)
    pub fn embed(&mut self, img: &DynamicImage) -> Result<Option<Embedding>> {
        Ok(self.process_image(img)?.map(|(_, embedding)| embedding))
    }
}
