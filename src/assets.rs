use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::ModelConfig;

/// YuNet release in the OpenCV model zoo.
pub const DETECTOR_URL: &str = "https://github.com/opencv/opencv_zoo/raw/main/models/face_detection_yunet/face_detection_yunet_2023mar.onnx";
/// SFace release in the OpenCV model zoo.
pub const RECOGNIZER_URL: &str = "https://github.com/opencv/opencv_zoo/raw/main/models/face_recognition_sface/face_recognition_sface_2021dec.onnx";

/// Make sure both ONNX files exist locally, downloading the ones that are
/// missing from their configured URLs.
pub async fn ensure_models(models: &ModelConfig) -> Result<()> {
    ensure_local_file(&models.detector, models.detector_url.as_deref(), "detector").await?;
    ensure_local_file(&models.recognizer, models.recognizer_url.as_deref(), "recognizer").await?;
    Ok(())
}

/// Returns `target` if it already exists, otherwise downloads `remote_url` into it.
pub async fn ensure_local_file(target: &Path, remote_url: Option<&str>, what: &str) -> Result<PathBuf> {
    if target.exists() {
        log::debug!("{} model present at {}", what, target.display());
        return Ok(target.to_path_buf());
    }

    let Some(url) = remote_url else {
        anyhow::bail!(
            "{} model not found at {} and no download URL is configured",
            what,
            target.display()
        );
    };

    log::info!("Downloading {} model from {}", what, url);
    download_to_path(target, url)
        .await
        .with_context(|| format!("fetching {} model into {}", what, target.display()))?;
    Ok(target.to_path_buf())
}

/// Download `url` next to `target` and rename it into place, so an
/// interrupted transfer never leaves a truncated model behind.
async fn download_to_path(target: &Path, url: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("unexpected status {} while fetching {}", status, url);
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        anyhow::bail!("{} returned an empty body", url);
    }

    let partial = target.with_extension("part");
    fs::write(&partial, &bytes).with_context(|| format!("writing {}", partial.display()))?;
    fs::rename(&partial, target).with_context(|| format!("moving model to {}", target.display()))?;
    log::info!("Saved {} bytes to {}", bytes.len(), target.display());
    Ok(())
}
