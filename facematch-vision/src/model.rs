use std::path::Path;

use anyhow::{Context, Result};
#[cfg(any(feature = "openvino", feature = "cuda"))]
use ort::ep::{self, ExecutionProvider};
use ort::session::{
    builder::{GraphOptimizationLevel, SessionBuilder},
    Session,
};

/// File name of the YuNet detector as published in the OpenCV model zoo.
pub const DETECTOR_FILE: &str = "face_detection_yunet_2023mar.onnx";
/// File name of the SFace recognizer as published in the OpenCV model zoo.
pub const RECOGNIZER_FILE: &str = "face_recognition_sface_2021dec.onnx";

pub fn session_builder() -> Result<SessionBuilder> {
    #[allow(unused_mut)]
    let mut builder =
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort::Error::<()>::from)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

fn load_session(path: &Path, what: &str) -> Result<Session> {
    if !path.is_file() {
        anyhow::bail!("{} model not found at {}", what, path.display());
    }
    log::debug!("loading {} model from {}", what, path.display());
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("load {} model {}", what, path.display()))
}

pub fn recog_session(path: &Path) -> Result<Session> {
    load_session(path, "recognition")
}

pub fn detector_session(path: &Path) -> Result<Session> {
    load_session(path, "detector")
}
