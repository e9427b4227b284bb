//! YuNet detector post-processing.
//!
//! YuNet is anchor-free: every cell of the stride 8, 16 and 32 feature grids
//! predicts one candidate face. For each stride the network emits
//!
//! - cls: `[1, H*W, 1]` classification logits
//! - obj: `[1, H*W, 1]` objectness logits
//! - bbox: `[1, H*W, 4]` box deltas `(dx, dy, dw, dh)` in stride units
//! - kps: `[1, H*W, 10]` landmark deltas, five `(x, y)` points
//!
//! and a cell at grid `(row, col)` decodes as
//! `cx = (col + dx) * stride`, `w = dw * stride` (no exp), then everything is
//! normalized by the input size.

use anyhow::Result;
use ndarray::Array2;

const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized [0,1])
    pub score: f32,
    pub landmarks: [f32; 10], // x1,y1,...,x5,y5 (normalized [0,1])
}

/// Per-stride tensors after [`parse_yunet_outputs`].
#[derive(Debug, Clone)]
pub struct YunetHeads {
    pub scores: Vec<Array2<f32>>,
    pub bboxes: Vec<Array2<f32>>,
    pub landmarks: Vec<Array2<f32>>,
}

fn grid_cells(input_size: usize) -> [usize; 3] {
    STRIDES.map(|stride| (input_size / stride) * (input_size / stride))
}

/// Decode every grid cell scoring at least `score_threshold`.
pub fn decode_detections(
    heads: &YunetHeads,
    score_threshold: f32,
    input_size: usize,
) -> Result<Vec<RawDetection>> {
    let mut detections = Vec::new();
    let norm = input_size as f32;

    for (level, &stride) in STRIDES.iter().enumerate() {
        let scores = &heads.scores[level];
        let bboxes = &heads.bboxes[level];
        let landmarks = &heads.landmarks[level];

        let side = input_size / stride;
        if scores.nrows() != side * side {
            anyhow::bail!(
                "stride {} expects a {}x{} grid ({} cells), got {}",
                stride,
                side,
                side,
                side * side,
                scores.nrows()
            );
        }

        let step = stride as f32;
        for idx in 0..side * side {
            let score = scores[[idx, 0]];
            if score < score_threshold {
                continue;
            }
            let row = (idx / side) as f32;
            let col = (idx % side) as f32;

            let w = bboxes[[idx, 2]] * step / norm;
            let h = bboxes[[idx, 3]] * step / norm;
            let cx = (col + bboxes[[idx, 0]]) * step / norm;
            let cy = (row + bboxes[[idx, 1]]) * step / norm;

            let mut lms = [0.0f32; 10];
            for point in 0..5 {
                lms[point * 2] = (col + landmarks[[idx, point * 2]]) * step / norm;
                lms[point * 2 + 1] = (row + landmarks[[idx, point * 2 + 1]]) * step / norm;
            }

            detections.push(RawDetection {
                bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                score,
                landmarks: lms,
            });
        }
    }

    Ok(detections)
}

/// Copy `STRIDES.len()` consecutive outputs starting at `first` into
/// `[cells, width]` arrays, checking each tensor's shape on the way.
fn take_head(
    outputs: &[(&[i64], &[f32])],
    first: usize,
    width: usize,
    name: &str,
    cells: &[usize; 3],
) -> Result<Vec<Array2<f32>>> {
    cells
        .iter()
        .enumerate()
        .map(|(level, &count)| {
            let index = first + level;
            let Some((shape, data)) = outputs.get(index) else {
                anyhow::bail!("missing {} output at index {}", name, index);
            };
            let expected = [1, count as i64, width as i64];
            if *shape != expected {
                anyhow::bail!(
                    "unexpected {} shape at index {}: {:?}, expected {:?}",
                    name,
                    index,
                    shape,
                    expected
                );
            }
            Ok(Array2::from_shape_vec((count, width), data.to_vec())?)
        })
        .collect()
}

/// Split YuNet's twelve raw outputs into per-stride heads.
///
/// Output order is `cls_8, cls_16, cls_32, obj_8, obj_16, obj_32,
/// bbox_8, bbox_16, bbox_32, kps_8, kps_16, kps_32`. The returned scores are
/// the element-wise product of cls and obj, still as logits.
pub fn parse_yunet_outputs(outputs: &[(&[i64], &[f32])], input_size: usize) -> Result<YunetHeads> {
    let cells = grid_cells(input_size);

    let cls = take_head(outputs, 0, 1, "cls", &cells)?;
    let obj = take_head(outputs, 3, 1, "obj", &cells)?;
    let scores = cls.iter().zip(&obj).map(|(c, o)| c * o).collect();

    Ok(YunetHeads {
        scores,
        bboxes: take_head(outputs, 6, 4, "bbox", &cells)?,
        landmarks: take_head(outputs, 9, 10, "kps", &cells)?,
    })
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn apply_sigmoid_to_scores(scores: &mut [Array2<f32>]) {
    for score_map in scores {
        score_map.mapv_inplace(sigmoid);
    }
}
