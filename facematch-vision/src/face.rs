use crate::yunet;
use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

/// YuNet runs on a fixed 640x640 input.
pub const DETECTOR_INPUT: u32 = 640;
/// SFace consumes 112x112 aligned crops.
pub const FACE_SIZE: u32 = 112;

/// Detection result from YuNet, in source image pixels
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // left eye, right eye, nose, mouth left, mouth right
}

/// Face embedding (SFace output)
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.vector.to_vec()
    }
}

/// Pack an RGB raster into a `[1, 3, H, W]` tensor with planes in B, G, R
/// order and values in `[0, 255]`, which is what both OpenCV zoo models expect.
fn bgr_planar_tensor(rgb: &RgbImage) -> Result<Array4<f32>> {
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    let (blue, rest) = data.split_at_mut(plane);
    let (green, red) = rest.split_at_mut(plane);
    for (i, px) in rgb.pixels().enumerate() {
        red[i] = px[0] as f32;
        green[i] = px[1] as f32;
        blue[i] = px[2] as f32;
    }

    Ok(Array4::from_shape_vec(
        (1, 3, height as usize, width as usize),
        data,
    )?)
}

/// Letterbox placement of the source image on the square detector canvas.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = target as f32 / width.max(height) as f32;
        let new_w = (width as f32 * scale) as u32;
        let new_h = (height as f32 * scale) as u32;
        Self {
            scale,
            offset_x: ((target - new_w) / 2) as f32,
            offset_y: ((target - new_h) / 2) as f32,
        }
    }

    /// Map a normalized canvas coordinate back to source pixels.
    fn unmap_x(&self, x: f32) -> f32 {
        (x * DETECTOR_INPUT as f32 - self.offset_x) / self.scale
    }

    fn unmap_y(&self, y: f32) -> f32 {
        (y * DETECTOR_INPUT as f32 - self.offset_y) / self.scale
    }

    fn unmap_len(&self, len: f32) -> f32 {
        len * DETECTOR_INPUT as f32 / self.scale
    }
}

/// Detect faces with YuNet. Results are ordered by descending score.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        anyhow::bail!("image has no pixels");
    }

    // Pad to square so faces keep their aspect ratio
    let fit = Letterbox::fit(width, height, DETECTOR_INPUT);
    let resized = img.resize_exact(
        (width as f32 * fit.scale) as u32,
        (height as f32 * fit.scale) as u32,
        image::imageops::FilterType::Triangle,
    );
    let mut canvas = DynamicImage::new_rgb8(DETECTOR_INPUT, DETECTOR_INPUT);
    image::imageops::overlay(
        &mut canvas,
        &resized,
        fit.offset_x as i64,
        fit.offset_y as i64,
    );

    let input = Value::from_array(bgr_planar_tensor(&canvas.to_rgb8())?)?;
    let outputs = session.run(ort::inputs![input])?;

    let mut raw_outputs: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        raw_outputs.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let views: Vec<(&[i64], &[f32])> = raw_outputs
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let mut heads = yunet::parse_yunet_outputs(&views, DETECTOR_INPUT as usize)
        .context("parsing detector outputs")?;
    yunet::apply_sigmoid_to_scores(&mut heads.scores);
    let raw = yunet::decode_detections(&heads, score_threshold, DETECTOR_INPUT as usize)?;
    log::debug!("detector produced {} candidates", raw.len());

    Ok(to_source_detections(raw, fit, nms_threshold))
}

/// Map normalized canvas detections back to source pixels, then suppress
/// overlaps. A threshold of 1.0 or more disables NMS but still sorts by score.
fn to_source_detections(
    raw: Vec<yunet::RawDetection>,
    fit: Letterbox,
    nms_threshold: f32,
) -> Vec<Detection> {
    let mut detections: Vec<Detection> = raw
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for point in 0..5 {
                landmarks[point * 2] = fit.unmap_x(d.landmarks[point * 2]);
                landmarks[point * 2 + 1] = fit.unmap_y(d.landmarks[point * 2 + 1]);
            }
            Detection {
                bbox: [
                    fit.unmap_x(d.bbox[0]),
                    fit.unmap_y(d.bbox[1]),
                    fit.unmap_len(d.bbox[2]),
                    fit.unmap_len(d.bbox[3]),
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    if nms_threshold < 1.0 {
        detections = nms(&detections, nms_threshold);
    } else {
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    }
    detections
}

/// Greedy non-maximum suppression. The output is sorted by descending score.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Bilinear sample at a fractional source position.
fn sample_bilinear(img: &DynamicImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let corners = [
        (img.get_pixel(x0, y0), (1.0 - fx) * (1.0 - fy)),
        (img.get_pixel(x1, y0), fx * (1.0 - fy)),
        (img.get_pixel(x0, y1), (1.0 - fx) * fy),
        (img.get_pixel(x1, y1), fx * fy),
    ];
    let mut out = [0u8; 3];
    for (channel, value) in out.iter_mut().enumerate() {
        let acc: f32 = corners
            .iter()
            .map(|(px, weight)| px[channel] as f32 * weight)
            .sum();
        *value = acc.clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Rotate, scale and crop the face so the eyes land on the ArcFace reference
/// positions of a `size`x`size` crop.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    // Reference eyes for a 112x112 crop
    const REF_LEFT_EYE: (f32, f32) = (38.3, 51.7);
    const REF_RIGHT_EYE: (f32, f32) = (73.5, 51.5);

    let left = (detection.landmarks[0], detection.landmarks[1]);
    let right = (detection.landmarks[2], detection.landmarks[3]);
    let (dx, dy) = (right.0 - left.0, right.1 - left.1);
    let eye_dist = dx.hypot(dy);
    if eye_dist <= f32::EPSILON {
        anyhow::bail!("degenerate landmarks: eyes coincide");
    }

    let ref_dist = (REF_RIGHT_EYE.0 - REF_LEFT_EYE.0).hypot(REF_RIGHT_EYE.1 - REF_LEFT_EYE.1);
    let unit = size as f32 / FACE_SIZE as f32;
    let scale = unit * ref_dist / eye_dist;
    let angle = dy.atan2(dx);

    let src_center = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
    let dst_center = (
        (REF_LEFT_EYE.0 + REF_RIGHT_EYE.0) / 2.0 * unit,
        (REF_LEFT_EYE.1 + REF_RIGHT_EYE.1) / 2.0 * unit,
    );

    // Forward map: dst = M * src + t with M = scale * [cos sin; -sin cos]
    let (sin, cos) = angle.sin_cos();
    let (a, b, c, d) = (scale * cos, scale * sin, -scale * sin, scale * cos);
    let tx = dst_center.0 - (a * src_center.0 + b * src_center.1);
    let ty = dst_center.1 - (c * src_center.0 + d * src_center.1);
    let det = a * d - b * c;

    let (img_w, img_h) = img.dimensions();
    let mut output = RgbImage::new(size, size);
    for (out_x, out_y, pixel) in output.enumerate_pixels_mut() {
        let rx = out_x as f32 - tx;
        let ry = out_y as f32 - ty;
        let src_x = (d * rx - b * ry) / det;
        let src_y = (a * ry - c * rx) / det;

        // outside the source stays black
        if src_x >= 0.0 && src_x < img_w as f32 && src_y >= 0.0 && src_y < img_h as f32 {
            *pixel = sample_bilinear(img, src_x, src_y);
        }
    }

    Ok(DynamicImage::ImageRgb8(output))
}

/// Run SFace on an aligned crop. With `normalize` the vector is scaled to
/// unit L2 norm; otherwise the raw model output is returned.
pub fn encode_face(session: &mut Session, face_img: &DynamicImage, normalize: bool) -> Result<Embedding> {
    let face_rgb = face_img
        .resize_exact(FACE_SIZE, FACE_SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let input = Value::from_array(bgr_planar_tensor(&face_rgb)?)?;
    let outputs = session.run(ort::inputs![input])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
    embedding_from_output(&shape[..], data, normalize)
}

fn embedding_from_output(shape: &[i64], data: &[f32], normalize: bool) -> Result<Embedding> {
    // SFace emits [1, 128]
    let dim = match shape.len() {
        2 => shape[1].max(0) as usize,
        _ => data.len(),
    };
    if dim == 0 || dim > data.len() {
        anyhow::bail!("recognizer returned an unusable tensor of shape {:?}", shape);
    }
    let mut vector = Array1::from(data[..dim].to_vec());

    if normalize {
        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector /= norm;
        }
    }

    Ok(Embedding { vector })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f32; 4], score: f32) -> Detection {
        Detection {
            bbox,
            score,
            landmarks: [0.0; 10],
        }
    }

    #[test]
    fn test_iou() {
        let a = [10.0, 10.0, 20.0, 20.0];
        let b = [15.0, 15.0, 20.0, 20.0];
        let iou = compute_iou(&a, &b);
        assert!(iou > 0.0 && iou < 1.0);

        let c = [100.0, 100.0, 10.0, 10.0];
        assert_eq!(compute_iou(&a, &c), 0.0);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_best_of_each_cluster_in_score_order() {
        let detections = vec![
            detection([12.0, 12.0, 20.0, 20.0], 0.8),
            detection([10.0, 10.0, 20.0, 20.0], 0.9),
            detection([100.0, 100.0, 20.0, 20.0], 0.85),
        ];

        let result = nms(&detections, 0.3);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
        assert_eq!(result[1].score, 0.85);
    }

    #[test]
    fn nms_on_empty_input() {
        assert!(nms(&[], 0.3).is_empty());
    }

    #[test]
    fn planar_tensor_is_bgr() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));

        let tensor = bgr_planar_tensor(&img).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        assert_eq!(tensor[[0, 0, 0, 0]], 30.0);
        assert_eq!(tensor[[0, 1, 0, 1]], 50.0);
        assert_eq!(tensor[[0, 2, 0, 1]], 40.0);
    }

    #[test]
    fn letterbox_round_trips_canvas_coordinates() {
        let fit = Letterbox::fit(1280, 640, DETECTOR_INPUT);
        assert_eq!(fit.scale, 0.5);
        assert_eq!(fit.offset_x, 0.0);
        assert_eq!(fit.offset_y, 160.0);
        // canvas centre maps to source centre
        assert!((fit.unmap_x(0.5) - 640.0).abs() < 1e-3);
        assert!((fit.unmap_y(0.5) - 320.0).abs() < 1e-3);
    }

    #[test]
    fn aligned_crop_has_requested_size() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([120, 80, 40])));
        let mut det = detection([50.0, 50.0, 100.0, 100.0], 0.9);
        det.landmarks[..4].copy_from_slice(&[80.0, 90.0, 120.0, 90.0]);

        let crop = align_face(&img, &det, FACE_SIZE).unwrap().to_rgb8();
        assert_eq!(crop.dimensions(), (FACE_SIZE, FACE_SIZE));
        // the eye midpoint lies inside the uniform source, so it keeps its colour
        let px = crop.get_pixel(56, 52);
        assert!((px[0] as i32 - 120).abs() <= 1);
    }

    fn raw(bbox: [f32; 4], score: f32) -> yunet::RawDetection {
        yunet::RawDetection {
            bbox,
            score,
            landmarks: [0.5; 10],
        }
    }

    #[test]
    fn canvas_detections_map_to_source_in_score_order() {
        // 1280x640 source: half scale, 160px bars above and below
        let fit = Letterbox::fit(1280, 640, DETECTOR_INPUT);
        let raws = vec![
            raw([0.25, 0.25, 0.125, 0.125], 0.7),
            raw([0.5, 0.5, 0.125, 0.125], 0.95),
            raw([0.26, 0.26, 0.125, 0.125], 0.8),
        ];

        let dets = to_source_detections(raws, fit, 0.3);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].score, 0.95);
        assert_eq!(dets[1].score, 0.8);

        let [x, y, w, h] = dets[0].bbox;
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 320.0).abs() < 1e-3);
        assert!((w - 160.0).abs() < 1e-3);
        assert!((h - 160.0).abs() < 1e-3);
        assert!((dets[0].landmarks[0] - 640.0).abs() < 1e-3);
        assert!((dets[0].landmarks[1] - 320.0).abs() < 1e-3);
    }

    #[test]
    fn nms_threshold_of_one_only_sorts() {
        let fit = Letterbox::fit(640, 640, DETECTOR_INPUT);
        let raws = vec![
            raw([0.1, 0.1, 0.2, 0.2], 0.6),
            raw([0.1, 0.1, 0.2, 0.2], 0.9),
        ];
        let dets = to_source_detections(raws, fit, 1.0);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].score, 0.9);
    }

    #[test]
    fn embedding_takes_row_of_rank_two_output() {
        let emb = embedding_from_output(&[1, 3], &[3.0, 0.0, 4.0], false).unwrap();
        assert_eq!(emb.into_vec(), vec![3.0, 0.0, 4.0]);

        // only the first row of a batch is used
        let emb = embedding_from_output(&[2, 2], &[1.0, 2.0, 3.0, 4.0], false).unwrap();
        assert_eq!(emb.dim(), 2);
        assert_eq!(emb.into_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn embedding_from_flat_output_uses_everything() {
        let emb = embedding_from_output(&[4], &[1.0, 2.0, 3.0, 4.0], false).unwrap();
        assert_eq!(emb.dim(), 4);
    }

    #[test]
    fn embedding_normalization() {
        let emb = embedding_from_output(&[1, 3], &[3.0, 0.0, 4.0], true).unwrap();
        let v = emb.into_vec();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[2] - 0.8).abs() < 1e-6);

        // a zero vector is left alone instead of dividing by zero
        let zero = embedding_from_output(&[1, 2], &[0.0, 0.0], true).unwrap();
        assert_eq!(zero.into_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn unusable_recognizer_output_is_rejected() {
        assert!(embedding_from_output(&[1, 0], &[], false).is_err());
        assert!(embedding_from_output(&[0], &[], false).is_err());
        assert!(embedding_from_output(&[1, 8], &[1.0, 2.0], false).is_err());
    }

    #[test]
    fn align_rejects_coincident_eyes() {
        let img = DynamicImage::new_rgb8(10, 10);
        let det = detection([0.0, 0.0, 10.0, 10.0], 0.9);
        assert!(align_face(&img, &det, FACE_SIZE).is_err());
    }
}
