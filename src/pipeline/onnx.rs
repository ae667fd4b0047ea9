//! SCRFD detector and ArcFace embedder on ONNX Runtime.

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

use crate::models::{BoundingBox, FaceCandidate};
use crate::pipeline::detect::FaceDetector;
use crate::pipeline::embed::FaceEmbedder;

pub const SCRFD_VERSION: &str = "scrfd-500m-bnkps";
pub const ARCFACE_VERSION: &str = "arcface-w600k-r50";
pub const ARCFACE_DIM: usize = 512;

const SCRFD_FILE: &str = "scrfd_500m_bnkps.onnx";
const ARCFACE_FILE: &str = "w600k_r50.onnx";
const SCRFD_SIDE: u32 = 640;
const ARCFACE_SIDE: u32 = 112;
const STRIDES: [u32; 3] = [8, 16, 32];

fn load_session(models_dir: &Path, file: &str) -> Result<Mutex<Session>> {
    let path = models_dir.join(file);
    if !path.exists() {
        bail!("face model missing; expected {}", path.display());
    }
    let session = Session::builder()?
        .commit_from_file(&path)
        .with_context(|| format!("failed to create session for {}", path.display()))?;
    info!(model = %path.display(), "face model loaded");
    Ok(Mutex::new(session))
}

/// NCHW planes normalised to roughly [-1, 1]. InsightFace detectors want
/// BGR, the recogniser RGB.
fn to_planes(rgb: &RgbImage, bgr: bool) -> Vec<f32> {
    let (w, h) = rgb.dimensions();
    let mut data = Vec::with_capacity(3 * (w * h) as usize);
    for c in 0..3usize {
        let channel = if bgr { 2 - c } else { c };
        for y in 0..h {
            for x in 0..w {
                data.push((rgb.get_pixel(x, y)[channel] as f32 - 127.5) / 128.0);
            }
        }
    }
    data
}

pub struct ScrfdDetector {
    session: Mutex<Session>,
}

impl ScrfdDetector {
    pub fn load(models_dir: &Path) -> Result<Self> {
        Ok(Self { session: load_session(models_dir, SCRFD_FILE)? })
    }
}

impl FaceDetector for ScrfdDetector {
    fn model_version(&self) -> &str {
        SCRFD_VERSION
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceCandidate>> {
        let (ow, oh) = image.dimensions();
        let scale = SCRFD_SIDE as f32 / ow.max(oh) as f32;
        let nw = ((ow as f32 * scale) as u32).max(1);
        let nh = ((oh as f32 * scale) as u32).max(1);
        let resized = imageops::resize(image, nw, nh, FilterType::Triangle);
        let mut padded = RgbImage::new(SCRFD_SIDE, SCRFD_SIDE);
        imageops::overlay(&mut padded, &resized, 0, 0);
        let data = to_planes(&padded, true);

        let mut session = self.session.lock();
        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((vec![1i64, 3, SCRFD_SIDE as i64, SCRFD_SIDE as i64], data))
            .context("failed to create SCRFD input tensor")?;
        let outputs = session.run(ort::inputs![input_name => input]).context("SCRFD inference failed")?;

        let mut out = Vec::new();
        for stride in STRIDES {
            let (Some(sv), Some(bv)) = (outputs.get(&format!("score_{stride}")), outputs.get(&format!("bbox_{stride}"))) else {
                debug!(stride, "SCRFD output for stride missing");
                continue;
            };
            let (_, scores) = sv.try_extract_tensor::<f32>().context("SCRFD scores")?;
            let (_, boxes) = bv.try_extract_tensor::<f32>().context("SCRFD boxes")?;
            let side = (SCRFD_SIDE / stride) as usize;
            let points = side * side;
            if scores.len() % points != 0 || boxes.len() < scores.len() * 4 {
                bail!("SCRFD stride {stride}: unexpected output sizes {} / {}", scores.len(), boxes.len());
            }
            let anchors = scores.len() / points;
            let s = stride as f32;
            for i in 0..points {
                let cy = (i / side) as f32 * s;
                let cx = (i % side) as f32 * s;
                for a in 0..anchors {
                    let idx = i * anchors + a;
                    let confidence = scores[idx];
                    if !confidence.is_finite() || confidence <= 0.0 {
                        continue;
                    }
                    let b = idx * 4;
                    let x1 = ((cx - boxes[b] * s) / scale).max(0.0);
                    let y1 = ((cy - boxes[b + 1] * s) / scale).max(0.0);
                    let x2 = (cx + boxes[b + 2] * s) / scale;
                    let y2 = (cy + boxes[b + 3] * s) / scale;
                    if x2 <= x1 || y2 <= y1 {
                        continue;
                    }
                    let bbox = BoundingBox {
                        x: x1 as u32,
                        y: y1 as u32,
                        w: (x2 - x1).ceil() as u32,
                        h: (y2 - y1).ceil() as u32,
                    };
                    if let Some(bbox) = bbox.clamp(ow, oh) {
                        out.push(FaceCandidate { bbox, confidence });
                    }
                }
            }
        }
        Ok(out)
    }
}

pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl ArcFaceEmbedder {
    pub fn load(models_dir: &Path) -> Result<Self> {
        Ok(Self { session: load_session(models_dir, ARCFACE_FILE)? })
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn model_version(&self) -> &str {
        ARCFACE_VERSION
    }

    fn dimension(&self) -> usize {
        ARCFACE_DIM
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let resized = imageops::resize(crop, ARCFACE_SIDE, ARCFACE_SIDE, FilterType::Triangle);
        let data = to_planes(&resized, false);

        let mut session = self.session.lock();
        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((vec![1i64, 3, ARCFACE_SIDE as i64, ARCFACE_SIDE as i64], data))
            .context("failed to create ArcFace input tensor")?;
        let outputs = session.run(ort::inputs![input_name => input]).context("ArcFace inference failed")?;

        let key = outputs
            .keys()
            .find(|k| matches!(*k, "output" | "embedding" | "fc1" | "features"))
            .or_else(|| outputs.keys().next())
            .map(str::to_string)
            .context("ArcFace produced no outputs")?;
        let value = outputs.get(&key).context("ArcFace output vanished")?;
        let (_, slice) = value.try_extract_tensor::<f32>().context("ArcFace output is not f32")?;
        let mut v = slice.to_vec();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= 0.0 {
            bail!("ArcFace embedding has zero norm");
        }
        v.iter_mut().for_each(|x| *x /= norm);
        Ok(v)
    }
}
