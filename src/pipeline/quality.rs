use image::RgbImage;
use serde::Serialize;

pub const BLUR_THRESHOLD: f64 = 100.0;
pub const DARKNESS_THRESHOLD: f64 = 40.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub blur_score: f64,
    pub brightness: f64,
    pub issues: Vec<String>,
}

impl QualityReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Variance of the 3x3 Laplacian over the grayscale crop. Low means soft.
pub fn blur_score(crop: &RgbImage) -> f64 {
    let gray = image::imageops::grayscale(crop);
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Mean HSV value channel, i.e. the mean of max(r, g, b).
pub fn brightness(crop: &RgbImage) -> f64 {
    let n = (crop.width() as u64 * crop.height() as u64).max(1) as f64;
    crop.pixels().map(|p| p[0].max(p[1]).max(p[2]) as f64).sum::<f64>() / n
}

pub fn check_face(crop: &RgbImage) -> QualityReport {
    let blur = blur_score(crop);
    let light = brightness(crop);
    let mut issues = Vec::new();
    if blur < BLUR_THRESHOLD {
        issues.push(format!("Too Blurry (Score: {blur:.1} < {BLUR_THRESHOLD})"));
    }
    if light < DARKNESS_THRESHOLD {
        issues.push(format!("Too Dark (Brightness: {light:.1} < {DARKNESS_THRESHOLD})"));
    }
    QualityReport { blur_score: blur, brightness: light, issues }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn flat_crop_is_blurry() {
        let report = check_face(&RgbImage::from_pixel(50, 50, Rgb([150, 150, 150])));
        assert_eq!(report.blur_score, 0.0);
        assert!(!report.is_valid());
        assert!(report.issues[0].starts_with("Too Blurry"));
    }

    #[test]
    fn dark_crop_is_flagged() {
        let img = RgbImage::from_fn(40, 40, |x, y| if (x + y) % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([30, 30, 30]) });
        let report = check_face(&img);
        assert!(report.blur_score > BLUR_THRESHOLD);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].starts_with("Too Dark"));
    }

    #[test]
    fn sharp_bright_crop_passes() {
        let img = RgbImage::from_fn(40, 40, |x, _| if x % 4 < 2 { Rgb([240, 200, 180]) } else { Rgb([60, 40, 30]) });
        assert!(check_face(&img).is_valid());
    }
}
