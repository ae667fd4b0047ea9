#![allow(dead_code)]

use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use nazr_faces::models::{BatchStatus, Caller, Event, Role};
use nazr_faces::pipeline::gateway::UploadFile;
use nazr_faces::utils::config::Config;
use nazr_faces::AppState;

pub const BASE_URL: &str = "http://gallery.test";

const BACKGROUND: Rgb<u8> = Rgb([30, 60, 200]);
const SKIN: Rgb<u8> = Rgb([224, 172, 140]);
const EYE: Rgb<u8> = Rgb([40, 30, 30]);

/// Small pools and fast retries so tests finish quickly.
pub fn test_config(dir: &Path) -> Config {
    let mut cfg = Config::default().with_data_dir(dir);
    cfg.public_base_url = BASE_URL.to_string();
    cfg.detect_threads = 2;
    cfg.embed_threads = 2;
    cfg.index_threads = 1;
    cfg.queue_capacity = 64;
    cfg.index_backoff_ms = 1;
    cfg
}

pub async fn start(dir: &Path) -> Arc<AppState> {
    AppState::start(test_config(dir)).await.expect("pipeline starts")
}

pub fn photographer() -> Caller {
    Caller::new("p1", Role::Photographer)
}

pub fn other_photographer() -> Caller {
    Caller::new("p2", Role::Photographer)
}

pub fn admin() -> Caller {
    Caller::new("root", Role::Admin)
}

pub fn attendee() -> Caller {
    Caller::new("guest", Role::Attendee)
}

pub async fn create_event(state: &AppState, name: &str) -> Event {
    state.create_event(&photographer(), name).await.expect("event created")
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("png encodes");
    out.into_inner()
}

fn in_disc(x: u32, y: u32, cx: f32, cy: f32, r: f32) -> bool {
    let dx = x as f32 + 0.5 - cx;
    let dy = y as f32 + 0.5 - cy;
    dx * dx + dy * dy <= r * r
}

/// 200x200 portrait: one skin-toned ellipse with two dark eyes whose
/// spacing and height depend on `seed`.
pub fn face_rgb(seed: u32) -> RgbImage {
    let spread = 12.0 + (seed % 5) as f32 * 2.0;
    let eye_y = 86.0 + (seed % 3) as f32 * 3.0;
    RgbImage::from_fn(200, 200, |x, y| {
        let dx = (x as f32 + 0.5 - 100.0) / 40.0;
        let dy = (y as f32 + 0.5 - 100.0) / 52.0;
        if dx * dx + dy * dy > 1.0 {
            BACKGROUND
        } else if in_disc(x, y, 100.0 - spread, eye_y, 5.0) || in_disc(x, y, 100.0 + spread, eye_y, 5.0) {
            EYE
        } else {
            SKIN
        }
    })
}

pub fn face_png(seed: u32) -> Vec<u8> {
    encode_png(&face_rgb(seed))
}

/// Valid image with nothing face-like in it.
pub fn blank_png() -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(200, 200, BACKGROUND))
}

/// A PNG whose header is intact but whose pixel data is cut off.
pub fn truncated_png() -> Vec<u8> {
    let mut state = 0x2545_f491u32;
    let noisy = RgbImage::from_fn(200, 200, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let b = state.to_le_bytes();
        Rgb([b[0], b[1], b[2]])
    });
    let mut bytes = encode_png(&noisy);
    bytes.truncate(bytes.len() / 2);
    bytes
}

pub fn uploads(blobs: Vec<Vec<u8>>) -> Vec<UploadFile> {
    blobs
        .into_iter()
        .enumerate()
        .map(|(i, b)| UploadFile::new(format!("img_{i:03}.png"), b))
        .collect()
}

/// Polls until the batch reaches a terminal stage.
pub async fn wait_terminal(state: &AppState, batch_id: i64) -> BatchStatus {
    for _ in 0..600 {
        let status = state.status(batch_id).await.expect("status");
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("batch {batch_id} did not finish in time");
}

/// Serves the router on an ephemeral port and returns it.
pub async fn serve(state: Arc<AppState>) -> u16 {
    let app = nazr_faces::api::routes::router(state);
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Counts regular files below `dir`.
pub fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}
