use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::db::query;
use crate::error::PipelineError;
use crate::models::{PhotoMatch, QueryMatch};
use crate::pipeline::detect::{crop, detect_faces};
use crate::pipeline::embed::embed_face;
use crate::pipeline::quality;
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<PhotoMatch>,
}

pub fn photo_url(public_base_url: &str, image_id: i64) -> String {
    format!("{}/photos/{}", public_base_url.trim_end_matches('/'), image_id)
}

/// One row per photo at its best distance, closest first.
pub fn group_by_photo(matches: Vec<QueryMatch>, max_distance: f32, public_base_url: &str) -> Vec<PhotoMatch> {
    let mut best: HashMap<i64, QueryMatch> = HashMap::new();
    for m in matches.into_iter().filter(|m| m.distance <= max_distance) {
        match best.get(&m.entry.image_id) {
            Some(prev) if prev.distance <= m.distance => {}
            _ => {
                best.insert(m.entry.image_id, m);
            }
        }
    }
    let mut photos: Vec<PhotoMatch> = best
        .into_values()
        .map(|m| PhotoMatch {
            image_id: m.entry.image_id,
            face_id: m.entry.face_id,
            distance: m.distance,
            url: photo_url(public_base_url, m.entry.image_id),
        })
        .collect();
    photos.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.image_id.cmp(&b.image_id)));
    photos
}

/// Finds the photos of `event_id` that contain the person in `selfie`.
/// Blocking; callers run it off the async runtime.
pub fn search_by_selfie(state: &AppState, event_id: &str, selfie: &[u8]) -> Result<SearchResponse, PipelineError> {
    {
        let conn = state.pool.get()?;
        if !query::event_exists(&conn, event_id)? {
            return Err(PipelineError::not_found("event", event_id));
        }
    }
    if selfie.is_empty() {
        return Err(PipelineError::Validation("selfie is empty".into()));
    }

    let image = image::load_from_memory(selfie)
        .map_err(|e| PipelineError::Validation(format!("selfie could not be decoded: {e}")))?
        .to_rgb8();
    let faces = detect_faces(state.models.detector.as_ref(), &image, &state.policy(), state.cfg.max_dimension)?;
    let face = faces
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .ok_or_else(|| PipelineError::Validation("No face detected in the selfie".into()))?;

    let face_crop = crop(&image, &face.bbox);
    let report = quality::check_face(&face_crop);
    if !report.is_valid() {
        return Err(PipelineError::Validation(format!("Selfie quality too low: {}", report.issues.join(", "))));
    }

    let probe = embed_face(state.models.embedder.as_ref(), &face_crop)
        .map_err(|e| PipelineError::Validation(format!("selfie could not be embedded: {e}")))?;
    let matches = state.index.query(event_id, &probe, state.cfg.search_k)?;
    let considered = matches.len();
    let results = group_by_photo(matches, state.cfg.search_max_distance, &state.cfg.public_base_url);
    state.stats.inc_queries();
    debug!(event_id, considered, photos = results.len(), "selfie search");
    Ok(SearchResponse { results })
}
