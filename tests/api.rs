mod common;

use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;

use common::*;

struct Api {
    base: String,
    client: reqwest::Client,
}

impl Api {
    async fn start(tmp: &TempDir) -> (Self, std::sync::Arc<nazr_faces::AppState>) {
        let state = common::start(tmp.path()).await;
        let port = serve(state.clone()).await;
        (Self { base: format!("http://127.0.0.1:{port}"), client: reqwest::Client::new() }, state)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn as_user(&self, req: reqwest::RequestBuilder, user: &str, role: &str) -> reqwest::RequestBuilder {
        req.header("x-user-id", user).header("x-user-role", role)
    }

    async fn create_event(&self, name: &str) -> Value {
        let resp = self
            .as_user(self.client.post(self.url("/events")), "p1", "photographer")
            .json(&json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    async fn upload(&self, event_id: &str, blobs: Vec<Vec<u8>>) -> reqwest::Response {
        let mut form = Form::new();
        for (i, blob) in blobs.into_iter().enumerate() {
            let part = Part::bytes(blob).file_name(format!("shot_{i}.png")).mime_str("image/png").unwrap();
            form = form.part("files", part);
        }
        self.as_user(self.client.post(self.url(&format!("/events/{event_id}/batches"))), "p1", "photographer")
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn wait_complete(&self, batch_id: i64) -> Value {
        for _ in 0..600 {
            let body: Value = self.client.get(self.url(&format!("/batches/{batch_id}"))).send().await.unwrap().json().await.unwrap();
            if body["stage"] == "complete" || body["stage"] == "cancelled" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("batch {batch_id} did not finish");
    }
}

#[tokio::test]
async fn health_stats_and_metrics() {
    let tmp = TempDir::new().unwrap();
    let (api, _state) = Api::start(&tmp).await;

    let body: Value = api.client.get(api.url("/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());

    let body: Value = api.client.get(api.url("/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["queues"]["detect"], 0);
    assert_eq!(body["indexed_faces"], 0);

    let resp = api.client.get(api.url("/metrics")).send().await.unwrap();
    assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
    let text = resp.text().await.unwrap();
    assert!(text.contains("nazr_queue_detect 0"));
    assert!(text.contains("nazr_indexed_faces 0"));
}

#[tokio::test]
async fn identity_headers_gate_event_management() {
    let tmp = TempDir::new().unwrap();
    let (api, _state) = Api::start(&tmp).await;

    let resp = api.client.post(api.url("/events")).json(&json!({ "name": "Anon" })).send().await.unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "AUTHORIZATION_ERROR");

    let resp = api
        .as_user(api.client.post(api.url("/events")), "p1", "superuser")
        .json(&json!({ "name": "Bad Role" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = api
        .client
        .post(api.url("/events"))
        .header("x-user-id", "guest")
        .json(&json!({ "name": "Guest Event" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let event = api.create_event("Beach Day").await;
    assert_eq!(event["event_id"], "beach-day");
    assert_eq!(event["share_link"], format!("{BASE_URL}/event/p1/beach-day"));

    let listed: Value = api
        .as_user(api.client.get(api.url("/events")), "p1", "photographer")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["events"].as_array().unwrap().len(), 1);

    let listed: Value = api
        .as_user(api.client.get(api.url("/events")), "p2", "photographer")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed["events"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn upload_track_search_and_serve_photos() {
    let tmp = TempDir::new().unwrap();
    let (api, state) = Api::start(&tmp).await;
    let event = api.create_event("Company Retreat").await;
    let event_id = event["event_id"].as_str().unwrap().to_string();

    let resp = api.upload(&event_id, vec![face_png(1), face_png(2), blank_png()]).await;
    assert_eq!(resp.status(), 202);
    let handle: Value = resp.json().await.unwrap();
    let batch_id = handle["batch_id"].as_i64().unwrap();

    let status = api.wait_complete(batch_id).await;
    assert_eq!(status["stage"], "complete");
    assert_eq!(status["counts"]["images_total"], 3);
    assert_eq!(status["counts"]["faces_detected"], 2);
    assert_eq!(status["partial_failure"], false);
    assert_eq!(status["gallery_link"], format!("{BASE_URL}/gallery/{event_id}/{batch_id}"));

    // A finished batch streams its terminal snapshot and closes.
    let resp = api.client.get(api.url(&format!("/batches/{batch_id}/stream"))).send().await.unwrap();
    assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/event-stream"));
    let stream = tokio::time::timeout(Duration::from_secs(10), resp.text()).await.unwrap().unwrap();
    assert!(stream.contains("event: status"));
    assert!(stream.contains("\"stage\":\"complete\""));

    let selfie = Part::bytes(face_png(2)).file_name("me.png").mime_str("image/png").unwrap();
    let resp = api
        .client
        .post(api.url(&format!("/events/{event_id}/search")))
        .multipart(Form::new().part("selfie", selfie))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let found: Value = resp.json().await.unwrap();
    let best = &found["results"][0];
    let image_id = best["image_id"].as_i64().unwrap();
    let expected = {
        let conn = state.pool.get().unwrap();
        nazr_faces::db::query::batch_images(&conn, batch_id).unwrap()[1].id
    };
    assert_eq!(image_id, expected);

    let resp = api.client.get(api.url(&format!("/photos/{image_id}"))).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert_eq!(resp.bytes().await.unwrap().to_vec(), face_png(2));

    let resp = api
        .client
        .post(api.url(&format!("/events/{event_id}/query")))
        .json(&json!({ "embedding": vec![0.1f32; 256], "k": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["matches"].as_array().unwrap().len(), 1);
    assert!(body["matches"][0].get("embedding").is_none());
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let tmp = TempDir::new().unwrap();
    let (api, _state) = Api::start(&tmp).await;
    let event = api.create_event("Errors").await;
    let event_id = event["event_id"].as_str().unwrap().to_string();

    let resp = api.client.get(api.url("/batches/777")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    let resp = api.client.get(api.url("/photos/777")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = api.upload(&event_id, vec![b"GIF89a nope".to_vec()]).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let resp = api.upload("no-such-event", vec![face_png(1)]).await;
    assert_eq!(resp.status(), 404);

    let resp = api
        .client
        .post(api.url(&format!("/events/{event_id}/query")))
        .json(&json!({ "embedding": [1.0, 2.0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = api.upload(&event_id, vec![face_png(1)]).await;
    let batch_id = resp.json::<Value>().await.unwrap()["batch_id"].as_i64().unwrap();
    let resp = api
        .as_user(api.client.post(api.url(&format!("/batches/{batch_id}/cancel"))), "p2", "photographer")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let resp = api
        .as_user(api.client.post(api.url(&format!("/batches/{batch_id}/cancel"))), "root", "admin")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["stage"] == "cancelled" || body["stage"] == "complete");
}
