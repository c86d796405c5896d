use actix_web::{test, web, App};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use notesync::api::{self, AppState};
use notesync::auth::AuthService;
use notesync::ratelimit::RateLimiter;
use notesync::store::Store;
use notesync::sync::SyncEngine;

fn test_key_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| AuthService::generate_key_pem().unwrap())
}

fn test_state() -> (web::Data<AppState>, web::Data<Arc<AuthService>>) {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth = Arc::new(
        AuthService::from_private_pem(
            test_key_pem(),
            Duration::from_secs(15 * 60),
            Duration::from_secs(720 * 3600),
        )
        .unwrap(),
    );
    let state = web::Data::new(AppState {
        store: store.clone(),
        auth: auth.clone(),
        sync: SyncEngine::new(store),
        auth_limiter: Arc::new(RateLimiter::new(20, Duration::from_secs(60))),
        started_at: Instant::now(),
    });
    (state, web::Data::new(auth))
}

macro_rules! test_app {
    () => {{
        let (state, auth_data) = test_state();
        test::init_service(
            App::new()
                .app_data(state)
                .app_data(auth_data)
                .app_data(api::json_config())
                .configure(api::configure_routes),
        )
        .await
    }};
}

macro_rules! access_token {
    ($app:expr, $email:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/v1/auth/register")
            .set_json(json!({
                "email": $email,
                "password": "pass1234",
                "display_name": "Tester"
            }))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 201);

        let req = test::TestRequest::post()
            .uri("/api/v1/auth/login")
            .set_json(json!({
                "email": $email,
                "password": "pass1234",
                "device_id": "d1"
            }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&$app, req).await;
        resp["access_token"].as_str().unwrap().to_string()
    }};
}

macro_rules! create_note {
    ($app:expr, $token:expr, $title:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/v1/notes")
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json(json!({
                "title": $title,
                "content": "C",
                "type": "note",
                "device_id": "d1"
            }))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = test::read_body_json(resp).await;
        body
    }};
}

macro_rules! push {
    ($app:expr, $token:expr, $body:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/v1/sync/push")
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json($body)
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        body
    }};
}

macro_rules! pull {
    ($app:expr, $token:expr, $since:expr) => {{
        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/sync/changes?since={}", $since))
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        body
    }};
}

fn modified_at(record: &serde_json::Value) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(record["modified_at"].as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

/// A full note record as a client replica would push it back.
fn note_record(server_note: &serde_json::Value, modified_at: DateTime<Utc>) -> serde_json::Value {
    json!({
        "id": server_note["id"],
        "user_id": server_note["user_id"],
        "title": server_note["title"],
        "content": server_note["content"],
        "type": server_note["type"],
        "modified_at": modified_at.to_rfc3339(),
        "modified_by_device": "d2",
        "created_at": server_note["created_at"],
    })
}

// ==================== Pull ====================

#[actix_web::test]
async fn test_changes_requires_since() {
    let app = test_app!();
    let token = access_token!(app, "since@example.com");

    let req = test::TestRequest::get()
        .uri("/api/v1/sync/changes")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::get()
        .uri("/api/v1/sync/changes?since=yesterday")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_web::test]
async fn test_changes_from_zero_returns_everything() {
    let app = test_app!();
    let token = access_token!(app, "zero@example.com");

    create_note!(app, token, "first");
    let req = test::TestRequest::post()
        .uri("/api/v1/todos")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({"content": "a task", "device_id": "d1"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let delta = pull!(app, token, 0);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 1);
    assert_eq!(delta["todos"].as_array().unwrap().len(), 1);
    assert!(delta["sync_timestamp"].as_i64().unwrap() > 0);
}

#[actix_web::test]
async fn test_pull_cursor_is_strictly_greater_than() {
    let app = test_app!();
    let token = access_token!(app, "cursor@example.com");

    let note = create_note!(app, token, "edge");
    let ts = modified_at(&note).timestamp_millis();

    // Pulling from the record's own timestamp excludes it
    let delta = pull!(app, token, ts);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 0);

    // One millisecond earlier includes it, fields intact
    let delta = pull!(app, token, ts - 1);
    let pulled = &delta["notes"][0];
    assert_eq!(pulled["id"], note["id"]);
    assert_eq!(pulled["title"], "edge");
    assert_eq!(pulled["content"], "C");
    assert_eq!(pulled["modified_at"], note["modified_at"]);
}

#[actix_web::test]
async fn test_sync_cursor_round_trip() {
    let app = test_app!();
    let token = access_token!(app, "roundtrip@example.com");

    create_note!(app, token, "before");
    let delta = pull!(app, token, 0);
    let cursor = delta["sync_timestamp"].as_i64().unwrap();

    // Nothing new from the returned cursor
    let delta = pull!(app, token, cursor);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 0);

    // A push with a timestamp past the cursor shows up on the next pull
    let later = json!({
        "notes": [{
            "id": "client-made-id",
            "title": "after",
            "content": "written offline",
            "type": "note",
            "modified_at": (Utc::now() + ChronoDuration::seconds(2)).to_rfc3339(),
            "modified_by_device": "d2",
            "created_at": Utc::now().to_rfc3339(),
        }],
        "todos": [],
        "device_id": "d2"
    });
    let resp = push!(app, token, later);
    assert_eq!(resp["accepted"], 1);

    let delta = pull!(app, token, cursor);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 1);
    assert_eq!(delta["notes"][0]["title"], "after");
}

// ==================== Push / LWW ====================

#[actix_web::test]
async fn test_push_older_timestamp_loses() {
    let app = test_app!();
    let token = access_token!(app, "lww-lose@example.com");

    let note = create_note!(app, token, "T");
    let id = note["id"].as_str().unwrap().to_string();

    let mut stale = note_record(&note, modified_at(&note) - ChronoDuration::hours(1));
    stale["title"] = json!("Client");

    let resp = push!(app, token, json!({"notes": [stale], "todos": [], "device_id": "d2"}));
    assert_eq!(resp["accepted"], 0);
    assert_eq!(resp["conflicts"].as_array().unwrap().len(), 1);
    assert_eq!(resp["conflicts"][0]["type"], "note");
    assert_eq!(resp["conflicts"][0]["id"], id.as_str());
    assert_eq!(resp["conflicts"][0]["server_note"]["title"], "T");

    // The server copy is untouched
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/notes/{}", id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let fetched: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched["title"], "T");
}

#[actix_web::test]
async fn test_push_newer_timestamp_wins() {
    let app = test_app!();
    let token = access_token!(app, "lww-win@example.com");

    let note = create_note!(app, token, "T");
    let id = note["id"].as_str().unwrap().to_string();

    let mut fresh = note_record(&note, modified_at(&note) + ChronoDuration::hours(1));
    fresh["title"] = json!("Client Wins");

    let resp = push!(app, token, json!({"notes": [fresh], "todos": [], "device_id": "d2"}));
    assert_eq!(resp["accepted"], 1);
    assert!(resp["conflicts"].as_array().map(|c| c.is_empty()).unwrap_or(true));

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/notes/{}", id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let fetched: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched["title"], "Client Wins");
    assert_eq!(fetched["modified_by_device"], "d2");
}

#[actix_web::test]
async fn test_push_equal_timestamp_is_conflict() {
    let app = test_app!();
    let token = access_token!(app, "lww-tie@example.com");

    let note = create_note!(app, token, "T");
    let mut tied = note_record(&note, modified_at(&note));
    tied["title"] = json!("Same instant");

    let resp = push!(app, token, json!({"notes": [tied], "todos": [], "device_id": "d2"}));
    assert_eq!(resp["accepted"], 0);
    assert_eq!(resp["conflicts"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn test_push_replay_is_idempotent() {
    let app = test_app!();
    let token = access_token!(app, "replay@example.com");

    let batch = json!({
        "notes": [{
            "id": "offline-note-1",
            "title": "offline",
            "content": "synced later",
            "type": "note",
            "modified_at": Utc::now().to_rfc3339(),
            "modified_by_device": "d2",
            "created_at": Utc::now().to_rfc3339(),
        }],
        "todos": [],
        "device_id": "d2"
    });

    let first = push!(app, token, batch.clone());
    assert_eq!(first["accepted"], 1);

    // Replaying the identical batch accepts nothing new and reports the
    // now-equal record as a conflict
    let replay = push!(app, token, batch);
    assert_eq!(replay["accepted"], 0);
    assert_eq!(replay["conflicts"].as_array().unwrap().len(), 1);

    let delta = pull!(app, token, 0);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn test_push_mixed_batch_counts_both_kinds() {
    let app = test_app!();
    let token = access_token!(app, "mixed@example.com");
    let now = Utc::now();

    let resp = push!(
        app,
        token,
        json!({
            "notes": [{
                "id": "n-1",
                "title": "note from phone",
                "content": "",
                "type": "note",
                "modified_at": now.to_rfc3339(),
                "modified_by_device": "phone",
                "created_at": now.to_rfc3339(),
            }],
            "todos": [{
                "id": "t-1",
                "content": "todo from phone",
                "completed": false,
                "modified_at": now.to_rfc3339(),
                "modified_by_device": "phone",
                "created_at": now.to_rfc3339(),
            }],
            "device_id": "phone"
        })
    );
    assert_eq!(resp["accepted"], 2);

    let delta = pull!(app, token, 0);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 1);
    assert_eq!(delta["todos"].as_array().unwrap().len(), 1);
}

// ==================== Tombstones ====================

#[actix_web::test]
async fn test_tombstone_propagates_through_pull() {
    let app = test_app!();
    let token = access_token!(app, "tombstone@example.com");

    let note = create_note!(app, token, "doomed");
    let id = note["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/notes/{}", id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    // Gone from ordinary reads
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/notes/{}", id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    // But the sync delta carries the tombstone
    let delta = pull!(app, token, 0);
    let pulled = &delta["notes"][0];
    assert_eq!(pulled["id"], id.as_str());
    assert!(pulled["deleted_at"].is_string());
    assert_eq!(pulled["deleted_at"], pulled["modified_at"]);
}

#[actix_web::test]
async fn test_push_can_delete_and_undelete() {
    let app = test_app!();
    let token = access_token!(app, "undelete@example.com");

    let note = create_note!(app, token, "phoenix");
    let id = note["id"].as_str().unwrap().to_string();

    // Client-side deletion, one minute later
    let deleted_at = modified_at(&note) + ChronoDuration::minutes(1);
    let mut deleted = note_record(&note, deleted_at);
    deleted["deleted_at"] = json!(deleted_at.to_rfc3339());
    let resp = push!(app, token, json!({"notes": [deleted], "todos": [], "device_id": "d2"}));
    assert_eq!(resp["accepted"], 1);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/notes/{}", id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    // Undelete from another device, another minute later
    let revived = note_record(&note, deleted_at + ChronoDuration::minutes(1));
    let resp = push!(app, token, json!({"notes": [revived], "todos": [], "device_id": "d3"}));
    assert_eq!(resp["accepted"], 1);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/notes/{}", id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let fetched = test::call_service(&app, req).await;
    assert_eq!(fetched.status(), 200);
    let fetched: serde_json::Value = test::read_body_json(fetched).await;
    assert!(fetched["deleted_at"].is_null());
}

// ==================== Tenancy ====================

#[actix_web::test]
async fn test_push_cannot_write_into_another_tenant() {
    let app = test_app!();
    let token_a = access_token!(app, "pa@example.com");
    let token_b = access_token!(app, "pb@example.com");

    // B pushes a record claiming to belong to A; the server rebinds it to B
    let now = Utc::now();
    let resp = push!(
        app,
        token_b,
        json!({
            "notes": [{
                "id": "smuggled",
                "user_id": "someone-else",
                "title": "planted",
                "content": "",
                "type": "note",
                "modified_at": now.to_rfc3339(),
                "modified_by_device": "dx",
                "created_at": now.to_rfc3339(),
            }],
            "todos": [],
            "device_id": "dx"
        })
    );
    assert_eq!(resp["accepted"], 1);

    // A sees nothing
    let delta = pull!(app, token_a, 0);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 0);

    // B owns the record
    let delta = pull!(app, token_b, 0);
    assert_eq!(delta["notes"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn test_sync_requires_auth() {
    let app = test_app!();

    let req = test::TestRequest::get()
        .uri("/api/v1/sync/changes?since=0")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let req = test::TestRequest::post()
        .uri("/api/v1/sync/push")
        .set_json(json!({"notes": [], "todos": [], "device_id": "d1"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
}
