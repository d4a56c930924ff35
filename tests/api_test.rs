//! Black-box tests of the REST surface on an ephemeral port.
//!
//! Covers:
//! 1. Login: first user becomes admin, cookie + bearer auth
//! 2. Device listing with the visibility filter folded in
//! 3. The full lease flow over HTTP, including cool-down
//! 4. Admin-on-behalf acquire and admin release
//! 5. Groups, admins, and properties endpoints
//! 6. Authorization failures map to the documented status codes

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Query;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use fleetd::config::Config;
use fleetd::coordinator::{CoordinatorTiming, DeviceCoordinator};
use fleetd::store::{Platform, Source, Store};
use fleetd::ws::provider::{ProviderRegistry, ReleaseChannel};
use fleetd::AppContext;

// ─── Harness ─────────────────────────────────────────────────────────────────

type ColdHits = Arc<Mutex<Vec<(String, String)>>>;

async fn start_cold_server() -> (String, ColdHits) {
    let hits: ColdHits = Arc::new(Mutex::new(Vec::new()));
    let recorded = hits.clone();
    let app = axum::Router::new().route(
        "/p/cold",
        axum::routing::post(move |Query(params): Query<HashMap<String, String>>| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().await.push((
                    params.get("udid").cloned().unwrap_or_default(),
                    params.get("secret").cloned().unwrap_or_default(),
                ));
                "ok"
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/p"), hits)
}

struct App {
    ctx: Arc<AppContext>,
    base: String,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

async fn start_app() -> App {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(Config::new(
        Some(0),
        Some(0),
        Some(dir.path().to_path_buf()),
        Some("info".to_string()),
    ));
    let store = Arc::new(Store::new(dir.path()).await.unwrap());
    let providers = Arc::new(ProviderRegistry::new());
    let timing = CoordinatorTiming {
        cold_timeout: Duration::from_secs(2),
        cold_grace: Duration::from_secs(1),
        idle_grace: Duration::from_secs(1),
    };
    let coordinator = Arc::new(DeviceCoordinator::new(
        store.clone(),
        providers.clone() as Arc<dyn ReleaseChannel>,
        timing,
    ));
    let ctx = Arc::new(AppContext {
        config,
        store,
        providers,
        coordinator,
        started_at: Instant::now(),
    });

    let router = fleetd::api::build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    App {
        ctx,
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl App {
    /// POST /login and return the API bearer token.
    async fn login(&self, email: &str) -> String {
        let resp = self
            .client
            .post(format!("{}/login", self.base))
            .json(&json!({ "email": email, "username": email.split('@').next() }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    async fn get(&self, path: &str, token: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str, token: &str) -> (u16, Value) {
        let resp = self
            .client
            .delete(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn publish(&self, udid: &str, owner: &str, url: &str) {
        self.ctx
            .store
            .apply_provider_update(
                udid,
                Some(Platform::Android),
                None,
                Some(Source {
                    id: "p1".to_string(),
                    url: url.to_string(),
                    device_address: Some("10.0.0.1:7912".to_string()),
                    remote_connect_address: None,
                    secret: "s".to_string(),
                    priority: 2,
                }),
                owner,
                "p1",
            )
            .await
            .unwrap();
    }
}

macro_rules! wait_until {
    ($timeout_secs:expr, $check:expr, $what:expr) => {{
        let deadline = Instant::now() + Duration::from_secs($timeout_secs);
        loop {
            if $check {
                break;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", $what);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }};
}

// ─── 1. Login and auth ───────────────────────────────────────────────────────

#[tokio::test]
async fn first_login_becomes_admin_and_auth_gates_hold() {
    let app = start_app().await;

    let resp = app
        .client
        .post(format!("{}/login", app.base))
        .json(&json!({ "email": "a@x", "username": "a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers().get("set-cookie").is_some(),
        "login must set the session cookie"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["admin"], true);

    let second = app.login("b@x").await;
    let (status, body) = app.get("/api/v1/user", &second).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["admin"], false);
    assert_eq!(body["data"]["email"], "b@x");
    assert!(body["data"]["groups"].as_array().unwrap().is_empty());

    // No credentials → 401; bad bearer token → 401.
    let resp = app
        .client
        .get(format!("{}/api/v1/devices", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let (status, _) = app.get("/api/v1/devices", "bogus-token").await;
    assert_eq!(status, 401);

    // Signed cookie works as an alternative to the bearer token.
    let cookie = fleetd::identity::session_cookie(&app.ctx.config, "b@x");
    let cookie_pair = cookie.split(';').next().unwrap().to_string();
    let resp = app
        .client
        .get(format!("{}/api/v1/user", app.base))
        .header("Cookie", cookie_pair)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

// ─── 2. Visibility ───────────────────────────────────────────────────────────

#[tokio::test]
async fn listing_honors_ownership_and_groups() {
    let app = start_app().await;
    let admin = app.login("a@x").await;
    let u = app.login("u@x").await;
    let v = app.login("v@y").await;

    // v creates (and thereby joins) teamA.
    let (status, _) = app
        .post(
            "/api/v1/user/groups",
            &v,
            json!({ "id": "teamA", "name": "Team A" }),
        )
        .await;
    assert_eq!(status, 200);

    app.publish("D1", "", "http://127.0.0.1:9/p").await;
    app.publish("D2", "teamA", "http://127.0.0.1:9/p").await;

    let udids = |body: &Value| -> Vec<String> {
        body["data"]["devices"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["udid"].as_str().unwrap().to_string())
            .collect()
    };

    let (_, body) = app.get("/api/v1/devices", &u).await;
    assert_eq!(udids(&body), vec!["D1"]);
    assert_eq!(body["data"]["count"], 1);

    let (_, body) = app.get("/api/v1/devices", &v).await;
    let mut seen = udids(&body);
    seen.sort();
    assert_eq!(seen, vec!["D1", "D2"]);

    let (_, body) = app.get("/api/v1/devices", &admin).await;
    assert_eq!(udids(&body).len(), 2);

    // Detail and properties of an invisible device read as missing.
    let (status, _) = app.get("/api/v1/devices/D2", &u).await;
    assert_eq!(status, 404);
    let (status, _) = app.get("/api/v1/devices/D2/properties", &u).await;
    assert_eq!(status, 404);
    let (status, body) = app.get("/api/v1/devices/D2", &v).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["owner"], "teamA");
    assert!(body["data"].get("sources").is_none());
}

#[tokio::test]
async fn usable_filter_excludes_busy_and_absent_devices() {
    let app = start_app().await;
    let _admin = app.login("a@x").await;
    let u = app.login("u@x").await;

    app.publish("IDLE", "", "http://127.0.0.1:9/p").await;
    app.publish("BUSY", "", "http://127.0.0.1:9/p").await;
    app.publish("GONE", "", "http://127.0.0.1:9/p").await;
    app.ctx.store.try_claim("BUSY").await.unwrap();
    app.ctx
        .store
        .begin_lease("BUSY", "v@y", chrono::Utc::now(), 600)
        .await
        .unwrap();
    app.ctx
        .store
        .apply_provider_update("GONE", None, None, None, "", "p1")
        .await
        .unwrap();

    let (_, body) = app.get("/api/v1/devices?usable=true", &u).await;
    let devices = body["data"]["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["udid"], "IDLE");

    let (_, body) = app.get("/api/v1/devices?present=true", &u).await;
    assert_eq!(body["data"]["devices"].as_array().unwrap().len(), 2);
}

// ─── 3. Lease flow over HTTP ─────────────────────────────────────────────────

#[tokio::test]
async fn lease_flow_acquire_list_release_cools_down() {
    let (cold_url, hits) = start_cold_server().await;
    let app = start_app().await;
    let _admin = app.login("a@x").await;
    let u = app.login("u@x").await;
    app.publish("D1", "", &cold_url).await;

    let (status, body) = app
        .post(
            "/api/v1/user/devices",
            &u,
            json!({ "udid": "D1", "idleTimeout": 30 }),
        )
        .await;
    assert_eq!(status, 200, "acquire failed: {body}");

    let (_, body) = app.get("/api/v1/user/devices", &u).await;
    let devices = body["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["udid"], "D1");
    assert_eq!(devices[0]["userId"], "u@x");
    assert_eq!(devices[0]["idleTimeout"], 30);

    // Lessee detail carries the best source's endpoints.
    let (status, body) = app.get("/api/v1/user/devices/D1", &u).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["source"]["deviceAddress"], "10.0.0.1:7912");

    // Someone else cannot peek or release.
    let v = app.login("v@y").await;
    let (status, _) = app.get("/api/v1/user/devices/D1", &v).await;
    assert_eq!(status, 403);
    let (status, _) = app.delete("/api/v1/user/devices/D1", &v).await;
    assert_eq!(status, 403);

    // Keepalive works for the lessee only.
    let (status, _) = app.get("/api/v1/user/devices/D1/active", &u).await;
    assert_eq!(status, 200);
    let (status, _) = app.get("/api/v1/user/devices/D1/active", &v).await;
    assert_eq!(status, 400);

    let (status, _) = app.delete("/api/v1/user/devices/D1", &u).await;
    assert_eq!(status, 200);
    wait_until!(5, !hits.lock().await.is_empty(), "cool-down callback");
    assert_eq!(hits.lock().await[0], ("D1".to_string(), "s".to_string()));
    wait_until!(
        5,
        !app.ctx.store.device("D1").await.unwrap().unwrap().colding,
        "colding cleared"
    );

    // Releasing an idle device reports idempotent success.
    let (status, _) = app.delete("/api/v1/user/devices/D1", &u).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn acquire_conflicts_surface_as_forbidden() {
    let app = start_app().await;
    let _admin = app.login("a@x").await;
    let u = app.login("u@x").await;
    let v = app.login("v@y").await;
    app.publish("D1", "", "http://127.0.0.1:9/p").await;

    let (status, _) = app
        .post("/api/v1/user/devices", &u, json!({ "udid": "D1" }))
        .await;
    assert_eq!(status, 200);

    let (status, body) = app
        .post("/api/v1/user/devices", &v, json!({ "udid": "D1" }))
        .await;
    assert_eq!(status, 403);
    assert_eq!(body["success"], false);
    assert!(body["description"].as_str().unwrap().contains("busy"));

    let (status, _) = app
        .post("/api/v1/user/devices", &u, json!({ "udid": "MISSING" }))
        .await;
    assert_eq!(status, 403);
}

// ─── 4. Admin powers ─────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_leases_on_behalf_and_releases_any_device() {
    let app = start_app().await;
    let admin = app.login("a@x").await;
    let u = app.login("u@x").await;
    app.publish("D1", "", "http://127.0.0.1:9/p").await;

    // Non-admins may not lease for someone else.
    let (status, _) = app
        .post(
            "/api/v1/user/devices",
            &u,
            json!({ "udid": "D1", "email": "v@y" }),
        )
        .await;
    assert_eq!(status, 403);

    let (status, _) = app
        .post(
            "/api/v1/user/devices",
            &admin,
            json!({ "udid": "D1", "email": "u@x" }),
        )
        .await;
    assert_eq!(status, 200);

    let (_, body) = app.get("/api/v1/user/devices", &u).await;
    assert_eq!(body["devices"].as_array().unwrap().len(), 1);

    // Admin releases a lease they do not hold.
    let (status, _) = app.delete("/api/v1/user/devices/D1", &admin).await;
    assert_eq!(status, 200);
    wait_until!(
        5,
        !app.ctx.store.device("D1").await.unwrap().unwrap().using,
        "admin release"
    );
}

#[tokio::test]
async fn admin_roster_and_properties_are_admin_gated() {
    let app = start_app().await;
    let admin = app.login("a@x").await;
    let u = app.login("u@x").await;
    app.publish("D1", "", "http://127.0.0.1:9/p").await;

    let (status, _) = app.get("/api/v1/admins", &u).await;
    assert_eq!(status, 403);

    let (status, body) = app.get("/api/v1/admins", &admin).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert!(body["data"][0].get("token").is_none(), "tokens stay private");

    let (status, _) = app
        .post("/api/v1/admins", &admin, json!({ "email": "u@x" }))
        .await;
    assert_eq!(status, 200);
    let (_, body) = app.get("/api/v1/admins", &admin).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    let (status, _) = app
        .post("/api/v1/admins", &admin, json!({ "email": "ghost@x" }))
        .await;
    assert_eq!(status, 400);

    // Properties: anyone visible may read, only admins may write.
    let v = app.login("v@y").await;
    let (status, _) = app
        .post("/api/v1/admins", &v, json!({ "email": "v@y" }))
        .await;
    assert_eq!(status, 403);

    let resp = app
        .client
        .put(format!("{}/api/v1/devices/D1/properties", app.base))
        .bearer_auth(&v)
        .json(&json!({ "brand": "Pixel" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = app
        .client
        .put(format!("{}/api/v1/devices/D1/properties", app.base))
        .bearer_auth(&admin)
        .json(&json!({ "brand": "Pixel" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let (_, body) = app.get("/api/v1/devices/D1/properties", &v).await;
    assert_eq!(body["data"]["brand"], "Pixel");
}

// ─── 5. Groups ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn group_creation_and_member_listing() {
    let app = start_app().await;
    let _admin = app.login("a@x").await;
    let u = app.login("u@x").await;

    let (status, _) = app
        .post(
            "/api/v1/user/groups",
            &u,
            json!({ "id": "teamB", "name": "Team B" }),
        )
        .await;
    assert_eq!(status, 200);

    // Collision and invalid ids are rejected.
    let (status, body) = app
        .post(
            "/api/v1/user/groups",
            &u,
            json!({ "id": "teamB", "name": "Again" }),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["description"].as_str().unwrap().contains("teamB"));
    let (status, _) = app
        .post(
            "/api/v1/user/groups",
            &u,
            json!({ "id": "bad@id", "name": "Nope" }),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = app.get("/api/v1/groups/teamB/users", &u).await;
    assert_eq!(status, 200);
    let members = body["data"].as_array().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["email"], "u@x");
    assert_eq!(members[0]["role"], "admin");

    let (status, _) = app.get("/api/v1/groups/ghost/users", &u).await;
    assert_eq!(status, 404);

    // Creator's membership shows up on the profile.
    let (_, body) = app.get("/api/v1/user", &u).await;
    assert_eq!(body["data"]["groups"][0]["id"], "teamB");
    assert_eq!(body["data"]["groups"][0]["role"], "admin");
}
