//! End-to-end API tests driving the full router over a temp filesystem
//! backend and an in-memory directory.

use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use http::Request;
use tower::ServiceExt;

use hatrac::authn::TrustedHeaderProvider;
use hatrac::config::Config;
use hatrac::directory::records::{AuxRecord, Binding};
use hatrac::directory::sqlite::SqliteDirectory;
use hatrac::name::{NamePath, SegmentClass};
use hatrac::storage::filesystem::FilesystemBackend;
use hatrac::AppState;

const NS_CT: &str = "application/x-hatrac-namespace";

/// The canonical 14-byte test body and its digests.
const BODY: &[u8] = b"hello, world!\n";
const BODY_MD5: &str = "ZXS/CYPMeEBJpBYNGYhyjA==";
const BODY_SHA256: &str = "5+aEMqzlEZxe9xPaDUZ0GyBvTUaZf4s0yMpPgV/0yt0=";

fn test_app_with_state() -> (Router, Arc<AppState>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let config = Config::default();
    let class = SegmentClass::parse(&config.allowed_url_char_class).unwrap();

    let directory =
        SqliteDirectory::open(":memory:", config.database_max_retries).expect("open directory");
    directory.deploy(&["admin".to_string()]).expect("deploy");

    let storage = FilesystemBackend::new(tmp.path().join("storage")).expect("create backend");

    let state = Arc::new(AppState {
        config,
        class,
        directory: Arc::new(directory),
        storage: Arc::new(storage),
        authn: Arc::new(TrustedHeaderProvider::new()),
    });

    (hatrac::server::app(state.clone()), state, tmp)
}

fn test_app() -> (Router, tempfile::TempDir) {
    let (router, _state, tmp) = test_app_with_state();
    (router, tmp)
}

fn req(method: &str, uri: &str) -> http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-hatrac-client", "admin")
}

fn with_body(builder: http::request::Builder, body: &[u8]) -> Request<Body> {
    builder
        .header("content-length", body.len().to_string())
        .body(Body::from(body.to_vec()))
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn create_namespace(router: &Router, path: &str) {
    let resp = router
        .clone()
        .oneshot(
            req("PUT", path)
                .header("content-type", NS_CT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "creating {path}");
}

/// PUT the canonical body with digest headers and return the versioned
/// URL from Location.
async fn put_canonical_object(router: &Router, path: &str) -> String {
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", path)
                .header("content-md5", BODY_MD5)
                .header("content-sha256", BODY_SHA256),
            BODY,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// PUT arbitrary bytes and return the versioned URL from Location.
async fn put_object(router: &Router, path: &str, body: &[u8]) -> String {
    let resp = router
        .clone()
        .oneshot(with_body(req("PUT", path), body))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "putting {path}");
    resp.headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// Version key from a `/hatrac/...:<key>` location.
fn version_key(location: &str) -> String {
    location.rsplit(':').next().unwrap().to_string()
}

/// Plant an aux record on a version. Aux records have no HTTP write
/// surface (they are maintained by the service and migration tooling),
/// so tests reach through the directory.
fn set_version_aux(state: &AppState, path: &str, key: &str, aux: AuxRecord) {
    let name = NamePath::from_segments(
        path.trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    );
    let object = match state.directory.resolve(&name).unwrap().binding {
        Binding::Object(obj) => obj,
        other => panic!("expected an object at {path}, got {other:?}"),
    };
    let record = state.directory.get_version(object.id, key).unwrap().unwrap();
    state.directory.set_version_aux(record.id, &aux).unwrap();
}

// ── Scenario 1: namespace lifecycle ─────────────────────────────────

#[tokio::test]
async fn namespace_create_conflict_delete_restore() {
    let (router, _tmp) = test_app();

    create_namespace(&router, "/hatrac/ns-X").await;

    // Repeat create conflicts.
    let resp = router
        .clone()
        .oneshot(
            req("PUT", "/hatrac/ns-X")
                .header("content-type", NS_CT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = router
        .clone()
        .oneshot(req("DELETE", "/hatrac/ns-X").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // The deleted name reads as absent.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Same-kind restoration is supported.
    create_namespace(&router, "/hatrac/ns-X").await;
}

#[tokio::test]
async fn deleted_name_cannot_change_kind() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    let location = put_canonical_object(&router, "/hatrac/ns/thing").await;
    assert!(location.starts_with("/hatrac/ns/thing:"));

    let resp = router
        .clone()
        .oneshot(req("DELETE", "/hatrac/ns/thing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // Rebinding the tombstoned object name as a namespace conflicts.
    let resp = router
        .clone()
        .oneshot(
            req("PUT", "/hatrac/ns/thing")
                .header("content-type", NS_CT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn parents_flag_creates_ancestors() {
    let (router, _tmp) = test_app();

    let resp = router
        .clone()
        .oneshot(
            req("PUT", "/hatrac/a/b/c")
                .header("content-type", NS_CT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = router
        .clone()
        .oneshot(
            req("PUT", "/hatrac/a/b/c?parents=true")
                .header("content-type", NS_CT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/a/b").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let listing: Vec<String> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(listing, vec!["/hatrac/a/b/c".to_string()]);
}

// ── Scenario 2: object round trip ───────────────────────────────────

#[tokio::test]
async fn object_put_get_round_trip_with_digests() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns-X").await;

    let location = put_canonical_object(&router, "/hatrac/ns-X/obj1").await;
    assert!(location.starts_with("/hatrac/ns-X/obj1:"));

    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X/obj1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-md5").unwrap(), BODY_MD5);
    assert_eq!(resp.headers().get("content-sha256").unwrap(), BODY_SHA256);
    assert_eq!(
        resp.headers().get("content-length").unwrap(),
        &BODY.len().to_string()
    );
    assert_eq!(body_bytes(resp).await, BODY);

    // The versioned URL serves the same bytes.
    let resp = router
        .clone()
        .oneshot(req("GET", &location).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, BODY);
}

#[tokio::test]
async fn object_put_with_wrong_digest_is_rejected() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    // Valid base64, wrong digest (MD5 of the empty string).
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns/obj").header("content-md5", "1B2M2Y8AsgTpgAmY7PhCfg=="),
            BODY,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Malformed base64 is rejected before any storage work.
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns/obj2").header("content-md5", "!!not-base64!!"),
            BODY,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn metadata_echoes_creation_values() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;
    put_canonical_object(&router, "/hatrac/ns/obj").await;

    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/obj;metadata").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["content-md5"], BODY_MD5);
    assert_eq!(json["content-sha256"], BODY_SHA256);

    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns/obj;metadata/content-md5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, format!("{BODY_MD5}\n").as_bytes());

    // A conflicting digest rewrite is refused; the identical value is a
    // no-op.
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns/obj;metadata/content-md5"),
            b"1B2M2Y8AsgTpgAmY7PhCfg==",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns/obj;metadata/content-md5"),
            BODY_MD5.as_bytes(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

// ── Scenario 3: ranges ──────────────────────────────────────────────

#[tokio::test]
async fn range_request_matrix() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns-X").await;
    put_canonical_object(&router, "/hatrac/ns-X/obj1").await;

    // bytes=5-10 → 206 with the middle slice.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1")
                .header("range", "bytes=5-10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers().get("content-length").unwrap(), "6");
    assert_eq!(
        resp.headers().get("content-range").unwrap(),
        "bytes 5-10/14"
    );
    assert_eq!(body_bytes(resp).await, b", worl");

    // bytes=-4 → the last four bytes.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1")
                .header("range", "bytes=-4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(body_bytes(resp).await, b"ld!\n");

    // Out of range → 416 with the total in Content-Range.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1")
                .header("range", "bytes=900000-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert_eq!(resp.headers().get("content-range").unwrap(), "bytes */14");

    // Multi-range → 501.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1")
                .header("range", "bytes=1-2,3-5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 501);

    // A malformed header serves the full representation.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1")
                .header("range", "lines=1-2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, BODY);
}

// ── Scenario 4: chunked upload ──────────────────────────────────────

#[tokio::test]
async fn chunked_upload_lifecycle() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns-X").await;

    // hello, world!\n in 5-byte chunks: 5 + 5 + 4.
    let create = serde_json::json!({
        "chunk-length": 5,
        "content-length": 14,
        "content-md5": BODY_MD5,
    })
    .to_string();
    let resp = router
        .clone()
        .oneshot(with_body(
            req("POST", "/hatrac/ns-X/obj2;upload").header("content-type", "application/json"),
            create.as_bytes(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let job_url = resp
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(job_url.contains(";upload/"));

    // Target object exists with no content yet: GET conflicts.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X/obj2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    for (position, chunk) in [(0u64, &BODY[0..5]), (1, &BODY[5..10]), (2, &BODY[10..14])] {
        let resp = router
            .clone()
            .oneshot(with_body(
                req("PUT", &format!("{job_url}/{position}")),
                chunk,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), 204, "chunk {position}");
    }

    // Chunk beyond the declared layout conflicts; a negative position
    // never parses.
    let resp = router
        .clone()
        .oneshot(with_body(req("PUT", &format!("{job_url}/3")), &BODY[0..5]))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let resp = router
        .clone()
        .oneshot(with_body(req("PUT", &format!("{job_url}/-1")), &BODY[0..5]))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Finalize mints the version.
    let resp = router
        .clone()
        .oneshot(req("POST", &job_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let location = resp
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("/hatrac/ns-X/obj2:"));

    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X/obj2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-md5").unwrap(), BODY_MD5);
    assert_eq!(body_bytes(resp).await, BODY);

    // The job reached a terminal state: a second finalize is 404.
    let resp = router
        .clone()
        .oneshot(req("POST", &job_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn upload_finalize_digest_mismatch_conflicts() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    // Declare the digest of different content.
    let create = serde_json::json!({
        "chunk-length": 5,
        "content-length": 5,
        "content-md5": "1B2M2Y8AsgTpgAmY7PhCfg==",
    })
    .to_string();
    let resp = router
        .clone()
        .oneshot(with_body(
            req("POST", "/hatrac/ns/obj;upload").header("content-type", "application/json"),
            create.as_bytes(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let job_url = resp
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let resp = router
        .clone()
        .oneshot(with_body(req("PUT", &format!("{job_url}/0")), b"bytes"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(req("POST", &job_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn upload_cancel_and_listing() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    let create = serde_json::json!({"chunk-length": 5, "content-length": 10}).to_string();
    let resp = router
        .clone()
        .oneshot(with_body(
            req("POST", "/hatrac/ns/obj;upload").header("content-type", "application/json"),
            create.as_bytes(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let job_url = resp
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // The open job shows up in the listing.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/obj;upload").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let listing: Vec<String> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(listing, vec![job_url.clone()]);

    let resp = router
        .clone()
        .oneshot(req("DELETE", &job_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(req("GET", &job_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Scenario 5: preconditions and version lifecycle ─────────────────

#[tokio::test]
async fn conditional_updates_and_version_delete() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns-X").await;
    let v1_url = put_canonical_object(&router, "/hatrac/ns-X/obj1").await;
    let v1_etag = format!("\"{}\"", v1_url.rsplit(':').next().unwrap());

    // Wrong precondition: 412.
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns-X/obj1").header("if-match", "\"wrongetag\""),
            b"second version",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 412);

    // Correct precondition: a new version.
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns-X/obj1").header("if-match", &v1_etag),
            b"second version",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // The current version serves the new content.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X/obj1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_bytes(resp).await, b"second version");

    // Delete the old version under its own ETag.
    let resp = router
        .clone()
        .oneshot(
            req("DELETE", &v1_url)
                .header("if-match", &v1_etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // The deleted version is gone; the current one still serves.
    let resp = router
        .clone()
        .oneshot(req("GET", &v1_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X/obj1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn deleting_current_version_advances_pointer() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    let _v1 = put_canonical_object(&router, "/hatrac/ns/obj").await;
    let resp = router
        .clone()
        .oneshot(with_body(req("PUT", "/hatrac/ns/obj"), b"newer bytes"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let v2_url = resp
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Deleting the current version falls back to the older one.
    let resp = router
        .clone()
        .oneshot(req("DELETE", &v2_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/obj").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, BODY);

    // Deleting the last version leaves the object with no content.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/obj;versions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let listing: Vec<String> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(listing.len(), 1);
    let resp = router
        .clone()
        .oneshot(req("DELETE", &listing[0]).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/obj").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // A fresh PUT revives the current pointer.
    put_canonical_object(&router, "/hatrac/ns/obj").await;
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/obj").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn if_none_match_star_guards_creation() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;
    put_canonical_object(&router, "/hatrac/ns/obj").await;

    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns/obj").header("if-none-match", "*"),
            b"should not land",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 412);
}

#[tokio::test]
async fn conditional_get_returns_304() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;
    let url = put_canonical_object(&router, "/hatrac/ns/obj").await;
    let etag = format!("\"{}\"", url.rsplit(':').next().unwrap());

    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns/obj")
                .header("if-none-match", &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 304);
    assert!(body_bytes(resp).await.is_empty());
}

// ── Scenario 6: ACL management ──────────────────────────────────────

#[tokio::test]
async fn acl_owner_management() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns-X").await;
    put_canonical_object(&router, "/hatrac/ns-X/obj1").await;

    // Stripping all owners is refused.
    let resp = router
        .clone()
        .oneshot(with_body(req("PUT", "/hatrac/ns-X/obj1;acl/owner"), b"[]"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Fetch the ACL ETag, then replace the owner list under it.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns-X/obj1;acl").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let etag = resp
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns-X/obj1;acl/owner").header("if-match", &etag),
            br#"["R1", "R2"]"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // A stale ETag no longer matches.
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns-X/obj1;acl/owner").header("if-match", &etag),
            br#"["R1"]"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 412);

    // admin lost object-level ownership but still owns through the
    // namespace chain from deploy.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1;acl/owner")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let roles: Vec<String> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(roles, vec!["R1".to_string(), "R2".to_string()]);

    // Remove one entry; the remaining list survives.
    let resp = router
        .clone()
        .oneshot(
            req("DELETE", "/hatrac/ns-X/obj1;acl/owner/R2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns-X/obj1;acl/owner/R1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, b"R1\n");

    // Removing the last owner is refused.
    let resp = router
        .clone()
        .oneshot(
            req("DELETE", "/hatrac/ns-X/obj1;acl/owner/R1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn acl_entry_insert_without_body() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    let resp = router
        .clone()
        .oneshot(
            req("PUT", "/hatrac/ns;acl/subtree-read/readers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns;acl/subtree-read")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let roles: Vec<String> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(roles, vec!["readers".to_string()]);
}

// ── Aux-record addressing overrides ─────────────────────────────────

#[tokio::test]
async fn rename_to_serves_target_bytes_with_source_identity() {
    let (router, state, _tmp) = test_app_with_state();
    create_namespace(&router, "/hatrac/ns").await;

    let src_url = put_canonical_object(&router, "/hatrac/ns/src").await;
    let src_key = version_key(&src_url);
    let dst_url = put_object(&router, "/hatrac/ns/dst", b"superseding bytes").await;
    let dst_key = version_key(&dst_url);

    set_version_aux(
        &state,
        "/ns/src",
        &src_key,
        AuxRecord {
            rename_to: Some(("/ns/dst".to_string(), dst_key.clone())),
            ..Default::default()
        },
    );

    let resp = router
        .clone()
        .oneshot(req("GET", &src_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    // Identity stays with the addressed version: its ETag and its own
    // creation-time metadata.
    assert_eq!(
        resp.headers().get("etag").unwrap(),
        &format!("\"{src_key}\"")
    );
    assert_eq!(resp.headers().get("content-md5").unwrap(), BODY_MD5);
    assert_eq!(resp.headers().get("content-sha256").unwrap(), BODY_SHA256);
    assert_eq!(
        resp.headers().get("content-location").unwrap(),
        &format!("/hatrac/ns/dst:{dst_key}")
    );
    // The bytes come from the rename target.
    assert_eq!(body_bytes(resp).await, b"superseding bytes");

    // The unqualified object path follows the same indirection.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/src").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, b"superseding bytes");

    // The metadata sub-resource never follows the rename either.
    let resp = router
        .clone()
        .oneshot(
            req("GET", "/hatrac/ns/src;metadata/content-md5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(body_bytes(resp).await, format!("{BODY_MD5}\n").as_bytes());
}

#[tokio::test]
async fn aux_url_redirects_to_remote() {
    let (router, state, _tmp) = test_app_with_state();
    create_namespace(&router, "/hatrac/ns").await;

    let url = put_canonical_object(&router, "/hatrac/ns/linked").await;
    let key = version_key(&url);
    let remote = format!("https://remote.example.org/hatrac/ns/linked:{key}");

    set_version_aux(
        &state,
        "/ns/linked",
        &key,
        AuxRecord {
            url: Some(remote.clone()),
            ..Default::default()
        },
    );

    let resp = router
        .clone()
        .oneshot(req("GET", &url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 307);
    assert_eq!(resp.headers().get("location").unwrap(), &remote);

    // The unqualified object path redirects the same way.
    let resp = router
        .clone()
        .oneshot(req("GET", "/hatrac/ns/linked").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 307);
    assert_eq!(resp.headers().get("location").unwrap(), &remote);
}

#[tokio::test]
async fn hname_hversion_override_backend_address() {
    let (router, state, _tmp) = test_app_with_state();
    create_namespace(&router, "/hatrac/ns").await;

    // Content physically stored under /ns/real, addressed through an
    // alias version whose aux overrides the backend address.
    let real_url = put_object(&router, "/hatrac/ns/real", b"relocated content").await;
    let real_key = version_key(&real_url);
    let alias_url = put_object(&router, "/hatrac/ns/alias", b"placeholder").await;
    let alias_key = version_key(&alias_url);

    set_version_aux(
        &state,
        "/ns/alias",
        &alias_key,
        AuxRecord {
            hname: Some("/ns/real".to_string()),
            hversion: Some(real_key.clone()),
            ..Default::default()
        },
    );

    let resp = router
        .clone()
        .oneshot(req("GET", &alias_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    // The alias keeps its own ETag while the bytes are fetched from the
    // overridden (name, version) address.
    assert_eq!(
        resp.headers().get("etag").unwrap(),
        &format!("\"{alias_key}\"")
    );
    assert_eq!(body_bytes(resp).await, b"relocated content");
}

#[tokio::test]
async fn rename_cycle_is_cut_by_hop_limit() {
    let (router, state, _tmp) = test_app_with_state();
    create_namespace(&router, "/hatrac/ns").await;

    let a_url = put_object(&router, "/hatrac/ns/loop-a", b"aaa").await;
    let a_key = version_key(&a_url);
    let b_url = put_object(&router, "/hatrac/ns/loop-b", b"bbb").await;
    let b_key = version_key(&b_url);

    set_version_aux(
        &state,
        "/ns/loop-a",
        &a_key,
        AuxRecord {
            rename_to: Some(("/ns/loop-b".to_string(), b_key.clone())),
            ..Default::default()
        },
    );
    set_version_aux(
        &state,
        "/ns/loop-b",
        &b_key,
        AuxRecord {
            rename_to: Some(("/ns/loop-a".to_string(), a_key.clone())),
            ..Default::default()
        },
    );

    let resp = router
        .clone()
        .oneshot(req("GET", &a_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}

// ── Authorization behavior ──────────────────────────────────────────

#[tokio::test]
async fn anonymous_cannot_read_private_content() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;
    put_canonical_object(&router, "/hatrac/ns/obj").await;

    // No identity headers at all.
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/hatrac/ns/obj")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Grant subtree-read to everyone at the namespace; anonymous reads
    // now pass.
    let resp = router
        .clone()
        .oneshot(with_body(
            req("PUT", "/hatrac/ns;acl/subtree-read"),
            br#"["*"]"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/hatrac/ns/obj")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn non_owner_cannot_see_acls() {
    let (router, _tmp) = test_app();
    create_namespace(&router, "/hatrac/ns").await;

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/hatrac/ns;acl")
                .header("x-hatrac-client", "stranger")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

// ── Error rendering ─────────────────────────────────────────────────

#[tokio::test]
async fn errors_negotiate_html_templates() {
    let tmp = tempfile::tempdir().unwrap();
    let config: Config = serde_json::from_str(
        r#"{"error_templates": {"404": {"text/html": "<h1>{code} {title}</h1>"}}}"#,
    )
    .unwrap();
    let class = SegmentClass::parse(&config.allowed_url_char_class).unwrap();
    let directory = SqliteDirectory::open(":memory:", 3).unwrap();
    directory.deploy(&["admin".to_string()]).unwrap();
    let storage = FilesystemBackend::new(tmp.path().join("storage")).unwrap();
    let state = Arc::new(AppState {
        config,
        class,
        directory: Arc::new(directory),
        storage: Arc::new(storage),
        authn: Arc::new(TrustedHeaderProvider::new()),
    });
    let router = hatrac::server::app(state);

    let resp = router
        .oneshot(
            req("GET", "/hatrac/missing")
                .header("accept", "text/html")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/html");
    assert_eq!(body_bytes(resp).await, b"<h1>404 Not Found</h1>");
}
