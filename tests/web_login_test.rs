// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;
use treeshare::guard::PathGuard;
use treeshare::server::Credentials;
use treeshare::shared::{AuthRateLimitConfig, AuthRateLimiter};
use treeshare::web::handlers::{ListingView, LOGIN_FAILED_MESSAGE};
use treeshare::web::{WebConfig, WebServer};

const FORM: &str = "application/x-www-form-urlencoded";

fn app(max_attempts: u32) -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("root-file.txt"), b"root bytes").unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();
    std::fs::write(dir.path().join("subdir/nested-file.txt"), b"nested").unwrap();

    let guard = Arc::new(PathGuard::local(dir.path(), vec![".git".to_string()]).unwrap());
    let limiter = AuthRateLimiter::new(AuthRateLimitConfig::new(max_attempts, 300, 300));
    let server = WebServer::new(
        WebConfig::builder().secret("0123456789abcdef0123456789abcdef").build(),
        guard,
        Credentials::plain("alice", "wonderland"),
        limiter,
    );
    (dir, server.router())
}

fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&prefix))
        .map(|v| v[prefix.len()..].split(';').next().unwrap_or("").to_string())
}

fn location(response: &Response<Body>) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

fn login_request(form: &str, csrf_cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/login")
        .header(header::CONTENT_TYPE, FORM);
    if let Some(token) = csrf_cookie {
        builder = builder.header(header::COOKIE, format!("treeshare_csrf={token}"));
    }
    let mut request = builder.body(Body::from(form.to_string())).unwrap();
    let peer: SocketAddr = "192.0.2.10:40000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

/// Render the login page and return the CSRF cookie value and form value.
async fn csrf_pair(app: &Router) -> (String, String) {
    let response = app.clone().oneshot(get("/login", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = set_cookie(&response, "treeshare_csrf").unwrap();

    let body = body_string(response).await;
    let marker = "name=\"csrf_token\" value=\"";
    let start = body.find(marker).unwrap() + marker.len();
    let end = start + body[start..].find('"').unwrap();
    (cookie, body[start..end].to_string())
}

async fn login(app: &Router) -> String {
    let (cookie, field) = csrf_pair(app).await;
    let form = format!("username=alice&password=wonderland&csrf_token={field}");
    let response = app
        .clone()
        .oneshot(login_request(&form, Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/files/");
    set_cookie(&response, "treeshare_session").unwrap()
}

#[tokio::test]
async fn test_protected_routes_redirect_to_login() {
    let (_dir, app) = app(5);

    for uri in ["/files/", "/files/root-file.txt", "/files/missing"] {
        let response = app.clone().oneshot(get(uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{uri}");
        assert_eq!(location(&response), "/login");
    }

    let response = app.clone().oneshot(get("/", None)).await.unwrap();
    assert_eq!(location(&response), "/files/");
}

#[tokio::test]
async fn test_login_page_csrf_pair_matches() {
    let (_dir, app) = app(5);
    let (cookie, field) = csrf_pair(&app).await;
    assert_eq!(cookie, field);

    let (second, _) = csrf_pair(&app).await;
    assert_ne!(cookie, second);
}

#[tokio::test]
async fn test_login_with_matching_csrf_yields_session() {
    let (_dir, app) = app(5);
    let session = login(&app).await;

    let cookie = format!("treeshare_session={session}");
    let response = app
        .clone()
        .oneshot(get("/files/", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let listing: ListingView = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listing.path, "/");
    let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["root-file.txt", "subdir"]);

    let response = app
        .clone()
        .oneshot(get("/files/subdir", Some(&cookie)))
        .await
        .unwrap();
    let listing: ListingView = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listing.entries[0].name, "..");
    assert!(listing.entries[0].parent);

    let response = app
        .clone()
        .oneshot(get("/files/root-file.txt", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "root bytes");
}

#[tokio::test]
async fn test_login_without_csrf_is_rejected() {
    let (_dir, app) = app(5);

    let response = app
        .clone()
        .oneshot(login_request("username=alice&password=wonderland", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookie(&response, "treeshare_session").is_none());
    assert!(body_string(response).await.contains(LOGIN_FAILED_MESSAGE));
}

#[tokio::test]
async fn test_login_with_mismatched_csrf_is_rejected() {
    let (_dir, app) = app(5);
    let (cookie, _) = csrf_pair(&app).await;
    let (_, other_field) = csrf_pair(&app).await;

    let form = format!("username=alice&password=wonderland&csrf_token={other_field}");
    let response = app
        .clone()
        .oneshot(login_request(&form, Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookie(&response, "treeshare_session").is_none());
}

#[tokio::test]
async fn test_failure_messages_are_identical() {
    let (_dir, app) = app(50);

    let (cookie, field) = csrf_pair(&app).await;
    let wrong_password = app
        .clone()
        .oneshot(login_request(
            &format!("username=alice&password=nope&csrf_token={field}"),
            Some(&cookie),
        ))
        .await
        .unwrap();

    let (cookie, field) = csrf_pair(&app).await;
    let unknown_user = app
        .clone()
        .oneshot(login_request(
            &format!("username=mallory&password=wonderland&csrf_token={field}"),
            Some(&cookie),
        ))
        .await
        .unwrap();

    let missing_csrf = app
        .clone()
        .oneshot(login_request("username=alice&password=wonderland", None))
        .await
        .unwrap();

    let strip = |body: String| {
        // The embedded CSRF value differs per render
        let marker = "value=\"";
        let start = body.find(marker).unwrap() + marker.len();
        let end = start + body[start..].find('"').unwrap();
        format!("{}{}", &body[..start], &body[end..])
    };

    let a = strip(body_string(wrong_password).await);
    let b = strip(body_string(unknown_user).await);
    let c = strip(body_string(missing_csrf).await);
    assert_eq!(a, b);
    assert_eq!(b, c);
}

#[tokio::test]
async fn test_forged_session_redirects() {
    let (_dir, app) = app(5);
    let session = login(&app).await;

    let mut forged = session.into_bytes();
    let sig = forged.iter().position(|&b| b == b'.').unwrap() + 1;
    forged[sig] = if forged[sig] == b'A' { b'B' } else { b'A' };
    let cookie = format!("treeshare_session={}", String::from_utf8(forged).unwrap());

    let response = app
        .clone()
        .oneshot(get("/files/", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");
}

#[tokio::test]
async fn test_basic_auth_header_issues_session() {
    use base64::Engine;

    let (_dir, app) = app(5);
    let credentials = base64::engine::general_purpose::STANDARD.encode("alice:wonderland");
    let request = Request::builder()
        .uri("/files/root-file.txt")
        .header(header::AUTHORIZATION, format!("Basic {credentials}"))
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response, "treeshare_session").is_some());

    let bad = base64::engine::general_purpose::STANDARD.encode("alice:nope");
    let request = Request::builder()
        .uri("/files/")
        .header(header::AUTHORIZATION, format!("Basic {bad}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_confinement_over_http() {
    let (_dir, app) = app(5);
    let cookie = format!("treeshare_session={}", login(&app).await);

    let response = app
        .clone()
        .oneshot(get("/files/.git", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(get("/files/subdir/../../etc/passwd", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!body_string(response).await.contains("/etc"));
}

#[tokio::test]
async fn test_logout_clears_session_cookie() {
    let (_dir, app) = app(5);
    let session = login(&app).await;

    let request = Request::builder()
        .method("POST")
        .uri("/logout")
        .header(header::COOKIE, format!("treeshare_session={session}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");
    assert_eq!(set_cookie(&response, "treeshare_session").as_deref(), Some(""));
}

#[tokio::test]
async fn test_repeated_failures_lock_out_the_address() {
    let (_dir, app) = app(5);

    for _ in 0..5 {
        let (cookie, field) = csrf_pair(&app).await;
        let response = app
            .clone()
            .oneshot(login_request(
                &format!("username=alice&password=wrong&csrf_token={field}"),
                Some(&cookie),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let (cookie, field) = csrf_pair(&app).await;
    let response = app
        .clone()
        .oneshot(login_request(
            &format!("username=alice&password=wonderland&csrf_token={field}"),
            Some(&cookie),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(set_cookie(&response, "treeshare_session").is_none());
}
