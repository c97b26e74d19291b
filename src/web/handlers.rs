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

//! Route handlers: login, logout, and read-only file access.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Extension, Form, Json};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::csrf::{self, CSRF_COOKIE};
use super::middleware::{
    session_cookie, session_removal, session_user, AuthenticatedUser, ClientIp,
};
use super::{WebState, FILES_PATH, LOGIN_PATH};
use crate::guard::{DirEntry, EntryKind, Opened};
use crate::shared::error::GatewayError;

/// The one message shown for every failed login, whatever failed.
pub const LOGIN_FAILED_MESSAGE: &str = "Invalid username or password.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub csrf_token: Option<String>,
}

pub async fn index() -> Redirect {
    Redirect::to(FILES_PATH)
}

pub async fn login_page(State(state): State<WebState>, jar: CookieJar) -> Response {
    if session_user(&state, &jar).is_some() {
        return Redirect::to(FILES_PATH).into_response();
    }
    render_login(&state, jar, StatusCode::OK, false)
}

pub async fn login_submit(
    State(state): State<WebState>,
    ClientIp(ip): ClientIp,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    if state.rate_limiter.is_blocked(&ip).await {
        tracing::warn!(peer = %ip, "Login refused, address is rate limited");
        return render_login(&state, jar, StatusCode::TOO_MANY_REQUESTS, true);
    }

    let cookie_token = jar.get(CSRF_COOKIE).map(|c| c.value().to_string());
    if !csrf::tokens_match(cookie_token.as_deref(), form.csrf_token.as_deref()) {
        tracing::warn!(peer = %ip, "Login rejected, CSRF token missing or mismatched");
        state.record_failure(ip).await;
        return render_login(&state, jar, StatusCode::UNAUTHORIZED, true);
    }

    match state
        .check_credentials(ip, &form.username, &form.password)
        .await
    {
        Ok(user) => {
            let token = state.sessions.issue_session(&user);
            let jar = jar
                .remove(csrf::csrf_removal())
                .add(session_cookie(token, state.sessions.ttl(), state.secure_cookies));
            (jar, Redirect::to(FILES_PATH)).into_response()
        }
        Err(GatewayError::RateLimitExceeded) => {
            render_login(&state, jar, StatusCode::TOO_MANY_REQUESTS, true)
        }
        Err(_) => render_login(&state, jar, StatusCode::UNAUTHORIZED, true),
    }
}

pub async fn logout(jar: CookieJar) -> (CookieJar, Redirect) {
    (jar.remove(session_removal()), Redirect::to(LOGIN_PATH))
}

fn render_login(state: &WebState, jar: CookieJar, status: StatusCode, failed: bool) -> Response {
    let token = csrf::generate_token();
    let jar = jar.add(csrf::csrf_cookie(token.clone(), state.secure_cookies));
    let message = if failed {
        format!("<p class=\"error\">{LOGIN_FAILED_MESSAGE}</p>")
    } else {
        String::new()
    };
    let page = format!(
        "<!doctype html>\n<html><head><title>treeshare login</title></head><body>\n\
         {message}\
         <form method=\"post\" action=\"{LOGIN_PATH}\">\n\
         <input type=\"hidden\" name=\"{field}\" value=\"{token}\">\n\
         <label>Username <input name=\"username\" autocomplete=\"username\"></label>\n\
         <label>Password <input name=\"password\" type=\"password\" autocomplete=\"current-password\"></label>\n\
         <button type=\"submit\">Log in</button>\n\
         </form>\n</body></html>\n",
        field = csrf::CSRF_FIELD,
    );
    (status, jar, Html(page)).into_response()
}

/// One row of a JSON directory listing.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryView {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
    pub modified: u64,
    pub parent: bool,
}

impl From<&DirEntry> for EntryView {
    fn from(entry: &DirEntry) -> Self {
        Self {
            name: entry.name.clone(),
            size: entry.size,
            is_dir: entry.is_dir,
            mode: entry.mode,
            modified: entry.mtime_secs(),
            parent: entry.kind == EntryKind::Parent,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListingView {
    pub path: String,
    pub entries: Vec<EntryView>,
}

/// HTTP rendering of a gateway error. The body never carries a path.
pub struct HttpError(GatewayError);

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::PathTraversal | GatewayError::Unsupported(_) => StatusCode::FORBIDDEN,
            GatewayError::ExcludedPath => StatusCode::NOT_FOUND,
            GatewayError::Storage(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                StatusCode::FORBIDDEN
            }
            GatewayError::Storage(_) => StatusCode::NOT_FOUND,
            GatewayError::AuthenticationFailure
            | GatewayError::RateLimitExceeded
            | GatewayError::SessionInvalidOrExpired => StatusCode::FORBIDDEN,
            GatewayError::Protocol(_) | GatewayError::IdleTimeout => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.0.to_string()).into_response()
    }
}

pub async fn files_root(
    State(state): State<WebState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Response, HttpError> {
    serve_path(&state, &user, "").await
}

pub async fn files(
    State(state): State<WebState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(path): Path<String>,
) -> Result<Response, HttpError> {
    serve_path(&state, &user, &path).await
}

async fn serve_path(
    state: &WebState,
    user: &AuthenticatedUser,
    request: &str,
) -> Result<Response, HttpError> {
    match state.guard.open(request).await {
        Ok(Opened::Directory { path, listing }) => {
            tracing::debug!(user = %user.0, path = %path, entries = listing.len(), "HTTP list");
            let view = ListingView {
                path: path.client_path(),
                entries: listing.iter().map(EntryView::from).collect(),
            };
            Ok(Json(view).into_response())
        }
        Ok(Opened::File(file)) => {
            tracing::debug!(user = %user.0, path = %file.path(), "HTTP read");
            let stream = file.stream().await?;
            let body = Body::from_stream(ReaderStream::new(stream));
            Ok((
                [(header::CONTENT_TYPE, "application/octet-stream")],
                body,
            )
                .into_response())
        }
        Err(err) => {
            tracing::debug!(user = %user.0, error = %err, "HTTP request rejected");
            Err(err.into())
        }
    }
}
