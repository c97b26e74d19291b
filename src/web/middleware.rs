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

//! Session gate in front of every protected route.
//!
//! A request passes with a valid session cookie, or with a valid Basic
//! `Authorization` header (which also mints a session cookie). Anything else
//! is redirected to the login view; there is no separate error path for data
//! endpoints.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::typed_header::TypedHeaderRejection;
use axum_extra::TypedHeader;

use super::{WebState, LOGIN_PATH};

pub const SESSION_COOKIE: &str = "treeshare_session";

/// The username attached to a request that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Source address of the request, or `0.0.0.0` when the server was not
/// started with connect info (e.g. when driving the router directly).
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Ok(ClientIp(ip))
    }
}

pub fn session_cookie(token: String, ttl: Duration, secure: bool) -> Cookie<'static> {
    let max_age = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(cookie::time::Duration::seconds(max_age))
        .build()
}

pub fn session_removal() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}

/// Username from a valid session cookie, if any.
pub fn session_user(state: &WebState, jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.validate_session(cookie.value()))
}

pub async fn require_session(
    State(state): State<WebState>,
    ClientIp(ip): ClientIp,
    jar: CookieJar,
    basic: Result<TypedHeader<Authorization<Basic>>, TypedHeaderRejection>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(user) = session_user(&state, &jar) {
        request.extensions_mut().insert(AuthenticatedUser(user));
        return next.run(request).await;
    }

    if let Ok(TypedHeader(basic)) = basic {
        if let Ok(user) = state
            .check_credentials(ip, basic.username(), basic.password())
            .await
        {
            let token = state.sessions.issue_session(&user);
            let cookie = session_cookie(token, state.sessions.ttl(), state.secure_cookies);
            request.extensions_mut().insert(AuthenticatedUser(user));
            let response = next.run(request).await;
            return (jar.add(cookie), response).into_response();
        }
    }

    tracing::debug!(path = %request.uri().path(), "Unauthenticated request redirected");
    Redirect::to(LOGIN_PATH).into_response()
}
