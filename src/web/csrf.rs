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

//! Double-submit CSRF tokens for the login form.
//!
//! Each rendered login view gets a fresh random value, written both to the
//! `treeshare_csrf` cookie and to the hidden `csrf_token` form field. A
//! submission is accepted only when the two match.

use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

pub const CSRF_COOKIE: &str = "treeshare_csrf";
pub const CSRF_FIELD: &str = "csrf_token";

const TOKEN_BYTES: usize = 32;

/// Generate a new random token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare the cookie and form values in constant time.
///
/// Missing or empty values never match.
pub fn tokens_match(cookie: Option<&str>, form: Option<&str>) -> bool {
    match (cookie, form) {
        (Some(cookie), Some(form)) if !cookie.is_empty() && !form.is_empty() => {
            bool::from(cookie.as_bytes().ct_eq(form.as_bytes()))
        }
        _ => false,
    }
}

/// The cookie carrying `token`, scoped to the login path.
pub fn csrf_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((CSRF_COOKIE, token))
        .path("/login")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .build()
}

/// A removal cookie matching [`csrf_cookie`]'s path.
pub fn csrf_removal() -> Cookie<'static> {
    Cookie::build(CSRF_COOKIE).path("/login").build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_fresh() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE_NO_PAD.decode(&a).unwrap().len(), TOKEN_BYTES);
    }

    #[test]
    fn test_matching() {
        let token = generate_token();
        assert!(tokens_match(Some(&token), Some(&token)));
        assert!(!tokens_match(Some(&token), Some(&generate_token())));
        assert!(!tokens_match(None, Some(&token)));
        assert!(!tokens_match(Some(&token), None));
        assert!(!tokens_match(Some(""), Some("")));
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = csrf_cookie("abc".into(), false);
        assert_eq!(cookie.name(), CSRF_COOKIE);
        assert_eq!(cookie.path(), Some("/login"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
    }
}
