//! Transport boundary for the OnWatch REST/GraphQL surface.
//!
//! Everything above this module speaks `ApiRequest` and `serde_json::Value`;
//! the HTTP details live in `http` so tests can swap in a scripted transport.
pub mod gateway;
pub mod http;
pub mod shape;
pub mod version;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::fmt;

pub use gateway::{Gateway, ListOptions, Listing};
pub use version::PlatformVersion;

/// Typed failures at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{endpoint}: transport failure: {message}")]
    Transport { endpoint: String, message: String },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },
    #[error("{endpoint}: already exists: {body}")]
    AlreadyExists { endpoint: String, body: String },
    #[error("{endpoint}: decode response: {message}")]
    Decode { endpoint: String, message: String },
    #[error("{endpoint}: GraphQL errors: {errors}")]
    Graphql { endpoint: String, errors: String },
}

impl ApiError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }
}

/// True when an error chain carries a create-time duplicate signal.
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ApiError>()
            .is_some_and(ApiError::is_already_exists)
    })
}

/// Bodies carrying one of these markers are duplicates regardless of status.
pub fn signals_duplicate(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("already exist") || lower.contains("alreadyexists")
}

/// Authenticated session, constructed once at login and passed to every call.
#[derive(Clone)]
pub struct Session {
    authorization: String,
}

impl Session {
    pub fn bearer(token: &str) -> Self {
        Self {
            authorization: format!("Bearer {token}"),
        }
    }

    pub fn basic(username: &str, password: &str) -> Self {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        Self {
            authorization: format!("Basic {encoded}"),
        }
    }

    pub fn authorization(&self) -> &str {
        &self.authorization
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self
            .authorization
            .split_whitespace()
            .next()
            .unwrap_or_default();
        f.debug_struct("Session")
            .field("scheme", &scheme)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
        }
    }
}

/// One file part of a multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartFile {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(Value),
    Multipart(MultipartFile),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Body,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::with_json(Method::Post, path, body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::with_json(Method::Put, path, body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::with_json(Method::Patch, path, body)
    }

    pub fn upload(path: impl Into<String>, file: MultipartFile) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Body::Multipart(file),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }

    fn with_json(method: Method, path: impl Into<String>, body: Value) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: Body::Json(body),
        }
    }
}

/// Sends one request and returns the decoded JSON body (`Null` when empty).
pub trait Transport {
    fn send(&self, session: Option<&Session>, request: &ApiRequest) -> Result<Value, ApiError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, session: Option<&Session>, request: &ApiRequest) -> Result<Value, ApiError> {
        (**self).send(session, request)
    }
}

/// Read an opaque identifier that may be serialized as a string or a number.
pub fn id_of(value: &Value) -> Option<String> {
    id_field(value, "id")
}

pub fn id_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_markers_are_case_insensitive() {
        assert!(signals_duplicate("Subject Already Exists"));
        assert!(signals_duplicate("{\"code\":\"InquiryCaseAlreadyExists\"}"));
        assert!(!signals_duplicate("validation failed"));
    }

    #[test]
    fn already_exists_is_found_through_context() {
        let err = anyhow::Error::new(ApiError::AlreadyExists {
            endpoint: "POST /groups".to_string(),
            body: String::new(),
        })
        .context("create group Cardholders");
        assert!(is_already_exists(&err));

        let other = anyhow::Error::new(ApiError::Status {
            status: 500,
            endpoint: "POST /groups".to_string(),
            body: String::new(),
        });
        assert!(!is_already_exists(&other));
    }

    #[test]
    fn basic_session_encodes_credentials() {
        let session = Session::basic("admin", "secret");
        assert_eq!(session.authorization(), "Basic YWRtaW46c2VjcmV0");
        assert_eq!(Session::bearer("t0k").authorization(), "Bearer t0k");
    }

    #[test]
    fn list_options_are_exported_at_the_api_root() {
        let all = ListOptions::default();
        assert!(all.fetch_all);
        assert_eq!(all.page_size, None);
        let first = ListOptions::first_page(25);
        assert!(!first.fetch_all);
        assert_eq!(first.page_size, Some(25));
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        assert_eq!(id_of(&json!({"id": "abc"})), Some("abc".to_string()));
        assert_eq!(id_of(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(id_of(&json!({"id": ""})), None);
        assert_eq!(id_of(&json!({})), None);
    }
}
