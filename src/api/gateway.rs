//! Typed verbs over the transport: login, paginated listing, create/patch,
//! uploads and GraphQL operations.
//!
//! The gateway never retries; callers decide what a failure means.
use super::shape::{normalize, records_or_empty, reported_total, Shape};
use super::version::SubjectListing;
use super::{
    signals_duplicate, ApiError, ApiRequest, MultipartFile, PlatformVersion, Session, Transport,
};
use crate::util::{file_name_of, guess_content_type};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub page_size: Option<usize>,
    pub fetch_all: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page_size: None,
            fetch_all: true,
        }
    }
}

impl ListOptions {
    pub fn first_page(page_size: usize) -> Self {
        Self {
            page_size: Some(page_size),
            fetch_all: false,
        }
    }
}

/// Result of a listing call.
#[derive(Debug, Clone, PartialEq)]
pub enum Listing {
    /// Every record across all pages, in server order.
    All(Vec<Value>),
    /// The first page exactly as the server returned it.
    FirstPage(Value),
}

impl Listing {
    pub fn into_records(self, endpoint: &str) -> Vec<Value> {
        match self {
            Listing::All(records) => records,
            Listing::FirstPage(raw) => records_or_empty(raw, endpoint),
        }
    }
}

pub struct Gateway<'a> {
    transport: &'a dyn Transport,
    session: Session,
    version: PlatformVersion,
}

impl<'a> Gateway<'a> {
    /// Authenticate and return a gateway bound to the new session.
    pub fn login(
        transport: &'a dyn Transport,
        version: PlatformVersion,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let request = ApiRequest::post(
            "/login",
            json!({ "username": username, "password": password }),
        );
        let response = transport
            .send(None, &request)
            .with_context(|| format!("log in as {username}"))?;
        let token = ["token", "accessToken"]
            .iter()
            .find_map(|key| response.get(key).and_then(Value::as_str))
            .or_else(|| {
                response
                    .get("data")
                    .and_then(|data| data.get("token"))
                    .and_then(Value::as_str)
            })
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow!("login response carried no token"))?;
        tracing::info!(version = %version, "logged in to OnWatch");
        Ok(Self::with_session(transport, Session::bearer(token), version))
    }

    pub fn with_session(
        transport: &'a dyn Transport,
        session: Session,
        version: PlatformVersion,
    ) -> Self {
        Self {
            transport,
            session,
            version,
        }
    }

    pub fn version(&self) -> PlatformVersion {
        self.version
    }

    pub fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self.transport.send(Some(&self.session), request)
    }

    pub fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.send(&ApiRequest::get(path))
    }

    pub fn create(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.send(&ApiRequest::post(path, body))
    }

    pub fn patch(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.send(&ApiRequest::patch(path, body))
    }

    pub fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.send(&ApiRequest::put(path, body))
    }

    /// Upload a local file as a single multipart field.
    pub fn upload_file(&self, path: &str, field: &str, file_path: &Path) -> Result<Value> {
        let bytes =
            fs::read(file_path).with_context(|| format!("read {}", file_path.display()))?;
        let file = MultipartFile {
            field: field.to_string(),
            file_name: file_name_of(file_path),
            content_type: guess_content_type(file_path).to_string(),
            bytes,
        };
        let value = self.send(&ApiRequest::upload(path, file))?;
        Ok(value)
    }

    /// Run a GraphQL operation and return its `data` member.
    pub fn graphql(&self, operation: &str, query: &str, variables: Value) -> Result<Value, ApiError> {
        let request = ApiRequest::post(
            "/graphql",
            json!({
                "operationName": operation,
                "variables": variables,
                "query": query,
            }),
        );
        let mut response = self.send(&request)?;
        if let Some(errors) = response.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let text = Value::Array(errors.clone()).to_string();
                let endpoint = format!("graphql {operation}");
                if signals_duplicate(&text) {
                    return Err(ApiError::AlreadyExists {
                        endpoint,
                        body: text,
                    });
                }
                return Err(ApiError::Graphql {
                    endpoint,
                    errors: text,
                });
            }
        }
        Ok(response
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// List a collection with `offset`/`limit` query paging.
    pub fn list(&self, path: &str, options: ListOptions) -> Result<Listing, ApiError> {
        self.paginate(path, options, |offset, limit| {
            self.send(
                &ApiRequest::get(path)
                    .query("offset", offset)
                    .query("limit", limit),
            )
        })
    }

    pub fn list_all(&self, path: &str) -> Result<Vec<Value>, ApiError> {
        Ok(self
            .list(path, ListOptions::default())?
            .into_records(path))
    }

    /// List subjects through whichever endpoint family this version exposes.
    pub fn list_subjects(&self, options: ListOptions) -> Result<Listing, ApiError> {
        match self.version.subject_listing() {
            SubjectListing::Query => self.list("/subjects", options),
            SubjectListing::Search => self.paginate("/subjects/search", options, |offset, limit| {
                self.create(
                    "/subjects/search",
                    json!({ "offset": offset, "limit": limit }),
                )
            }),
        }
    }

    fn paginate(
        &self,
        endpoint: &str,
        options: ListOptions,
        fetch: impl Fn(usize, usize) -> Result<Value, ApiError>,
    ) -> Result<Listing, ApiError> {
        let page_size = options.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = fetch(offset, page_size)?;
            if !options.fetch_all {
                return Ok(Listing::FirstPage(page));
            }
            let total = reported_total(&page);
            match normalize(page) {
                Shape::Records(batch) => {
                    let count = batch.len();
                    records.extend(batch);
                    offset += count;
                    if count < page_size || total.is_some_and(|total| records.len() >= total) {
                        break;
                    }
                }
                Shape::Unrecognized(raw) => {
                    tracing::debug!(
                        endpoint,
                        offset,
                        payload = %crate::util::truncate_string(&raw.to_string(), 200),
                        "unrecognized page shape; keeping accumulated records"
                    );
                    break;
                }
            }
        }
        tracing::debug!(endpoint, records = records.len(), "listing complete");
        Ok(Listing::All(records))
    }
}
