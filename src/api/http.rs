//! Blocking HTTP transport on top of `ureq`.
//!
//! Appliances ship self-signed certificates, so verification is off. Status
//! codes are classified here rather than by the agent so error bodies stay
//! available for logging and duplicate detection.
use super::{signals_duplicate, ApiError, ApiRequest, Body, Method, MultipartFile, Session, Transport};
use crate::util::{now_epoch_ms, truncate_string};
use serde_json::Value;
use std::time::{Duration, Instant};
use ureq::tls::TlsConfig;
use ureq::Agent;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const LOG_BODY_BYTES: usize = 200;

pub struct UreqTransport {
    agent: Agent,
    upload_agent: Agent,
    base_url: String,
}

impl UreqTransport {
    /// `base_url` is joined verbatim with each request path.
    pub fn new(base_url: &str) -> Self {
        Self {
            agent: build_agent(REQUEST_TIMEOUT),
            upload_agent: build_agent(UPLOAD_TIMEOUT),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn build_agent(timeout: Duration) -> Agent {
    let tls = TlsConfig::builder().disable_verification(true).build();
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .tls_config(tls)
        .build()
        .into()
}

impl Transport for UreqTransport {
    fn send(&self, session: Option<&Session>, request: &ApiRequest) -> Result<Value, ApiError> {
        let endpoint = request.endpoint();
        let url = format!("{}{}", self.base_url, request.path);
        let authorization = session.map(Session::authorization);
        let started = Instant::now();

        let result = match (&request.method, &request.body) {
            (Method::Get, _) => {
                let mut builder = self.agent.get(&url).header("Accept", "application/json");
                if let Some(value) = authorization {
                    builder = builder.header("Authorization", value);
                }
                for (key, value) in &request.query {
                    builder = builder.query(key, value);
                }
                builder.call()
            }
            (method, body) => {
                let agent = match body {
                    Body::Multipart(_) => &self.upload_agent,
                    _ => &self.agent,
                };
                let mut builder = match method {
                    Method::Put => agent.put(&url),
                    Method::Patch => agent.patch(&url),
                    _ => agent.post(&url),
                }
                .header("Accept", "application/json");
                if let Some(value) = authorization {
                    builder = builder.header("Authorization", value);
                }
                for (key, value) in &request.query {
                    builder = builder.query(key, value);
                }
                match body {
                    Body::Empty => builder.send_empty(),
                    Body::Json(json) => builder.send_json(json),
                    Body::Multipart(file) => {
                        let boundary = format!("----onwatch-populate-{}", now_epoch_ms());
                        let payload = encode_multipart(&boundary, file);
                        builder
                            .header(
                                "Content-Type",
                                format!("multipart/form-data; boundary={boundary}"),
                            )
                            .send(&payload[..])
                    }
                }
            }
        };

        let mut response = result.map_err(|err| {
            tracing::warn!(endpoint = %endpoint, error = %err, "request failed");
            ApiError::Transport {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            }
        })?;
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|err| ApiError::Decode {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            })?;
        tracing::debug!(
            endpoint = %endpoint,
            status,
            elapsed_ms = started.elapsed().as_millis(),
            response_bytes = text.len(),
            "api call complete"
        );
        classify(&endpoint, status, &text)
    }
}

/// Map a status code and body to the transport contract.
pub fn classify(endpoint: &str, status: u16, text: &str) -> Result<Value, ApiError> {
    let success = (200..300).contains(&status);
    if status == 409 || (!success && signals_duplicate(text)) {
        return Err(ApiError::AlreadyExists {
            endpoint: endpoint.to_string(),
            body: truncate_string(text, LOG_BODY_BYTES),
        });
    }
    if !success {
        let body = truncate_string(text, LOG_BODY_BYTES);
        tracing::warn!(endpoint, status, body = %body, "request rejected");
        return Err(ApiError::Status {
            status,
            endpoint: endpoint.to_string(),
            body,
        });
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(err) if trimmed.starts_with('{') || trimmed.starts_with('[') => {
            Err(ApiError::Decode {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })
        }
        Err(_) => Ok(Value::String(trimmed.to_string())),
    }
}

/// Encode a single-file `multipart/form-data` body.
pub fn encode_multipart(boundary: &str, file: &MultipartFile) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.bytes.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            file.field,
            file.file_name.replace('"', "")
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", file.content_type).as_bytes());
    body.extend_from_slice(&file.bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
