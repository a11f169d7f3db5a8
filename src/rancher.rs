//! Rancher v3 client for the workload environment of the analytics engine.
//!
//! The v3 API has no partial update for container environments, so changes
//! are a GET/merge/PUT of the whole workload. Nothing guards against another
//! writer between the GET and the PUT; the last write wins.
use crate::api::{ApiRequest, Session, Transport};
use crate::config::DEFAULT_WORKLOAD_ID;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use url::Url;

pub const DEFAULT_NAMESPACE: &str = "default";

const CONTAINER_LOCATIONS: [&str; 3] = ["/containers", "/spec/containers", "/workload/containers"];

/// Workload and (optionally) project named by a `workload_path` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub workload_id: String,
    pub project_id: Option<String>,
}

impl Default for WorkloadRef {
    fn default() -> Self {
        Self {
            workload_id: DEFAULT_WORKLOAD_ID.to_string(),
            project_id: None,
        }
    }
}

impl WorkloadRef {
    /// Namespace segment of a `kind:namespace:name` workload id.
    pub fn namespace(&self) -> &str {
        self.workload_id
            .split(':')
            .nth(1)
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }
}

/// Parse a Rancher UI link, full or path-only, e.g.
/// `/p/local:p-p6l45/workloads/run?workloadId=statefulset%3Adefault%3Acv-engine`.
pub fn parse_workload_path(workload_path: &str) -> Result<WorkloadRef> {
    let trimmed = workload_path.trim();
    if trimmed.is_empty() {
        return Ok(WorkloadRef::default());
    }
    let url = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse("https://rancher.invalid/").and_then(|root| root.join(trimmed))
    }
    .with_context(|| format!("parse workload path {trimmed}"))?;

    let workload_id = url
        .query_pairs()
        .find(|(key, _)| key == "workloadId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_WORKLOAD_ID.to_string());
    let project_id = url.path_segments().and_then(|segments| {
        let segments: Vec<&str> = segments.collect();
        segments
            .windows(2)
            .find(|pair| pair[0] == "p" && !pair[1].is_empty())
            .map(|pair| pair[1].to_string())
    });
    Ok(WorkloadRef {
        workload_id,
        project_id,
    })
}

/// Overwrite or add each declared key. Keys absent from `declared` are kept.
pub fn merge_env(environment: &mut Map<String, Value>, declared: &BTreeMap<String, String>) {
    for (key, value) in declared {
        environment.insert(key.clone(), Value::String(value.clone()));
    }
}

fn unwrap_data(workload: Value) -> Value {
    match workload {
        Value::Object(mut fields) if matches!(fields.get("data"), Some(Value::Object(_))) => {
            fields.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn is_init_container(container: &Value) -> bool {
    container
        .get("initContainer")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// The first container that is not an init container.
pub fn main_container_mut(workload: &mut Value) -> Result<&mut Map<String, Value>> {
    let location = CONTAINER_LOCATIONS
        .into_iter()
        .find(|pointer| {
            workload
                .pointer(pointer)
                .and_then(Value::as_array)
                .is_some_and(|containers| !containers.is_empty())
        })
        .ok_or_else(|| anyhow!("workload has no containers"))?;
    let containers = workload
        .pointer_mut(location)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow!("workload has no containers"))?;
    let total = containers.len();
    containers
        .iter_mut()
        .find(|container| !is_init_container(container))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| anyhow!("no main container in workload ({total} container(s), all init containers)"))
}

/// Environment of the main container as text values.
pub fn environment_of(workload: &Value) -> BTreeMap<String, String> {
    let mut workload = workload.clone();
    let Ok(container) = main_container_mut(&mut workload) else {
        return BTreeMap::new();
    };
    container
        .get("environment")
        .and_then(Value::as_object)
        .map(|env| {
            env.iter()
                .map(|(key, value)| (key.clone(), crate::config::scalar_text(value)))
                .collect()
        })
        .unwrap_or_default()
}

pub struct RancherClient<'a> {
    transport: &'a dyn Transport,
    session: Session,
}

impl<'a> RancherClient<'a> {
    /// Token login, falling back to basic auth checked against `/v3/projects`.
    pub fn login(transport: &'a dyn Transport, username: &str, password: &str) -> Result<Self> {
        let request = ApiRequest::post(
            "/v3-public/localProviders/local",
            json!({ "username": username, "password": password, "responseType": "token" }),
        )
        .query("action", "login");
        let token = match transport.send(None, &request) {
            Ok(response) => response
                .get("token")
                .or_else(|| response.get("data").and_then(|data| data.get("token")))
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            Err(err) => {
                tracing::debug!(error = %err, "Rancher token login failed, trying basic auth");
                None
            }
        };
        if let Some(token) = token {
            tracing::info!("logged in to Rancher");
            return Ok(Self {
                transport,
                session: Session::bearer(&token),
            });
        }
        let session = Session::basic(username, password);
        transport
            .send(Some(&session), &ApiRequest::get("/v3/projects"))
            .with_context(|| format!("Rancher login as {username} (token and basic auth)"))?;
        tracing::info!("logged in to Rancher with basic auth");
        Ok(Self { transport, session })
    }

    fn send(&self, request: &ApiRequest) -> Result<Value> {
        Ok(self.transport.send(Some(&self.session), request)?)
    }

    /// Project holding `namespace`, from the local cluster's namespace list.
    pub fn discover_project(&self, namespace: &str) -> Result<String> {
        let listing = self
            .send(
                &ApiRequest::get("/v3/cluster/local/namespaces")
                    .query("limit", "-1")
                    .query("sort", "name"),
            )
            .context("list Rancher namespaces")?;
        let namespaces = listing
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let entry = namespaces
            .iter()
            .find(|entry| entry.get("name").and_then(Value::as_str) == Some(namespace))
            .ok_or_else(|| anyhow!("namespace {namespace} not found in Rancher"))?;
        let project = entry
            .get("projectId")
            .and_then(Value::as_str)
            .filter(|project| !project.is_empty())
            .ok_or_else(|| anyhow!("namespace {namespace} has no projectId"))?;
        tracing::info!(namespace, project, "discovered Rancher project");
        Ok(project.to_string())
    }

    fn workload_path(project_id: &str, workload_id: &str) -> String {
        format!("/v3/project/{project_id}/workloads/{workload_id}")
    }

    pub fn get_workload(&self, project_id: &str, workload_id: &str) -> Result<Value> {
        let workload = self
            .send(&ApiRequest::get(Self::workload_path(project_id, workload_id)))
            .with_context(|| format!("get workload {workload_id} in project {project_id}"))?;
        let workload = unwrap_data(workload);
        if !workload.is_object() {
            bail!("workload {workload_id} is not a JSON object");
        }
        Ok(workload)
    }

    /// Merge `declared` into the main container and PUT the workload back.
    pub fn set_env_vars(
        &self,
        project_id: &str,
        workload_id: &str,
        declared: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut workload = self.get_workload(project_id, workload_id)?;
        let container = main_container_mut(&mut workload)
            .with_context(|| format!("workload {workload_id}"))?;
        let environment = container
            .entry("environment")
            .or_insert_with(|| Value::Object(Map::new()));
        if !environment.is_object() {
            *environment = Value::Object(Map::new());
        }
        if let Value::Object(environment) = environment {
            merge_env(environment, declared);
        }
        self.send(&ApiRequest::put(
            Self::workload_path(project_id, workload_id),
            workload,
        ))
        .with_context(|| format!("update workload {workload_id}"))?;
        tracing::info!(workload = workload_id, count = declared.len(), "workload environment updated");
        Ok(())
    }

    /// Re-read the workload and return the declared keys whose live value matches.
    pub fn confirmed_env_vars(
        &self,
        project_id: &str,
        workload_id: &str,
        declared: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let live = environment_of(&self.get_workload(project_id, workload_id)?);
        Ok(declared
            .iter()
            .filter(|(key, value)| live.get(*key) == Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
