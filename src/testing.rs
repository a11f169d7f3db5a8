//! In-memory transports for driving the gateway, workflows and stages
//! without a network.
use crate::api::{ApiError, ApiRequest, Body, Method, Session, Transport};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Replays canned responses in order and records every request.
pub struct ScriptedTransport {
    responses: RefCell<VecDeque<Result<Value, ApiError>>>,
    requests: RefCell<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Value, ApiError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.borrow().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, _session: Option<&Session>, request: &ApiRequest) -> Result<Value, ApiError> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("no scripted response for {}", request.endpoint()))
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    groups: Vec<Value>,
    camera_groups: Vec<Value>,
    cameras: Vec<Value>,
    roles: Vec<Value>,
    users: Vec<Value>,
    user_groups: Vec<Value>,
    subjects: Vec<Value>,
    inquiry_cases: Vec<Value>,
    case_files: BTreeMap<String, Vec<Value>>,
    uploads: BTreeMap<String, Value>,
    mass_imports: BTreeMap<String, Value>,
    kv: BTreeMap<String, String>,
    settings: Value,
    acknowledge_actions: Vec<Value>,
    acknowledge_enabled: bool,
    graphql_calls: Vec<(String, Value)>,
    requests: Vec<String>,
    failures: HashSet<String>,
    strip_primary_flags: bool,
    /// Case files stay invisible to listing for this many polls.
    file_registration_delay: usize,
}

/// A small stateful stand-in for the appliance REST/GraphQL surface.
pub struct FakeOnWatch {
    state: RefCell<FakeState>,
}

impl Default for FakeOnWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOnWatch {
    pub fn new() -> Self {
        let state = FakeState {
            roles: vec![
                json!({ "id": "role-admin", "title": "Admin" }),
                json!({ "id": "role-operator", "title": "Operator" }),
                json!({ "id": "role-super", "title": "Super Admin" }),
            ],
            settings: json!({
                "defaultFaceThreshold": 0.6,
                "whiteLabel": { "productName": "OnWatch", "companyLogo": "old.png" },
                "applicationSettings": { "watchVideo": { "secondsAfterDetection": "3" } },
            }),
            ..FakeState::default()
        };
        Self {
            state: RefCell::new(state),
        }
    }

    /// Make every request whose `METHOD /path` starts with `prefix` fail with HTTP 500.
    pub fn fail(&self, prefix: &str) {
        self.state.borrow_mut().failures.insert(prefix.to_string());
    }

    pub fn strip_primary_flags(&self) {
        self.state.borrow_mut().strip_primary_flags = true;
    }

    pub fn delay_file_registration(&self, polls: usize) {
        self.state.borrow_mut().file_registration_delay = polls;
    }

    pub fn seed_group(&self, title: &str) -> String {
        let mut state = self.state.borrow_mut();
        let id = state.id("group");
        state
            .groups
            .push(json!({ "id": id, "title": title, "name": title }));
        id
    }

    pub fn seed_camera_group(&self, title: &str) -> String {
        let mut state = self.state.borrow_mut();
        let id = state.id("cg");
        state.camera_groups.push(json!({ "id": id, "title": title }));
        id
    }

    pub fn seed_subject(&self, name: &str, images: Vec<Value>) -> String {
        let mut state = self.state.borrow_mut();
        let id = state.id("subject");
        state
            .subjects
            .push(json!({ "id": id, "name": name, "images": images }));
        id
    }

    pub fn seed_inquiry_case(&self, name: &str) -> String {
        let mut state = self.state.borrow_mut();
        let id = state.id("case");
        state.inquiry_cases.push(json!({ "id": id, "name": name }));
        id
    }

    pub fn groups(&self) -> Vec<Value> {
        self.state.borrow().groups.clone()
    }

    pub fn camera_groups(&self) -> Vec<Value> {
        self.state.borrow().camera_groups.clone()
    }

    pub fn cameras(&self) -> Vec<Value> {
        self.state.borrow().cameras.clone()
    }

    pub fn users(&self) -> Vec<Value> {
        self.state.borrow().users.clone()
    }

    pub fn user_groups(&self) -> Vec<Value> {
        self.state.borrow().user_groups.clone()
    }

    pub fn subjects(&self) -> Vec<Value> {
        self.state.borrow().subjects.clone()
    }

    pub fn inquiry_cases(&self) -> Vec<Value> {
        self.state.borrow().inquiry_cases.clone()
    }

    pub fn case_files(&self, case_id: &str) -> Vec<Value> {
        self.state
            .borrow()
            .case_files
            .get(case_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn settings(&self) -> Value {
        self.state.borrow().settings.clone()
    }

    pub fn kv(&self, key: &str) -> Option<String> {
        self.state.borrow().kv.get(key).cloned()
    }

    pub fn acknowledge_enabled(&self) -> bool {
        self.state.borrow().acknowledge_enabled
    }

    pub fn acknowledge_actions(&self) -> Vec<Value> {
        self.state.borrow().acknowledge_actions.clone()
    }

    pub fn mass_imports(&self) -> Vec<Value> {
        self.state.borrow().mass_imports.values().cloned().collect()
    }

    pub fn graphql_calls(&self, operation: &str) -> Vec<Value> {
        self.state
            .borrow()
            .graphql_calls
            .iter()
            .filter(|(name, _)| name == operation)
            .map(|(_, variables)| variables.clone())
            .collect()
    }

    /// Every request seen so far as `METHOD /path`.
    pub fn requests(&self) -> Vec<String> {
        self.state.borrow().requests.clone()
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|seen| seen.as_str() == endpoint)
            .count()
    }
}

impl FakeState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

fn json_body(request: &ApiRequest) -> Value {
    match &request.body {
        Body::Json(value) => value.clone(),
        _ => Value::Null,
    }
}

fn text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn query_usize(request: &ApiRequest, key: &str) -> Option<usize> {
    request
        .query
        .iter()
        .find(|(name, _)| name == key)
        .and_then(|(_, value)| value.parse().ok())
}

fn page(records: &[Value], offset: usize, limit: usize) -> Value {
    Value::Array(records.iter().skip(offset).take(limit).cloned().collect())
}

fn paged(records: &[Value], request: &ApiRequest) -> Value {
    page(
        records,
        query_usize(request, "offset").unwrap_or(0),
        query_usize(request, "limit").unwrap_or(usize::MAX),
    )
}

fn duplicate(endpoint: &str, name: &str) -> ApiError {
    ApiError::AlreadyExists {
        endpoint: endpoint.to_string(),
        body: format!("{name} already exists"),
    }
}

fn not_found(endpoint: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        endpoint: endpoint.to_string(),
        body: "not found".to_string(),
    }
}

fn has_title(records: &[Value], key: &str, name: &str) -> bool {
    records
        .iter()
        .any(|record| text(record, key).eq_ignore_ascii_case(name))
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                merge(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

impl Transport for FakeOnWatch {
    fn send(&self, session: Option<&Session>, request: &ApiRequest) -> Result<Value, ApiError> {
        let endpoint = request.endpoint();
        let mut state = self.state.borrow_mut();
        state.requests.push(endpoint.clone());
        if state
            .failures
            .iter()
            .any(|prefix| endpoint.starts_with(prefix.as_str()))
        {
            return Err(ApiError::Status {
                status: 500,
                endpoint,
                body: "injected failure".to_string(),
            });
        }
        if session.is_none() && request.path != "/login" {
            return Err(ApiError::Status {
                status: 401,
                endpoint,
                body: "unauthorized".to_string(),
            });
        }
        let body = json_body(request);
        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        match (request.method, segments.as_slice()) {
            (Method::Post, ["login"]) => Ok(json!({ "token": "fake-token" })),
            (Method::Get, ["groups"]) => Ok(paged(&state.groups, request)),
            (Method::Post, ["groups"]) => {
                let title = text(&body, "title");
                if has_title(&state.groups, "title", &title) {
                    return Err(duplicate(&endpoint, &title));
                }
                let id = state.id("group");
                let mut record = body.clone();
                record["id"] = json!(id);
                record["name"] = json!(title);
                state.groups.push(record.clone());
                Ok(record)
            }
            (Method::Get, ["camera-groups"]) => Ok(paged(&state.camera_groups, request)),
            (Method::Post, ["camera-groups"]) => {
                let title = text(&body, "title");
                if has_title(&state.camera_groups, "title", &title) {
                    return Err(duplicate(&endpoint, &title));
                }
                let id = state.id("cg");
                let mut record = body.clone();
                record["id"] = json!(id);
                state.camera_groups.push(record.clone());
                Ok(record)
            }
            (Method::Get, ["cameras"]) => Ok(json!({ "items": paged(&state.cameras, request) })),
            (Method::Get, ["roles"]) => Ok(paged(&state.roles, request)),
            (Method::Get, ["users"]) => Ok(paged(&state.users, request)),
            (Method::Post, ["users"]) => {
                let username = text(&body, "username");
                if has_title(&state.users, "username", &username) {
                    return Err(duplicate(&endpoint, &username));
                }
                let id = state.id("user");
                let mut record = body.clone();
                record["id"] = json!(id);
                state.users.push(record.clone());
                Ok(record)
            }
            (Method::Get, ["user-groups"]) => Ok(paged(&state.user_groups, request)),
            (Method::Post, ["user-groups"]) => {
                let title = text(&body, "title");
                if has_title(&state.user_groups, "title", &title) {
                    return Err(duplicate(&endpoint, &title));
                }
                let id = state.id("ug");
                let mut record = body.clone();
                record["id"] = json!(id);
                state.user_groups.push(record.clone());
                Ok(record)
            }
            (Method::Get, ["subjects"]) => Ok(json!({ "items": paged(&state.subjects, request) })),
            (Method::Post, ["subjects", "search"]) => {
                let offset = body["offset"].as_u64().unwrap_or(0) as usize;
                let limit = body["limit"].as_u64().unwrap_or(u64::MAX) as usize;
                Ok(json!({ "items": page(&state.subjects, offset, limit), "total": state.subjects.len() }))
            }
            (Method::Post, ["subjects"]) => {
                let name = text(&body, "name");
                if has_title(&state.subjects, "name", &name) {
                    return Err(duplicate(&endpoint, &name));
                }
                let id = state.id("subject");
                let mut record = body.clone();
                record["id"] = json!(id);
                if state.strip_primary_flags {
                    strip_primaries(&mut record);
                }
                state.subjects.push(record.clone());
                Ok(record)
            }
            (Method::Get, ["subjects", id]) => state
                .subjects
                .iter()
                .find(|subject| text(subject, "id") == *id)
                .cloned()
                .ok_or_else(|| not_found(&endpoint)),
            (Method::Patch, ["subjects", id]) => {
                let strip = state.strip_primary_flags;
                let subject = state
                    .subjects
                    .iter_mut()
                    .find(|subject| text(subject, "id") == *id)
                    .ok_or_else(|| not_found(&endpoint))?;
                if let Some(images) = body.get("images") {
                    subject["images"] = images.clone();
                }
                if strip {
                    strip_primaries(subject);
                }
                Ok(subject.clone())
            }
            (Method::Post, ["external-functions", "extract-faces-from-image"]) => {
                let file_name = match &request.body {
                    Body::Multipart(file) => file.file_name.clone(),
                    _ => String::new(),
                };
                if file_name.contains("noface") {
                    return Ok(json!({ "items": [] }));
                }
                Ok(json!({
                    "items": [{
                        "objectType": 1,
                        "featuresQuality": 0.93,
                        "url": format!("/storage/faces/{file_name}"),
                        "features": [0.1, 0.2, 0.3],
                        "landmarkScore": 0.88,
                        "featuresId": format!("feat-{file_name}"),
                    }]
                }))
            }
            (Method::Get, ["inquiry-cases"]) => Ok(paged(&state.inquiry_cases, request)),
            (Method::Post, ["inquiry-cases"]) => {
                let name = text(&body, "name");
                if state
                    .inquiry_cases
                    .iter()
                    .any(|case| text(case, "name") == name)
                {
                    return Err(ApiError::AlreadyExists {
                        endpoint,
                        body: "InquiryCaseAlreadyExists".to_string(),
                    });
                }
                let id = state.id("case");
                let record = json!({ "id": id, "name": name, "priority": 101 });
                state.inquiry_cases.push(record.clone());
                Ok(record)
            }
            (Method::Patch, ["inquiry-cases", id]) => {
                let case = state
                    .inquiry_cases
                    .iter_mut()
                    .find(|case| text(case, "id") == *id)
                    .ok_or_else(|| not_found(&endpoint))?;
                merge(case, &body);
                Ok(case.clone())
            }
            (Method::Post, ["upload", "prepare", "forensic"]) => {
                let id = state.id("upload");
                state.uploads.insert(id.clone(), body.clone());
                Ok(json!({ "uploadId": id }))
            }
            (Method::Post, ["upload", "forensic", id]) => {
                if !state.uploads.contains_key(*id) {
                    return Err(not_found(&endpoint));
                }
                Ok(Value::Null)
            }
            (Method::Post, ["inquiry-cases", id, "files"]) => {
                let case_id = id.to_string();
                let analysis = state.id("camera");
                let file = json!({
                    "id": state.id("file"),
                    "uploadId": body["uploadId"],
                    "fileName": body["fileName"],
                    "threshold": body["threshold"],
                    "cameraId": analysis,
                    "status": "analyzing",
                });
                state.case_files.entry(case_id).or_default().push(file.clone());
                Ok(file)
            }
            (Method::Get, ["inquiry-cases", id, "files"]) => {
                if state.file_registration_delay > 0 {
                    state.file_registration_delay -= 1;
                    return Ok(json!({ "items": [] }));
                }
                Ok(json!({ "items": state.case_files.get(*id).cloned().unwrap_or_default() }))
            }
            (Method::Get, ["settings"]) => Ok(state.settings.clone()),
            (Method::Patch, ["settings"]) => {
                merge(&mut state.settings, &body);
                Ok(state.settings.clone())
            }
            (Method::Get, ["settings", "kv"]) => Ok(Value::Array(
                state
                    .kv
                    .iter()
                    .map(|(key, value)| json!({ "key": key, "value": value }))
                    .collect(),
            )),
            (Method::Patch, ["acknowledge-actions", "action-enforcement"]) => {
                state.acknowledge_enabled = body["isEnabled"].as_bool().unwrap_or(false);
                Ok(json!({ "isEnabled": state.acknowledge_enabled }))
            }
            (Method::Post, ["acknowledge-actions"]) => {
                let title = text(&body, "title");
                if has_title(&state.acknowledge_actions, "title", &title) {
                    return Err(duplicate(&endpoint, &title));
                }
                let id = state.id("ack");
                let record = json!({ "id": id, "title": title });
                state.acknowledge_actions.push(record.clone());
                Ok(record)
            }
            (Method::Post, ["upload", "prepare", "static-files"]) => {
                let id = state.id("static");
                state.uploads.insert(id.clone(), body.clone());
                Ok(json!([{ "id": id }]))
            }
            (Method::Post, ["upload", "static-files", id]) => {
                if !state.uploads.contains_key(*id) {
                    return Err(not_found(&endpoint));
                }
                Ok(Value::Null)
            }
            (Method::Get, ["mass-import", "quota"]) => Ok(json!({ "remaining": 10000 })),
            (Method::Post, ["upload", "prepare", "mass-import"]) => {
                let name = text(&body, "name");
                if state
                    .mass_imports
                    .values()
                    .any(|import| text(import, "name") == name)
                {
                    return Err(duplicate(&endpoint, &name));
                }
                let id = state.id("mass");
                let mut record = body.clone();
                record["id"] = json!(id);
                record["status"] = json!("pending");
                state.mass_imports.insert(id.clone(), record);
                Ok(json!({ "id": id }))
            }
            (Method::Post, ["upload", "mass-import", id]) => {
                let import = state
                    .mass_imports
                    .get_mut(*id)
                    .ok_or_else(|| not_found(&endpoint))?;
                import["status"] = json!("processing");
                Ok(Value::Null)
            }
            (Method::Get, ["mass-import", id]) => state
                .mass_imports
                .get(*id)
                .cloned()
                .ok_or_else(|| not_found(&endpoint)),
            (Method::Post, ["graphql"]) => {
                let operation = text(&body, "operationName");
                let variables = body.get("variables").cloned().unwrap_or(Value::Null);
                state
                    .graphql_calls
                    .push((operation.clone(), variables.clone()));
                graphql(&mut state, &operation, &variables)
            }
            _ => Err(not_found(&endpoint)),
        }
    }
}

fn strip_primaries(subject: &mut Value) {
    if let Some(images) = subject.get_mut("images").and_then(Value::as_array_mut) {
        for image in images {
            image["isPrimary"] = json!(false);
        }
    }
}

fn graphql(state: &mut FakeState, operation: &str, variables: &Value) -> Result<Value, ApiError> {
    let data = match operation {
        "addCamera" => {
            let input = &variables["camera"];
            let title = text(input, "title");
            if has_title(&state.cameras, "title", &title) {
                return Ok(json!({ "errors": [{ "message": format!("Camera {title} already exists") }] }));
            }
            let id = state.id("cam");
            let mut record = input.clone();
            record["id"] = json!(id);
            state.cameras.push(record.clone());
            json!({ "addCamera": record })
        }
        "updateSingleSetting" => {
            let input = &variables["settingInput"];
            let (key, value) = (text(input, "key"), text(input, "value"));
            if !key.starts_with("DEFAULT/") {
                let mut slot = &mut state.settings;
                for segment in key.split('/') {
                    slot = &mut slot[segment];
                }
                *slot = json!(value);
            }
            state.kv.insert(key, value);
            json!({ "updateSingleSetting": { "code": 200 } })
        }
        "getSingleSetting" => {
            let key = text(variables, "key");
            match state.kv.get(&key) {
                Some(value) => json!({ "getSingleSetting": { "key": key, "value": value } }),
                None => json!({ "getSingleSetting": null }),
            }
        }
        "updateSettings" => {
            let patch = variables["settings"].clone();
            merge(&mut state.settings, &patch);
            json!({ "updateSettings": { "code": 200 } })
        }
        "updateFileMediaData" => json!({ "updateFileMediaData": { "code": 200 } }),
        "startAnalyzeFilesCase" => json!({ "startAnalyzeFilesCase": { "code": 200 } }),
        other => {
            return Ok(json!({ "errors": [{ "message": format!("unknown operation {other}") }] }));
        }
    };
    Ok(json!({ "data": data }))
}

/// Subject record helper for seeding live images.
pub fn image(url: &str, primary: bool) -> Value {
    let mut record = Map::new();
    record.insert("url".to_string(), json!(url));
    record.insert("isPrimary".to_string(), json!(primary));
    record.insert("objectType".to_string(), json!(1));
    Value::Object(record)
}
