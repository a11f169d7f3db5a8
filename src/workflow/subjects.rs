//! Watch-list subjects: feature extraction, creation with a single primary
//! image, and appending further images against the server's current list.
use crate::api::shape::{normalize, Shape};
use crate::api::{id_of, Gateway};
use crate::util::file_name_of;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const EXTRACT_PATH: &str = "/external-functions/extract-faces-from-image";
const OPTIONAL_IMAGE_FIELDS: &[&str] = &["featuresId", "backup", "attributes", "feNetwork"];

#[derive(Debug, thiserror::Error)]
pub enum SubjectError {
    #[error("subject {subject}: {primaries} primary images after repair (expected exactly 1)")]
    PrimaryInvariant { subject: String, primaries: usize },
    #[error("no face found in {path}")]
    NoFace { path: PathBuf },
    #[error("subject {subject}: server returned no images")]
    NoImages { subject: String },
}

/// Submit an image for feature extraction and build a non-primary image record.
pub fn extract_face(gateway: &Gateway<'_>, path: &Path) -> Result<Value> {
    let response = gateway
        .upload_file(EXTRACT_PATH, "file", path)
        .with_context(|| format!("extract features from {}", path.display()))?;
    let faces = match normalize(response) {
        Shape::Records(records) => records,
        Shape::Unrecognized(Value::Object(single)) => vec![Value::Object(single)],
        Shape::Unrecognized(_) => Vec::new(),
    };
    let face = faces
        .into_iter()
        .find(|face| face.get("url").and_then(Value::as_str).is_some())
        .ok_or_else(|| SubjectError::NoFace {
            path: path.to_path_buf(),
        })?;
    Ok(image_record(&face))
}

fn image_record(face: &Value) -> Value {
    let mut record = Map::new();
    record.insert(
        "objectType".to_string(),
        face.get("objectType").cloned().unwrap_or(json!(1)),
    );
    record.insert("isPrimary".to_string(), json!(false));
    record.insert(
        "featuresQuality".to_string(),
        face.get("featuresQuality").cloned().unwrap_or(json!(0)),
    );
    record.insert("url".to_string(), face["url"].clone());
    record.insert(
        "features".to_string(),
        face.get("features").cloned().unwrap_or(json!([])),
    );
    record.insert(
        "landmarkScore".to_string(),
        face.get("landmarkScore").cloned().unwrap_or(json!(0)),
    );
    for key in OPTIONAL_IMAGE_FIELDS {
        if let Some(value) = face.get(*key) {
            record.insert((*key).to_string(), value.clone());
        }
    }
    Value::Object(record)
}

fn is_primary(image: &Value) -> bool {
    image.get("isPrimary").and_then(Value::as_bool) == Some(true)
}

pub fn primary_count(images: &[Value]) -> usize {
    images.iter().filter(|image| is_primary(image)).count()
}

/// Force exactly one primary image (the first) when the list has zero or
/// several. Returns true when something had to change.
pub fn ensure_single_primary(images: &mut [Value]) -> bool {
    if images.is_empty() || primary_count(images) == 1 {
        return false;
    }
    for (idx, image) in images.iter_mut().enumerate() {
        if let Value::Object(map) = image {
            map.insert("isPrimary".to_string(), json!(idx == 0));
        }
    }
    true
}

fn check_invariant(subject: &str, images: &[Value]) -> Result<(), SubjectError> {
    match primary_count(images) {
        1 => Ok(()),
        primaries => Err(SubjectError::PrimaryInvariant {
            subject: subject.to_string(),
            primaries,
        }),
    }
}

fn images_of(subject: &Value) -> Vec<Value> {
    let record = subject
        .get("data")
        .filter(|data| data.is_object())
        .unwrap_or(subject);
    record
        .get("images")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Current image list of a subject. An empty list is an error so it is never
/// written back over the stored images.
fn fetch_images(gateway: &Gateway<'_>, name: &str, endpoint: &str) -> Result<Vec<Value>> {
    let current = gateway
        .get(endpoint)
        .with_context(|| format!("fetch subject {name}"))?;
    let images = images_of(&current);
    if images.is_empty() {
        return Err(SubjectError::NoImages {
            subject: name.to_string(),
        }
        .into());
    }
    Ok(images)
}

/// Outcome of creating one subject.
#[derive(Debug)]
pub struct CreatedSubject {
    pub id: String,
    pub images: usize,
    /// Additional images that could not be attached; the subject still exists.
    pub failed_images: Vec<(PathBuf, anyhow::Error)>,
    /// Set when the primary image could not be confirmed after creation.
    pub unverified: Option<anyhow::Error>,
}

/// Extract, create with one primary image, then attach the rest one by one.
///
/// Extraction or creation failures leave nothing behind and are returned as
/// errors. Once the subject exists every later failure is carried in the
/// result: a failed additional image is recorded and the next one is still
/// attempted, and a failed primary check lands in `unverified`.
pub fn create_subject(
    gateway: &Gateway<'_>,
    name: &str,
    group_id: Option<&str>,
    images: &[PathBuf],
) -> Result<CreatedSubject> {
    let (first, rest) = images
        .split_first()
        .ok_or_else(|| anyhow!("subject {name} declares no images"))?;
    let mut primary = extract_face(gateway, first)?;
    primary["isPrimary"] = json!(true);

    let mut body = json!({ "name": name, "images": [primary] });
    if let Some(group_id) = group_id {
        body["groups"] = json!([group_id]);
    }
    let created = gateway
        .create("/subjects", body)
        .with_context(|| format!("create subject {name}"))?;
    let id = id_of(&created).ok_or_else(|| anyhow!("create subject {name}: response has no id"))?;
    tracing::info!(subject = name, id = %id, image = %file_name_of(first), "subject created");

    let mut image_count = 1;
    let mut failed_images = Vec::new();
    for path in rest {
        match attach_image(gateway, name, &id, path) {
            Ok(count) => {
                image_count = count;
                tracing::info!(subject = name, image = %file_name_of(path), images = count, "image attached");
            }
            Err(err) => {
                tracing::warn!(subject = name, image = %file_name_of(path), error = %format!("{err:#}"), "additional image not attached");
                failed_images.push((path.clone(), err));
            }
        }
    }

    let unverified = match verify_primary(gateway, name, &id) {
        Ok(count) => {
            image_count = count;
            None
        }
        Err(err) => {
            tracing::warn!(subject = name, id = %id, error = %format!("{err:#}"), "primary image not confirmed");
            Some(err)
        }
    };
    Ok(CreatedSubject {
        id,
        images: image_count,
        failed_images,
        unverified,
    })
}

/// Append one image to a subject, working from the server's current list.
pub fn attach_image(gateway: &Gateway<'_>, name: &str, subject_id: &str, path: &Path) -> Result<usize> {
    let face = extract_face(gateway, path)?;
    attach_face(gateway, name, subject_id, face)
}

fn attach_face(gateway: &Gateway<'_>, name: &str, subject_id: &str, face: Value) -> Result<usize> {
    let endpoint = format!("/subjects/{subject_id}");
    let mut images = fetch_images(gateway, name, &endpoint)?;
    if ensure_single_primary(&mut images) {
        tracing::warn!(subject = name, "repaired primary flags on fetched image list");
    }
    images.push(face);
    ensure_single_primary(&mut images);
    check_invariant(name, &images)?;
    let count = images.len();
    gateway
        .patch(&endpoint, json!({ "isProduceSocket": true, "images": images }))
        .with_context(|| format!("update images of subject {name}"))?;
    Ok(count)
}

/// Re-read the subject and repair its primary flag if the server disagrees.
/// The repaired list must read back with exactly one primary.
pub fn verify_primary(gateway: &Gateway<'_>, name: &str, subject_id: &str) -> Result<usize> {
    let endpoint = format!("/subjects/{subject_id}");
    let mut images = fetch_images(gateway, name, &endpoint)?;
    if primary_count(&images) == 1 {
        return Ok(images.len());
    }
    ensure_single_primary(&mut images);
    tracing::warn!(subject = name, "server image list lost its primary; re-sending");
    gateway
        .patch(&endpoint, json!({ "isProduceSocket": true, "images": images }))
        .with_context(|| format!("repair primary image of subject {name}"))?;
    let stored = fetch_images(gateway, name, &endpoint)?;
    check_invariant(name, &stored)?;
    Ok(stored.len())
}

/// Result of topping up a subject that already exists.
#[derive(Debug)]
pub struct TopUp {
    pub existing: usize,
    pub added: usize,
    pub failed_images: Vec<(PathBuf, anyhow::Error)>,
    pub unverified: Option<anyhow::Error>,
}

/// Attach declared images beyond the subject's current count, skipping any
/// whose extracted URL is already present.
pub fn top_up_subject(
    gateway: &Gateway<'_>,
    name: &str,
    subject_id: &str,
    images: &[PathBuf],
) -> Result<TopUp> {
    let current = gateway
        .get(&format!("/subjects/{subject_id}"))
        .with_context(|| format!("fetch subject {name}"))?;
    let live = images_of(&current);
    let mut report = TopUp {
        existing: live.len(),
        added: 0,
        failed_images: Vec::new(),
        unverified: None,
    };
    if live.len() >= images.len() {
        return Ok(report);
    }
    let mut known_urls: HashSet<String> = live
        .iter()
        .filter_map(|image| image.get("url").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    for path in &images[live.len()..] {
        let attempt = extract_face(gateway, path).and_then(|face| {
            let url = face["url"].as_str().unwrap_or_default().to_string();
            if !known_urls.insert(url) {
                tracing::debug!(subject = name, image = %file_name_of(path), "image already present");
                return Ok(false);
            }
            attach_face(gateway, name, subject_id, face).map(|_| true)
        });
        match attempt {
            Ok(true) => report.added += 1,
            Ok(false) => {}
            Err(err) => report.failed_images.push((path.clone(), err)),
        }
    }
    if report.added > 0 {
        report.unverified = verify_primary(gateway, name, subject_id).err();
    }
    Ok(report)
}
