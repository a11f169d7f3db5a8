//! Camera creation through the `addCamera` mutation.
//!
//! Only a few fields come from the declared device; the rest of the camera
//! configuration always takes the fixed defaults below.
use crate::api::{id_of, Gateway};
use crate::config::{DeviceConfig, LocationConfig, Padding};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

/// Face match threshold when `details.threshold` is absent.
pub const DEFAULT_THRESHOLD: f64 = 0.5;
/// Location used when none is declared, it is named "default", or it lacks coordinates.
pub const DEFAULT_LOCATION_NAME: &str = "Default";
pub const DEFAULT_LAT: f64 = 32.0853;
pub const DEFAULT_LONG: f64 = 34.7818;
/// Smallest and largest face widths (pixels) the detector considers.
pub const DEFAULT_MIN_FACE_WIDTH: u32 = 48;
pub const DEFAULT_MAX_FACE_WIDTH: u32 = 1000;
/// Process every frame.
pub const DEFAULT_FRAME_SKIP: u32 = 0;
/// Tracker gives up on a face after this long without a detection.
pub const DEFAULT_TRACKER_TIMEOUT_MS: u32 = 1500;
/// Upper bound on how long a single track is kept alive.
pub const DEFAULT_TRACKER_MAX_AGE_MS: u32 = 10_000;
/// No region-of-interest cropping.
pub const DEFAULT_PADDING: Padding = Padding {
    top: 0,
    right: 0,
    bottom: 0,
    left: 0,
};
pub const DEFAULT_LIVENESS_THRESHOLD: f64 = 0.5;
pub const DEFAULT_ACCESS_CONTROL: bool = false;
pub const DEFAULT_PRIVACY_MODE: bool = false;

const ADD_CAMERA: &str = "mutation addCamera($camera: CameraInput!) {\n  addCamera(camera: $camera) {\n    id\n    title\n  }\n}\n";

fn location_of(location: Option<&LocationConfig>) -> (String, f64, f64) {
    let declared = location.and_then(|location| {
        let name = location.name.as_deref().map(str::trim).unwrap_or_default();
        if name.eq_ignore_ascii_case("default") {
            return None;
        }
        let (lat, long) = (location.lat?, location.long?);
        let name = if name.is_empty() { DEFAULT_LOCATION_NAME } else { name };
        Some((name.to_string(), lat, long))
    });
    declared.unwrap_or_else(|| (DEFAULT_LOCATION_NAME.to_string(), DEFAULT_LAT, DEFAULT_LONG))
}

/// Build the full camera input for one declared device.
pub fn camera_input(device: &DeviceConfig, camera_group_id: Option<&str>) -> Value {
    let calibration = &device.calibration;
    let security = &device.security_access;
    let padding = calibration.padding.unwrap_or(DEFAULT_PADDING);
    let (location_name, lat, long) = location_of(device.details.location.as_ref());
    json!({
        "title": device.name.trim(),
        "videoUrl": device.video_url.trim(),
        "cameraGroupId": camera_group_id,
        "threshold": device.details.threshold.unwrap_or(DEFAULT_THRESHOLD),
        "location": {
            "name": location_name,
            "lat": lat,
            "long": long,
        },
        "configuration": {
            "minFaceWidth": calibration.min_face_width.unwrap_or(DEFAULT_MIN_FACE_WIDTH),
            "maxFaceWidth": calibration.max_face_width.unwrap_or(DEFAULT_MAX_FACE_WIDTH),
            "frameSkip": calibration.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
            "trackerTimeoutMs": calibration.tracker_timeout_ms.unwrap_or(DEFAULT_TRACKER_TIMEOUT_MS),
            "trackerMaxAgeMs": calibration.tracker_max_age_ms.unwrap_or(DEFAULT_TRACKER_MAX_AGE_MS),
            "cameraPadding": {
                "top": padding.top,
                "right": padding.right,
                "bottom": padding.bottom,
                "left": padding.left,
            },
            "livenessThreshold": security.liveness_threshold.unwrap_or(DEFAULT_LIVENESS_THRESHOLD),
            "accessControl": security.access_control.unwrap_or(DEFAULT_ACCESS_CONTROL),
            "privacyMode": security.privacy_mode.unwrap_or(DEFAULT_PRIVACY_MODE),
        },
    })
}

/// Create one camera and return its id.
pub fn create_camera(gateway: &Gateway<'_>, input: Value) -> Result<String> {
    let title = input["title"].as_str().unwrap_or_default().to_string();
    let data = gateway
        .graphql("addCamera", ADD_CAMERA, json!({ "camera": input }))
        .with_context(|| format!("create camera {title}"))?;
    id_of(&data["addCamera"]).ok_or_else(|| anyhow!("create camera {title}: response has no id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{is_already_exists, PlatformVersion, Session};
    use crate::config::CalibrationConfig;
    use crate::testing::FakeOnWatch;

    fn device(location: Option<LocationConfig>) -> DeviceConfig {
        let mut device = DeviceConfig {
            name: " face camera ".to_string(),
            video_url: "rtsp://10.9.9.9/stream".to_string(),
            ..DeviceConfig::default()
        };
        device.details.location = location;
        device
    }

    #[test]
    fn location_defaults_apply_when_missing_default_or_partial() {
        let cases = [
            None,
            Some(LocationConfig {
                name: Some("default".into()),
                lat: Some(1.0),
                long: Some(2.0),
            }),
            Some(LocationConfig {
                name: Some("holon".into()),
                lat: Some(1.0),
                long: None,
            }),
        ];
        for location in cases {
            let input = camera_input(&device(location), None);
            assert_eq!(input["location"]["lat"], DEFAULT_LAT);
            assert_eq!(input["location"]["long"], DEFAULT_LONG);
        }

        let input = camera_input(
            &device(Some(LocationConfig {
                name: Some("holon".into()),
                lat: Some(32.007),
                long: Some(34.8),
            })),
            Some("cg-1"),
        );
        assert_eq!(input["location"]["name"], "holon");
        assert_eq!(input["location"]["lat"], 32.007);
        assert_eq!(input["cameraGroupId"], "cg-1");
        assert_eq!(input["title"], "face camera");
    }

    #[test]
    fn undeclared_configuration_takes_fixed_defaults() {
        let mut device = device(None);
        device.calibration = CalibrationConfig {
            frame_skip: Some(3),
            padding: Some(Padding {
                top: 5,
                right: 0,
                bottom: 0,
                left: 0,
            }),
            ..CalibrationConfig::default()
        };
        device.security_access.privacy_mode = Some(true);
        let config = &camera_input(&device, None)["configuration"];
        assert_eq!(config["frameSkip"], 3);
        assert_eq!(config["minFaceWidth"], DEFAULT_MIN_FACE_WIDTH);
        assert_eq!(config["trackerTimeoutMs"], DEFAULT_TRACKER_TIMEOUT_MS);
        assert_eq!(config["cameraPadding"]["top"], 5);
        assert_eq!(config["privacyMode"], true);
        assert_eq!(config["accessControl"], false);
        assert_eq!(config["livenessThreshold"], DEFAULT_LIVENESS_THRESHOLD);
    }

    #[test]
    fn duplicate_camera_is_signalled() {
        let fake = FakeOnWatch::new();
        let gateway = Gateway::with_session(&fake, Session::bearer("t"), PlatformVersion::V2_8);
        let input = camera_input(&device(None), Some("cg-1"));
        let id = create_camera(&gateway, input.clone()).unwrap();
        assert_eq!(fake.cameras()[0]["id"], id.as_str());
        let err = create_camera(&gateway, input).unwrap_err();
        assert!(is_already_exists(&err));
    }
}
