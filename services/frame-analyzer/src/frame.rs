//! Frame records and their JSON wire codec.
//!
//! Wire field names follow the snake_case names the downstream API stores
//! (`img`, `lat_lng`, `analyser_meta`, ...), so the Rust field names differ in
//! a few places.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::privacy::is_privacy_class;

/// Reserved key in [`ObjectCounts`] holding the sum of all other counts
pub const TOTAL_KEY: &str = "total";

/// Key under which a class literally named `total` is counted
pub const TOTAL_CLASS_KEY: &str = "total_object";

/// Errors produced while decoding an inbound message body
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Message body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Geographic position of the camera when the frame was taken
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(deserialize_with = "de_coordinate")]
    pub lat: f64,
    #[serde(deserialize_with = "de_coordinate")]
    pub lng: f64,
}

/// A frame as it arrives from a camera stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Base64 encoded image, optionally with a `data:` URI prefix
    #[serde(rename = "img")]
    pub image: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub taken_at: DateTime<Utc>,
    #[serde(rename = "lat_lng")]
    pub position: Position,
    pub stream_id: String,
    #[serde(default)]
    pub stream_meta: serde_json::Map<String, serde_json::Value>,
}

/// Bounding box corners in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Top-left corner
    pub coordinate1: (i32, i32),
    /// Bottom-right corner
    pub coordinate2: (i32, i32),
}

/// A single object found by the detector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedObject {
    #[serde(rename = "detected_object_type")]
    pub kind: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Set once at construction; privacy objects are painted out of stored images
    pub privacy_sensitive: bool,
}

impl DetectedObject {
    pub fn new(kind: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        let kind = kind.into();
        let privacy_sensitive = is_privacy_class(&kind);
        Self {
            kind,
            confidence,
            bbox,
            privacy_sensitive,
        }
    }
}

impl<'de> Deserialize<'de> for DetectedObject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            detected_object_type: String,
            confidence: f32,
            bbox: BoundingBox,
            privacy_sensitive: Option<bool>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let privacy_sensitive = wire
            .privacy_sensitive
            .unwrap_or_else(|| is_privacy_class(&wire.detected_object_type));

        Ok(Self {
            kind: wire.detected_object_type,
            confidence: wire.confidence,
            bbox: wire.bbox,
            privacy_sensitive,
        })
    }
}

/// Per-class object counts, including the reserved `total` key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectCounts(BTreeMap<String, u32>);

impl ObjectCounts {
    /// Count detected objects, seeding every known class with zero.
    ///
    /// `total` always equals the sum of the per-class counts. A class named
    /// `total` is counted under [`TOTAL_CLASS_KEY`].
    pub fn tally<S: AsRef<str>>(class_names: &[S], objects: &[DetectedObject]) -> Self {
        let mut counts: BTreeMap<String, u32> = class_names
            .iter()
            .map(|name| (count_key(name.as_ref()).to_string(), 0))
            .collect();

        for object in objects {
            *counts.entry(count_key(&object.kind).to_string()).or_insert(0) += 1;
        }

        counts.insert(TOTAL_KEY.to_string(), objects.len() as u32);
        Self(counts)
    }

    /// Value of the reserved `total` key, if present
    pub fn total(&self) -> Option<u32> {
        self.0.get(TOTAL_KEY).copied()
    }

    pub fn get(&self, class: &str) -> Option<u32> {
        self.0.get(class).copied()
    }

    /// Per-class counts, excluding `total`
    pub fn classes(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0
            .iter()
            .filter(|(name, _)| name.as_str() != TOTAL_KEY)
            .map(|(name, count)| (name.as_str(), *count))
    }
}

impl<K: Into<String>> FromIterator<(K, u32)> for ObjectCounts {
    fn from_iter<T: IntoIterator<Item = (K, u32)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Image properties attached by the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    #[serde(rename = "file_hostname")]
    pub hostname: String,
}

/// Timing and model information for one detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMeta {
    #[serde(rename = "ml_start_at")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "ml_done_at")]
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "ml_time_taken")]
    pub elapsed_seconds: f64,
    pub model_name: String,
    pub model_version: String,
}

/// A frame after detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedFrame {
    #[serde(flatten)]
    pub frame: RawFrame,
    #[serde(default)]
    pub detected_objects: Vec<DetectedObject>,
    #[serde(rename = "object_count", default)]
    pub object_counts: ObjectCounts,
    #[serde(default)]
    pub blurred_image: Option<String>,
    #[serde(rename = "img_meta", default)]
    pub image_meta: Option<ImageMeta>,
    #[serde(rename = "analyser_meta")]
    pub analysis_meta: AnalysisMeta,
}

impl AnalyzedFrame {
    pub fn has_detections(&self) -> bool {
        !self.detected_objects.is_empty()
    }

    pub fn with_image_meta(self, image_meta: ImageMeta) -> Self {
        Self {
            image_meta: Some(image_meta),
            ..self
        }
    }

    pub fn with_blurred_image(self, blurred_image: String) -> Self {
        Self {
            blurred_image: Some(blurred_image),
            ..self
        }
    }
}

/// Decode an inbound message body into a [`RawFrame`]
pub fn decode(body: &[u8]) -> Result<RawFrame, DecodeError> {
    let frame: RawFrame = serde_json::from_slice(body)?;

    if frame.image.trim().is_empty() {
        return Err(DecodeError::Invalid("img is empty".to_string()));
    }
    if !frame.position.lat.is_finite() || !frame.position.lng.is_finite() {
        return Err(DecodeError::Invalid(
            "lat_lng must be finite numbers".to_string(),
        ));
    }

    Ok(frame)
}

/// Encode an analyzed frame into an outbound message body
pub fn encode(frame: &AnalyzedFrame) -> Vec<u8> {
    // String keys and finite floats only, so serialization cannot fail.
    serde_json::to_vec(frame).expect("AnalyzedFrame serializes to JSON")
}

/// Accept both `52.36` and `"52.36"`; producers in the field send either.
fn de_coordinate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Coordinate {
        Number(f64),
        Text(String),
    }

    match Coordinate::deserialize(deserializer)? {
        Coordinate::Number(value) => Ok(value),
        Coordinate::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid coordinate '{}'", text))),
    }
}

fn count_key(class: &str) -> &str {
    if class == TOTAL_KEY {
        TOTAL_CLASS_KEY
    } else {
        class
    }
}

/// RFC 3339, or a naive timestamp interpreted as UTC
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_timestamp(&text)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", text)))
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        return Some(timestamp.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn analyzed_frame() -> AnalyzedFrame {
        let taken_at = Utc.with_ymd_and_hms(2021, 1, 31, 12, 34, 56).unwrap();
        let objects = vec![
            DetectedObject::new(
                "garbagebag",
                0.87,
                BoundingBox {
                    coordinate1: (10, 20),
                    coordinate2: (110, 220),
                },
            ),
            DetectedObject::new(
                "face_privacy_filter",
                0.65,
                BoundingBox {
                    coordinate1: (5, 5),
                    coordinate2: (15, 15),
                },
            ),
        ];

        AnalyzedFrame {
            frame: RawFrame {
                image: "aGVsbG8=".to_string(),
                taken_at,
                position: Position {
                    lat: 52.367527,
                    lng: 4.901257,
                },
                stream_id: "stream-1".to_string(),
                stream_meta: serde_json::json!({ "user_type": "demo" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
            object_counts: ObjectCounts::tally(&["container"], &objects),
            detected_objects: objects,
            blurred_image: Some("Ymx1cnJlZA==".to_string()),
            image_meta: Some(ImageMeta {
                width: 640,
                height: 480,
                hostname: "worker-1".to_string(),
            }),
            analysis_meta: AnalysisMeta {
                started_at: taken_at,
                finished_at: taken_at + chrono::Duration::milliseconds(250),
                elapsed_seconds: 0.25,
                model_name: "yolov5".to_string(),
                model_version: "1".to_string(),
            },
        }
    }

    #[test]
    fn test_decode_producer_message() {
        let body = br#"{
            "img": "/9j/i/am/a/base64/encoded/image==",
            "taken_at": "2021-01-31 12:34:56",
            "lat_lng": {"lat": "52.367527", "lng": "4.901257"},
            "stream_id": "1",
            "stream_meta": {}
        }"#;

        let frame = decode(body).unwrap();
        assert_eq!(frame.stream_id, "1");
        assert_eq!(frame.position.lat, 52.367527);
        assert_eq!(
            frame.taken_at,
            Utc.with_ymd_and_hms(2021, 1, 31, 12, 34, 56).unwrap()
        );
    }

    #[test]
    fn test_decode_numeric_position_and_iso_timestamp() {
        let body = br#"{
            "img": "aGVsbG8=",
            "taken_at": "2021-01-31T12:34:56.123456",
            "lat_lng": {"lat": 1, "lng": 2},
            "stream_id": "foobar"
        }"#;

        let frame = decode(body).unwrap();
        assert_eq!(frame.position, Position { lat: 1.0, lng: 2.0 });
        assert!(frame.stream_meta.is_empty());
        assert_eq!(frame.taken_at.timestamp_subsec_micros(), 123456);
    }

    #[test]
    fn test_decode_rejects_malformed_messages() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Json(_))));
        // missing stream_id
        assert!(decode(br#"{"img": "x", "taken_at": "2021-01-31T12:34:56Z", "lat_lng": {"lat": 1, "lng": 2}}"#).is_err());
        assert!(decode(br#"{"img": "x", "taken_at": "yesterday", "lat_lng": {"lat": 1, "lng": 2}, "stream_id": "s"}"#).is_err());
        assert!(decode(br#"{"img": "x", "taken_at": "2021-01-31T12:34:56Z", "lat_lng": {"lat": "north", "lng": 2}, "stream_id": "s"}"#).is_err());
        assert!(matches!(
            decode(br#"{"img": " ", "taken_at": "2021-01-31T12:34:56Z", "lat_lng": {"lat": 1, "lng": 2}, "stream_id": "s"}"#),
            Err(DecodeError::Invalid(_))
        ));
    }

    #[test]
    fn test_analyzed_frame_round_trip() {
        let frame = analyzed_frame();
        let body = encode(&frame);
        let decoded: AnalyzedFrame = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, frame);

        // The raw part decodes on its own too
        let raw = decode(&body).unwrap();
        assert_eq!(raw, frame.frame);
    }

    #[test]
    fn test_wire_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&encode(&analyzed_frame())).unwrap();
        assert!(value.get("img").is_some());
        assert!(value.get("lat_lng").is_some());
        assert_eq!(value["object_count"]["total"], 2);
        assert_eq!(value["img_meta"]["file_hostname"], "worker-1");
        assert_eq!(value["analyser_meta"]["ml_time_taken"], 0.25);
        assert_eq!(
            value["detected_objects"][0]["detected_object_type"],
            "garbagebag"
        );
    }

    #[test]
    fn test_privacy_flag_derived_when_absent() {
        let object: DetectedObject = serde_json::from_str(
            r#"{"detected_object_type": "license_plate_privacy_filter", "confidence": 0.9,
                "bbox": {"coordinate1": [0, 0], "coordinate2": [4, 4]}}"#,
        )
        .unwrap();
        assert!(object.privacy_sensitive);
    }

    #[test]
    fn test_tally_keeps_total_invariant() {
        let frame = analyzed_frame();
        let counts = &frame.object_counts;
        assert_eq!(counts.total(), Some(2));
        assert_eq!(counts.get("container"), Some(0));
        assert_eq!(counts.get("garbagebag"), Some(1));
        let sum: u32 = counts.classes().map(|(_, count)| count).sum();
        assert_eq!(Some(sum), counts.total());
    }

    #[test]
    fn test_tally_class_named_total() {
        let bbox = BoundingBox {
            coordinate1: (0, 0),
            coordinate2: (1, 1),
        };
        let objects = vec![
            DetectedObject::new("total", 0.8, bbox),
            DetectedObject::new("bag", 0.8, bbox),
        ];
        let counts = ObjectCounts::tally(&["total", "bag"], &objects);

        assert_eq!(counts.total(), Some(2));
        assert_eq!(counts.get(TOTAL_CLASS_KEY), Some(1));
        assert_eq!(counts.get("bag"), Some(1));
        let sum: u32 = counts.classes().map(|(_, count)| count).sum();
        assert_eq!(Some(sum), counts.total());
    }
}
