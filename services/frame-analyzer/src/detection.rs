//! Detection adapter interface.
//!
//! The inference engine lives outside this crate. Anything that can turn a
//! [`RawFrame`] into a list of [`DetectedObject`]s implements [`Detector`];
//! [`DetectionRun`] takes care of the bookkeeping every implementation shares
//! (timing, counting, model identification).

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::frame::{AnalysisMeta, AnalyzedFrame, DetectedObject, ObjectCounts, RawFrame};

/// Errors raised by a detector
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Image could not be read: {0}")]
    InvalidImage(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Detector task panicked or was cancelled: {0}")]
    Aborted(String),
}

/// Object detector capability.
///
/// Calls are synchronous and may be expensive; the worker runs them on the
/// blocking thread pool.
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &RawFrame) -> Result<AnalyzedFrame, DetectionError>;
}

/// Name and version of the model producing detections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    /// Every class the model can emit
    pub class_names: Vec<String>,
}

impl From<&DetectionConfig> for ModelInfo {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            name: config.model_name.clone(),
            version: config.model_version.clone(),
            class_names: config.class_names.clone(),
        }
    }
}

/// One timed detection pass over a frame
#[derive(Debug)]
pub struct DetectionRun<'a> {
    model: &'a ModelInfo,
    started_at: DateTime<Utc>,
}

impl<'a> DetectionRun<'a> {
    pub fn start(model: &'a ModelInfo) -> Self {
        Self {
            model,
            started_at: Utc::now(),
        }
    }

    /// Build the analyzed frame from the objects found
    pub fn finish(self, frame: RawFrame, objects: Vec<DetectedObject>) -> AnalyzedFrame {
        self.finish_at(frame, objects, Utc::now())
    }

    fn finish_at(
        self,
        frame: RawFrame,
        objects: Vec<DetectedObject>,
        finished_at: DateTime<Utc>,
    ) -> AnalyzedFrame {
        let elapsed = finished_at - self.started_at;
        let elapsed_seconds = elapsed
            .num_microseconds()
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or_default()
            .max(0.0);

        AnalyzedFrame {
            frame,
            object_counts: ObjectCounts::tally(&self.model.class_names, &objects),
            detected_objects: objects,
            blurred_image: None,
            image_meta: None,
            analysis_meta: AnalysisMeta {
                started_at: self.started_at,
                finished_at,
                elapsed_seconds,
                model_name: self.model.name.clone(),
                model_version: self.model.version.clone(),
            },
        }
    }
}

/// Detector that never finds anything.
///
/// Lets the worker run end to end (publishing, `save_without` persistence)
/// before an inference backend is wired in.
#[derive(Debug, Clone)]
pub struct PassthroughDetector {
    model: ModelInfo,
}

impl PassthroughDetector {
    pub fn new(model: ModelInfo) -> Self {
        Self { model }
    }
}

impl Detector for PassthroughDetector {
    fn detect(&self, frame: &RawFrame) -> Result<AnalyzedFrame, DetectionError> {
        Ok(DetectionRun::start(&self.model).finish(frame.clone(), Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Position};
    use chrono::TimeZone;

    fn raw_frame() -> RawFrame {
        RawFrame {
            image: "aGVsbG8=".to_string(),
            taken_at: Utc.with_ymd_and_hms(2021, 2, 1, 13, 37, 7).unwrap(),
            position: Position {
                lat: 52.3679876,
                lng: 4.8973929,
            },
            stream_id: "stream".to_string(),
            stream_meta: Default::default(),
        }
    }

    fn model() -> ModelInfo {
        ModelInfo {
            name: "yolov5".to_string(),
            version: "garb-l".to_string(),
            class_names: vec!["container".to_string(), "garbagebag".to_string()],
        }
    }

    #[test]
    fn test_run_builds_counts_and_meta() {
        let model = model();
        let run = DetectionRun::start(&model);
        let started = run.started_at;
        let objects = vec![DetectedObject::new(
            "garbagebag",
            0.8,
            BoundingBox {
                coordinate1: (0, 0),
                coordinate2: (5, 5),
            },
        )];

        let analyzed = run.finish_at(
            raw_frame(),
            objects,
            started + chrono::Duration::milliseconds(1500),
        );

        assert_eq!(analyzed.frame, raw_frame());
        assert_eq!(analyzed.object_counts.total(), Some(1));
        assert_eq!(analyzed.object_counts.get("container"), Some(0));
        assert_eq!(analyzed.analysis_meta.elapsed_seconds, 1.5);
        assert_eq!(analyzed.analysis_meta.model_name, "yolov5");
        assert!(analyzed.image_meta.is_none());
    }

    #[test]
    fn test_passthrough_detects_nothing() {
        let detector = PassthroughDetector::new(model());
        let analyzed = detector.detect(&raw_frame()).unwrap();
        assert!(!analyzed.has_detections());
        assert_eq!(analyzed.object_counts.total(), Some(0));
        assert_eq!(analyzed.analysis_meta.model_version, "garb-l");
    }
}
