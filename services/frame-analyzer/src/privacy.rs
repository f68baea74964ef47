//! Privacy classification of detection results.

use crate::frame::{DetectedObject, ObjectCounts};

/// Object classes whose name contains this marker identify people or
/// vehicles (`face_privacy_filter`, `license_plate_privacy_filter`).
pub const PRIVACY_MARKER: &str = "privacy";

/// Whether an object class is privacy sensitive.
///
/// This is the only place the naming convention is interpreted; detected
/// objects carry the result as an explicit flag.
pub fn is_privacy_class(class: &str) -> bool {
    class.contains(PRIVACY_MARKER)
}

/// What kind of objects a frame contains, from a privacy point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivacyClass {
    /// Nothing was detected
    None,
    /// Only privacy objects were detected
    OnlyPrivacy,
    /// At least one non-privacy object was detected
    HasNonPrivacy,
}

impl PrivacyClass {
    /// Only frames with at least one non-privacy object are worth storing
    pub fn is_storable(self) -> bool {
        matches!(self, PrivacyClass::HasNonPrivacy)
    }

    fn from_flags(privacy: bool, other: bool) -> Self {
        match (privacy, other) {
            (_, true) => PrivacyClass::HasNonPrivacy,
            (true, false) => PrivacyClass::OnlyPrivacy,
            (false, false) => PrivacyClass::None,
        }
    }
}

/// Classify a frame by its object counts
pub fn classify(counts: &ObjectCounts) -> PrivacyClass {
    match counts.total() {
        Some(total) if total > 0 => {}
        _ => return PrivacyClass::None,
    }

    let (mut privacy, mut other) = (false, false);
    for (class, count) in counts.classes().filter(|(_, count)| *count > 0) {
        if is_privacy_class(class) {
            privacy = true;
        } else {
            other = true;
        }
    }

    PrivacyClass::from_flags(privacy, other)
}

/// Classify a frame by its detected objects, using their privacy flag
pub fn classify_objects(objects: &[DetectedObject]) -> PrivacyClass {
    let privacy = objects.iter().any(|o| o.privacy_sensitive);
    let other = objects.iter().any(|o| !o.privacy_sensitive);
    PrivacyClass::from_flags(privacy, other)
}
