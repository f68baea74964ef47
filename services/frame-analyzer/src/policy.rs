use crate::privacy::PrivacyClass;
use std::fmt;

/// Worker-wide persistence switches, fixed at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceFlags {
    /// Save frames with detected objects
    pub save_with: bool,
    /// Save frames without detected objects
    pub save_without: bool,
    /// Save frames that contain only privacy objects
    pub include_privacy: bool,
}

/// What to do with a frame's images after it has been published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceAction {
    /// Do not store anything
    Skip,
    /// Store the original image under the `no_objects` tree
    SaveNoObjects,
    /// Objects were found but all of them are privacy objects
    SkipPrivacyOnly,
    /// Store the original (and optionally an annotated copy)
    SaveWithObjects,
}

impl PersistenceAction {
    pub fn writes(self) -> bool {
        matches!(
            self,
            PersistenceAction::SaveNoObjects | PersistenceAction::SaveWithObjects
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersistenceAction::Skip => "skip",
            PersistenceAction::SaveNoObjects => "save_no_objects",
            PersistenceAction::SkipPrivacyOnly => "skip_privacy_only",
            PersistenceAction::SaveWithObjects => "save_with_objects",
        }
    }
}

impl fmt::Display for PersistenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide how a frame is persisted.
///
/// Rules, first match wins:
/// 1. no detections, `save_without` off -> [`PersistenceAction::Skip`]
/// 2. no detections, `save_without` on -> [`PersistenceAction::SaveNoObjects`]
/// 3. detections, `save_with` off -> [`PersistenceAction::Skip`]
/// 4. only privacy objects, `include_privacy` off -> [`PersistenceAction::SkipPrivacyOnly`]
/// 5. anything else -> [`PersistenceAction::SaveWithObjects`]
pub fn decide(
    has_detections: bool,
    flags: PersistenceFlags,
    privacy: PrivacyClass,
) -> PersistenceAction {
    match (has_detections, flags) {
        (false, PersistenceFlags { save_without: false, .. }) => PersistenceAction::Skip,
        (false, PersistenceFlags { save_without: true, .. }) => PersistenceAction::SaveNoObjects,
        (true, PersistenceFlags { save_with: false, .. }) => PersistenceAction::Skip,
        (true, PersistenceFlags { include_privacy: false, .. })
            if privacy == PrivacyClass::OnlyPrivacy =>
        {
            PersistenceAction::SkipPrivacyOnly
        }
        (true, _) => PersistenceAction::SaveWithObjects,
    }
}

/// Persistence policy bound to the worker's flags
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistencePolicy {
    flags: PersistenceFlags,
}

impl PersistencePolicy {
    pub fn new(flags: PersistenceFlags) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> PersistenceFlags {
        self.flags
    }

    pub fn decide(&self, has_detections: bool, privacy: PrivacyClass) -> PersistenceAction {
        decide(has_detections, self.flags, privacy)
    }
}
