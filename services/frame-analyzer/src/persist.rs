use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::frame::RawFrame;

/// Sub-directory for frames stored without detections
pub const NO_OBJECTS_DIR: &str = "no_objects";

/// Errors that can occur while writing frames to disk
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Writes frame images below an output root.
///
/// Layout: `{root}/[no_objects/]{date}/{stream_id}/{timestamp}_{lat}_{lng}[_blur][_bbox].{ext}`
///
/// Names derive only from the frame's timestamp and position, so writing the
/// same frame twice replaces the earlier files instead of adding new ones.
#[derive(Debug, Clone)]
pub struct DiskWriter {
    root: PathBuf,
    extension: String,
}

impl DiskWriter {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into().to_lowercase(),
        }
    }

    /// `2021-02-01_13:37:07.123400_52.3679876_4.8973929`
    ///
    /// `taken_at` is held in UTC, so a producer offset shifts the name to
    /// the UTC wall clock.
    pub fn file_stem(frame: &RawFrame) -> String {
        format!(
            "{}_{}_{}",
            frame.taken_at.format("%Y-%m-%d_%H:%M:%S%.6f"),
            frame.position.lat,
            frame.position.lng
        )
    }

    /// Directory a frame's files go to, dated by the UTC day of `taken_at`
    pub fn directory(&self, frame: &RawFrame, no_objects: bool) -> PathBuf {
        let mut dir = self.root.clone();
        if no_objects {
            dir.push(NO_OBJECTS_DIR);
        }
        dir.push(frame.taken_at.format("%Y-%m-%d").to_string());
        dir.push(sanitize_path_component(&frame.stream_id));
        dir
    }

    /// Store the original image of a frame without detections
    #[instrument(skip(self, frame, image), fields(stream_id = %frame.stream_id))]
    pub async fn write_no_objects(
        &self,
        frame: &RawFrame,
        image: &[u8],
    ) -> Result<Vec<PathBuf>, PersistError> {
        let dir = self.directory(frame, true);
        let path = dir.join(self.file_name(&Self::file_stem(frame)));

        create_dir(&dir).await?;
        write_file(&path, image).await?;
        Ok(vec![path])
    }

    /// Store the original image and, when given, the annotated copy.
    ///
    /// `blurred` marks the original as having privacy objects painted out,
    /// which adds `_blur` to both names.
    #[instrument(skip(self, frame, original, annotated), fields(stream_id = %frame.stream_id))]
    pub async fn write_with_objects(
        &self,
        frame: &RawFrame,
        original: &[u8],
        annotated: Option<&[u8]>,
        blurred: bool,
    ) -> Result<Vec<PathBuf>, PersistError> {
        let dir = self.directory(frame, false);
        let mut stem = Self::file_stem(frame);
        if blurred {
            stem.push_str("_blur");
        }

        create_dir(&dir).await?;

        let original_path = dir.join(self.file_name(&stem));
        write_file(&original_path, original).await?;
        let mut written = vec![original_path];

        if let Some(annotated) = annotated {
            let path = dir.join(self.file_name(&format!("{}_bbox", stem)));
            write_file(&path, annotated).await?;
            written.push(path);
        }

        Ok(written)
    }

    fn file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.extension)
    }
}

async fn create_dir(dir: &Path) -> Result<(), PersistError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| PersistError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
}

/// Write through a temporary file so readers never see a partial image
async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{}.{}.part", file_name, Uuid::new_v4()));

    let result = async {
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if let Err(source) = result {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(PersistError::Write {
            path: path.to_path_buf(),
            source,
        });
    }

    debug!(path = %path.display(), size_bytes = bytes.len(), "Image written");
    Ok(())
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Position;
    use chrono::{TimeZone, Utc};
    use tokio_test::assert_ok;

    fn frame(stream_id: &str) -> RawFrame {
        RawFrame {
            image: String::new(),
            taken_at: Utc
                .with_ymd_and_hms(2021, 2, 1, 13, 37, 7)
                .unwrap()
                + chrono::Duration::microseconds(123_400),
            position: Position {
                lat: 52.3679876,
                lng: 4.8973929,
            },
            stream_id: stream_id.to_string(),
            stream_meta: Default::default(),
        }
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(
            DiskWriter::file_stem(&frame("cam")),
            "2021-02-01_13:37:07.123400_52.3679876_4.8973929"
        );
    }

    #[test]
    fn test_offset_timestamp_named_by_utc_date() {
        let body = serde_json::json!({
            "img": "aW1n",
            "taken_at": "2021-02-02T00:30:00+02:00",
            "lat_lng": {"lat": 1.5, "lng": 2.5},
            "stream_id": "cam-1"
        });
        let frame = crate::frame::decode(body.to_string().as_bytes()).unwrap();
        let writer = DiskWriter::new("/data", "jpg");

        assert_eq!(
            writer.directory(&frame, false),
            PathBuf::from("/data/2021-02-01/cam-1")
        );
        assert_eq!(
            DiskWriter::file_stem(&frame),
            "2021-02-01_22:30:00.000000_1.5_2.5"
        );
    }

    #[test]
    fn test_directory_layout() {
        let writer = DiskWriter::new("/data", "jpg");
        assert_eq!(
            writer.directory(&frame("cam-1"), false),
            PathBuf::from("/data/2021-02-01/cam-1")
        );
        assert_eq!(
            writer.directory(&frame("../etc"), true),
            PathBuf::from("/data/no_objects/2021-02-01/___etc")
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("stream-001"), "stream-001");
        assert_eq!(sanitize_path_component("a/b"), "a_b");
        assert_eq!(sanitize_path_component(".."), "__");
        assert_eq!(sanitize_path_component(""), "_");
    }

    #[tokio::test]
    async fn test_write_no_objects() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::new(dir.path(), "jpg");

        let written = assert_ok!(writer.write_no_objects(&frame("cam"), b"jpeg").await);
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with(dir.path().join("no_objects/2021-02-01/cam")));
        assert!(written[0]
            .to_string_lossy()
            .ends_with("52.3679876_4.8973929.jpg"));
        assert_eq!(std::fs::read(&written[0]).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_write_with_objects_names() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::new(dir.path(), "jpg");
        let frame = frame("cam");

        let written = assert_ok!(
            writer
                .write_with_objects(&frame, b"original", Some(b"boxes"), true)
                .await
        );
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        let stem = DiskWriter::file_stem(&frame);
        assert_eq!(
            names,
            vec![format!("{}_blur.jpg", stem), format!("{}_blur_bbox.jpg", stem)]
        );

        let written = assert_ok!(writer.write_with_objects(&frame, b"original", None, false).await);
        assert_eq!(written.len(), 1);
        assert!(written[0].to_string_lossy().ends_with(&format!("{}.jpg", stem)));
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::new(dir.path(), "png");
        let frame = frame("cam");

        let first = assert_ok!(writer.write_no_objects(&frame, b"one").await);
        let second = assert_ok!(writer.write_no_objects(&frame, b"two").await);
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second[0]).unwrap(), b"two");

        let entries = std::fs::read_dir(writer.directory(&frame, true)).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_unwritable_root_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let writer = DiskWriter::new(&blocker, "jpg");
        let result = writer.write_no_objects(&frame("cam"), b"jpeg").await;
        assert!(matches!(result, Err(PersistError::CreateDir { .. })));
    }
}
