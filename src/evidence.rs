//! Evidence capture: the triggering frame written as a JPEG.
//!
//! File names carry the source id, the capture time down to nanoseconds and a
//! per-store counter, so two sources alerting in the same instant never
//! collide. Files are written under a temporary name and renamed, so a reader
//! never sees a half-written image.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ImageError;
use tracing::info;

use crate::config::EvidenceConfig;
use crate::error::EvidenceError;
use crate::frame::Frame;

/// Reference to a persisted evidence image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvidenceRef(PathBuf);

impl EvidenceRef {
    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "evidence.jpg".to_string())
    }
}

impl fmt::Display for EvidenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug)]
pub struct EvidenceStore {
    dir: PathBuf,
    jpeg_quality: u8,
    counter: AtomicU64,
}

impl EvidenceStore {
    pub fn new(cfg: &EvidenceConfig) -> Self {
        Self::with_dir(&cfg.dir, cfg.jpeg_quality)
    }

    pub fn with_dir(dir: impl Into<PathBuf>, jpeg_quality: u8) -> Self {
        Self {
            dir: dir.into(),
            jpeg_quality: jpeg_quality.clamp(1, 100),
            counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Blocking write; call from the blocking pool.
    pub fn capture(
        &self,
        frame: &Frame,
        source_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<EvidenceRef, EvidenceError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| EvidenceError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(self.file_name(source_id, timestamp));
        let partial = path.with_extension("jpg.part");

        let written = self.write_jpeg(frame, &partial).and_then(|_| {
            std::fs::rename(&partial, &path).map_err(ImageError::IoError)
        });
        if let Err(source) = written {
            let _ = std::fs::remove_file(&partial);
            return Err(EvidenceError::Write { path, source });
        }

        info!(source = %source_id, evidence = %path.display(), "Evidence captured");
        Ok(EvidenceRef(path))
    }

    fn file_name(&self, source_id: &str, timestamp: DateTime<Utc>) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}_nohelmet_{}_{:09}_{:06}.jpg",
            sanitize(source_id),
            timestamp.format("%Y%m%d_%H%M%S"),
            timestamp.timestamp_subsec_nanos(),
            seq
        )
    }

    fn write_jpeg(&self, frame: &Frame, path: &Path) -> Result<(), ImageError> {
        let mut writer = BufWriter::new(File::create(path)?);
        JpegEncoder::new_with_quality(&mut writer, self.jpeg_quality).encode_image(&frame.image)?;
        writer.flush()?;
        Ok(())
    }
}

fn sanitize(source_id: &str) -> String {
    let cleaned: String = source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "source".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use image::{Rgb, RgbImage};

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(16, 12, Rgb([90, 60, 30])))
    }

    #[test]
    fn writes_readable_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::with_dir(dir.path().join("alerts"), 90);
        let r = store.capture(&frame(), "cam0", Utc::now()).unwrap();

        assert!(r.file_name().starts_with("cam0_nohelmet_"));
        assert!(r.file_name().ends_with(".jpg"));
        let img = image::open(r.path()).unwrap();
        assert_eq!((img.width(), img.height()), (16, 12));
        // no leftover partial files
        let names: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn same_timestamp_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EvidenceStore::with_dir(dir.path(), 80));
        let ts = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let src = if i % 2 == 0 { "A" } else { "B" };
                std::thread::spawn(move || store.capture(&frame(), src, ts).unwrap())
            })
            .collect();

        let refs: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(refs.len(), 16);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 16);
    }

    #[test]
    fn unwritable_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the directory should be
        let blocker = dir.path().join("alerts");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let store = EvidenceStore::with_dir(&blocker, 90);
        let err = store.capture(&frame(), "cam0", Utc::now()).unwrap_err();
        assert!(matches!(err, EvidenceError::CreateDir { .. }));
    }

    #[test]
    fn sanitize_source_ids() {
        assert_eq!(sanitize("gate/2 north"), "gate_2_north");
        assert_eq!(sanitize("cam-0_a"), "cam-0_a");
        assert_eq!(sanitize(""), "source");
    }
}
