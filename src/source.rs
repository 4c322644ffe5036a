/// Frame sources: camera devices, network streams, image directories.
///
/// A source is opened once by its runner and read in a blocking loop.
/// `read` returns `Ok(None)` at end of stream and `Err` when the stream
/// drops; the runner decides whether to reconnect.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::frame::Frame;

pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Re-open after a dropped stream. Sources that cannot reconnect report
    /// `Unavailable`.
    fn reconnect(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device index (laptop webcam = 0).
    Device(i32),
    /// Directory of still images replayed in name order.
    ImageDir(PathBuf),
    /// rtsp://, http(s):// or any URL the capture backend understands.
    Stream(String),
}

impl SourceKind {
    pub fn parse(url: &str) -> Self {
        let trimmed = url.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = trimmed.parse() {
                return Self::Device(index);
            }
        }
        let path = Path::new(trimmed);
        if path.is_dir() {
            return Self::ImageDir(path.to_path_buf());
        }
        Self::Stream(trimmed.to_string())
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Device(i) => format!("device #{}", i),
            Self::ImageDir(p) => format!("image dir {}", p.display()),
            Self::Stream(u) => format!("stream {}", u),
        }
    }
}

/// Open the configured source with whatever backend this build carries.
pub fn open_source(cfg: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    let kind = SourceKind::parse(&cfg.url);
    info!(source = %cfg.id, kind = %kind.describe(), "Opening source");

    match kind {
        SourceKind::ImageDir(dir) => Ok(Box::new(ImageDirSource::open(&cfg.id, &dir)?)),
        #[cfg(feature = "opencv")]
        other => Ok(Box::new(opencv_source::OpenCvSource::open(&cfg.id, other)?)),
        #[cfg(not(feature = "opencv"))]
        other => Err(SourceError::unavailable(
            &cfg.id,
            format!(
                "{} needs the `opencv` feature (this build only replays image directories)",
                other.describe()
            ),
        )),
    }
}

/// Replays every decodable image in a directory, sorted by file name.
pub struct ImageDirSource {
    source_id: String,
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    pub fn open(source_id: &str, dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::unavailable(source_id, format!("{}: {}", dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && image::ImageFormat::from_path(p).is_ok())
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(SourceError::unavailable(
                source_id,
                format!("no images in {}", dir.display()),
            ));
        }
        info!(source = %source_id, frames = files.len(), "Image directory opened");

        Ok(Self {
            source_id: source_id.to_string(),
            dir: dir.to_path_buf(),
            files,
            next: 0,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        debug!(source = %self.source_id, file = %path.display(), "Replaying frame");

        let img = image::open(path)
            .map_err(|e| SourceError::unavailable(&self.source_id, format!("{}: {}", path.display(), e)))?;
        Ok(Some(Frame::new(img.to_rgb8())))
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(SourceError::unavailable(
                &self.source_id,
                format!("{} is gone", self.dir.display()),
            ))
        }
    }
}

#[cfg(feature = "opencv")]
mod opencv_source {
    use std::time::Duration;

    use image::RgbImage;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{VideoCapture, CAP_ANY, CAP_FFMPEG, CAP_PROP_BUFFERSIZE},
    };
    use tracing::{info, warn};

    use super::{FrameSource, SourceKind};
    use crate::error::SourceError;
    use crate::frame::Frame;

    /// Device or network stream opened through OpenCV videoio.
    pub struct OpenCvSource {
        source_id: String,
        kind: SourceKind,
        cap: VideoCapture,
    }

    fn open_capture(source_id: &str, kind: &SourceKind) -> Result<VideoCapture, SourceError> {
        let unavailable = |e: opencv::Error| SourceError::unavailable(source_id, e);
        let mut cap = match kind {
            SourceKind::Device(index) => VideoCapture::new(*index, CAP_ANY).map_err(unavailable)?,
            SourceKind::Stream(url) => VideoCapture::from_file(url, CAP_FFMPEG).map_err(unavailable)?,
            SourceKind::ImageDir(dir) => {
                return Err(SourceError::unavailable(
                    source_id,
                    format!("{} is not a capture device", dir.display()),
                ))
            }
        };

        if !cap.is_opened().map_err(unavailable)? {
            return Err(SourceError::unavailable(
                source_id,
                format!("failed to open {}", kind.describe()),
            ));
        }

        // Buffer a single frame so reads return the latest one
        cap.set(CAP_PROP_BUFFERSIZE, 1.0).ok();
        Ok(cap)
    }

    impl OpenCvSource {
        pub fn open(source_id: &str, kind: SourceKind) -> Result<Self, SourceError> {
            let cap = open_capture(source_id, &kind)?;
            info!(source = %source_id, "Camera opened");
            Ok(Self {
                source_id: source_id.to_string(),
                kind,
                cap,
            })
        }

        fn to_rgb(&self, bgr: &Mat) -> Result<RgbImage, SourceError> {
            let fail = |e: opencv::Error| SourceError::unavailable(&self.source_id, e);
            let mut rgb = Mat::default();
            imgproc::cvt_color(bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(fail)?;
            let (w, h) = (rgb.cols() as u32, rgb.rows() as u32);
            let bytes = rgb.data_bytes().map_err(fail)?.to_vec();
            RgbImage::from_raw(w, h, bytes).ok_or_else(|| {
                SourceError::unavailable(&self.source_id, "frame buffer size mismatch")
            })
        }
    }

    impl FrameSource for OpenCvSource {
        fn read(&mut self) -> Result<Option<Frame>, SourceError> {
            let mut frame = Mat::default();
            let ok = self
                .cap
                .read(&mut frame)
                .map_err(|e| SourceError::unavailable(&self.source_id, e))?;

            if !ok || frame.empty() {
                return Err(SourceError::unavailable(
                    &self.source_id,
                    "empty frame or read error, stream may have dropped",
                ));
            }
            Ok(Some(Frame::new(self.to_rgb(&frame)?)))
        }

        fn reconnect(&mut self) -> Result<(), SourceError> {
            warn!(source = %self.source_id, "Reconnecting camera");
            let _ = self.cap.release();
            std::thread::sleep(Duration::from_secs(1));
            self.cap = open_capture(&self.source_id, &self.kind)?;
            info!(source = %self.source_id, "Camera reconnected");
            Ok(())
        }
    }

    impl Drop for OpenCvSource {
        fn drop(&mut self) {
            let _ = self.cap.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn parse_kinds() {
        assert_eq!(SourceKind::parse("0"), SourceKind::Device(0));
        assert_eq!(SourceKind::parse(" 2 "), SourceKind::Device(2));
        assert_eq!(
            SourceKind::parse("rtsp://localhost:8554/test"),
            SourceKind::Stream("rtsp://localhost:8554/test".into())
        );
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SourceKind::parse(dir.path().to_str().unwrap()),
            SourceKind::ImageDir(dir.path().to_path_buf())
        );
    }

    #[test]
    fn image_dir_replays_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([200, 0, 0])).save(dir.path().join("b.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([0, 200, 0])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut src = ImageDirSource::open("replay", dir.path()).unwrap();
        let first = src.read().unwrap().unwrap();
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([0, 200, 0]));
        let second = src.read().unwrap().unwrap();
        assert_eq!(second.image.get_pixel(0, 0), &Rgb([200, 0, 0]));
        assert!(src.read().unwrap().is_none());
    }

    #[test]
    fn empty_dir_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageDirSource::open("empty", dir.path()).err().unwrap();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn stream_without_backend_is_unavailable() {
        let cfg = SourceConfig {
            id: "phone".into(),
            url: "https://192.168.29.149:4343/video".into(),
            location: None,
        };
        let err = open_source(&cfg).err().unwrap();
        assert!(matches!(err, SourceError::Unavailable { ref source_id, .. } if source_id == "phone"));
    }
}
