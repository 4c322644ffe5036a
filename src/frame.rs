//! Frames, detections and content fingerprints.

use std::fmt;

use chrono::{DateTime, Utc};
use image::RgbImage;
use sha2::{Digest, Sha256};

/// One decoded camera frame, RGB8.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Stable hash over the frame dimensions and raw pixel bytes.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.image.width().to_le_bytes());
        hasher.update(self.image.height().to_le_bytes());
        hasher.update(self.image.as_raw());
        Fingerprint(hasher.finalize().into())
    }
}

/// Fingerprint of one frame, hashed on first use and reused after.
pub struct LazyFingerprint<'a> {
    frame: &'a Frame,
    value: Option<Fingerprint>,
}

impl<'a> LazyFingerprint<'a> {
    pub fn new(frame: &'a Frame) -> Self {
        Self { frame, value: None }
    }

    pub fn get(&mut self) -> Fingerprint {
        let frame = self.frame;
        *self.value.get_or_insert_with(|| frame.fingerprint())
    }

    pub fn is_computed(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Pixel-space box (x1, y1) top-left, (x2, y2) bottom-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One labeled box reported by the detector for a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    pub fn is_alert(&self, alert_label: &str, min_confidence: f32) -> bool {
        self.label == alert_label && self.confidence >= min_confidence
    }
}
