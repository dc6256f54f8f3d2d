//! Minimap localization.
//!
//! The detector itself (minimap cropping, template matching) lives outside
//! this crate. [`LocalizationAdapter`] only turns whatever the detector last
//! produced into a [`DetectionResult`] the state machine can trust: stale
//! samples become `Lost`, `Lost` never carries a position, and timestamps
//! never go backwards.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Player position in minimap coordinates, `y` growing upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Horizontal distance to `other`. Widened so any two positions fit.
    pub fn dx(&self, other: Position) -> i64 {
        i64::from(other.x) - i64::from(self.x)
    }

    pub fn dy(&self, other: Position) -> i64 {
        i64::from(other.y) - i64::from(self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimapBounds {
    pub width: i32,
    pub height: i32,
}

impl MinimapBounds {
    pub fn center(&self) -> Position {
        Position::new(self.width / 2, self.height / 2)
    }
}

/// How much the minimap crop can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimapQuality {
    /// Cleanly cropped.
    Clean,
    /// Found, but partly covered or not cleanly cropped.
    Degraded,
    /// No minimap at all.
    Lost,
}

impl MinimapQuality {
    pub fn is_valid(&self) -> bool {
        !matches!(self, MinimapQuality::Lost)
    }
}

/// One perception tick. Superseded by the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult {
    position: Option<Position>,
    quality: MinimapQuality,
    bounds: Option<MinimapBounds>,
    timestamp: Instant,
}

impl DetectionResult {
    pub fn lost(timestamp: Instant) -> Self {
        Self {
            position: None,
            quality: MinimapQuality::Lost,
            bounds: None,
            timestamp,
        }
    }

    /// A found minimap. `quality` must not be `Lost`; passing it yields a
    /// plain lost result.
    pub fn found(
        quality: MinimapQuality,
        bounds: MinimapBounds,
        position: Option<Position>,
        timestamp: Instant,
    ) -> Self {
        if !quality.is_valid() {
            return Self::lost(timestamp);
        }
        Self {
            position,
            quality,
            bounds: Some(bounds),
            timestamp,
        }
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn quality(&self) -> MinimapQuality {
        self.quality
    }

    pub fn bounds(&self) -> Option<MinimapBounds> {
        self.bounds
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Raw detector output, in image coordinates (`y` growing downward).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub quality: MinimapQuality,
    pub bounds: Option<MinimapBounds>,
    pub position: Option<Position>,
    pub captured_at: Instant,
}

/// The perception subsystem, as seen from the core.
///
/// `latest` must return immediately with whatever was last produced.
pub trait Detector: Send {
    fn latest(&self) -> Option<Sample>;

    /// Manual re-detect from the UI. Detectors that cache the minimap
    /// crop should drop it here.
    fn request_redetect(&self) {}
}

pub struct LocalizationAdapter {
    detector: Box<dyn Detector>,
    timeout: Duration,
    last: Option<DetectionResult>,
}

impl LocalizationAdapter {
    pub fn new(detector: Box<dyn Detector>, timeout: Duration) -> Self {
        Self {
            detector,
            timeout,
            last: None,
        }
    }

    /// Current detection, never blocking and never failing.
    ///
    /// A missing sample, or one older than the detector timeout, is `Lost`.
    pub fn detect(&mut self, now: Instant) -> DetectionResult {
        let timestamp = match self.last {
            Some(last) => last.timestamp.max(now),
            None => now,
        };

        let result = match self.detector.latest() {
            Some(sample) if now.saturating_duration_since(sample.captured_at) <= self.timeout => {
                match (sample.quality, sample.bounds) {
                    (MinimapQuality::Lost, _) | (_, None) => DetectionResult::lost(timestamp),
                    (quality, Some(bounds)) => {
                        let position = sample
                            .position
                            .map(|p| Position::new(p.x, bounds.height.saturating_sub(p.y)));
                        DetectionResult::found(quality, bounds, position, timestamp)
                    }
                }
            }
            _ => DetectionResult::lost(timestamp),
        };

        self.last = Some(result);
        result
    }

    /// Forward a manual re-detect and forget the previous reading.
    pub fn redetect(&mut self) {
        self.detector.request_redetect();
        self.last = None;
    }

    pub fn last(&self) -> Option<DetectionResult> {
        self.last
    }
}
