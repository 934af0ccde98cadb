//! Quality ladder, transcoder preset table and video sources.

mod controller;
mod driver;

pub use controller::*;
pub use driver::*;

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::bandwidth::NetworkClass;

/// Rungs of the quality ladder, ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityLevel {
    pub const LADDER: [QualityLevel; 4] = [QualityLevel::Low, QualityLevel::Medium, QualityLevel::High, QualityLevel::Ultra];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Low => "low",
            QualityLevel::Medium => "medium",
            QualityLevel::High => "high",
            QualityLevel::Ultra => "ultra",
        }
    }

    fn rung(&self) -> usize {
        *self as usize
    }

    pub fn step_down(&self) -> Option<QualityLevel> {
        self.rung().checked_sub(1).map(|i| Self::LADDER[i])
    }

    pub fn step_up(&self) -> Option<QualityLevel> {
        Self::LADDER.get(self.rung() + 1).copied()
    }

    /// Number of rungs between two levels.
    pub fn distance(&self, other: QualityLevel) -> usize {
        self.rung().abs_diff(other.rung())
    }

    pub fn preset(&self) -> &'static QualityPreset {
        &PRESETS[self.rung()]
    }

    /// Quality a player of the given size can make use of.
    pub fn for_viewport(viewport: Viewport) -> QualityLevel {
        let width = viewport.width as f64 * viewport.pixel_ratio;
        let height = viewport.height as f64 * viewport.pixel_ratio;
        if width >= 1920.0 || height >= 1080.0 {
            QualityLevel::Ultra
        } else if width >= 1280.0 || height >= 720.0 {
            QualityLevel::High
        } else if width >= 854.0 || height >= 480.0 {
            QualityLevel::Medium
        } else {
            QualityLevel::Low
        }
    }

    /// Ladder rung implied by the link classification: slow, medium and fast
    /// links map to `low`, `medium` and `high`.
    pub fn for_network(class: NetworkClass) -> QualityLevel {
        match class {
            NetworkClass::Slow => QualityLevel::Low,
            NetworkClass::Medium => QualityLevel::Medium,
            NetworkClass::Fast => QualityLevel::High,
        }
    }

    /// Parse a preset suffix such as `_720p` out of a file stem.
    pub fn from_suffix(stem: &str) -> Option<QualityLevel> {
        PRESETS
            .iter()
            .find(|p| stem.ends_with(p.suffix))
            .map(|p| p.level)
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output contract of the external transcoder for one ladder rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPreset {
    pub level: QualityLevel,
    pub height: u32,
    pub width: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub suffix: &'static str,
}

pub const PRESETS: [QualityPreset; 4] = [
    QualityPreset {
        level: QualityLevel::Low,
        height: 360,
        width: 640,
        bitrate_kbps: 400,
        fps: 24,
        suffix: "_360p",
    },
    QualityPreset {
        level: QualityLevel::Medium,
        height: 480,
        width: 854,
        bitrate_kbps: 800,
        fps: 30,
        suffix: "_480p",
    },
    QualityPreset {
        level: QualityLevel::High,
        height: 720,
        width: 1280,
        bitrate_kbps: 1200,
        fps: 30,
        suffix: "_720p",
    },
    QualityPreset {
        level: QualityLevel::Ultra,
        height: 1080,
        width: 1920,
        bitrate_kbps: 2000,
        fps: 30,
        suffix: "_1080p",
    },
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f64,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_ratio: 1.0,
        }
    }
}

/// One encoded variant of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSource {
    pub url: Url,
    pub quality: QualityLevel,
    pub format: String,
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoSource {
    pub fn new(url: Url, quality: QualityLevel) -> Self {
        let preset = quality.preset();
        let format = container_format(&url).unwrap_or_else(|| "mp4".to_string());
        Self {
            url,
            quality,
            format,
            bitrate_kbps: preset.bitrate_kbps,
            width: preset.width,
            height: preset.height,
        }
    }

    /// Build a source from a URL following the `<name>_<height>p.<ext>`
    /// convention; URLs without a suffix are treated as `medium`.
    pub fn from_url(url: Url) -> Self {
        let quality = file_stem(&url)
            .and_then(|stem| QualityLevel::from_suffix(&stem))
            .unwrap_or(QualityLevel::Medium);
        Self::new(url, quality)
    }

    pub fn mime_type(&self) -> String {
        format!("video/{}", self.format)
    }
}

fn file_name(url: &Url) -> Option<&str> {
    url.path_segments()?.last().filter(|s| !s.is_empty())
}

fn file_stem(url: &Url) -> Option<String> {
    let name = file_name(url)?;
    Some(name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name).to_string())
}

fn container_format(url: &Url) -> Option<String> {
    let name = file_name(url)?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Every ladder variant of a base URL, e.g. `clip.mp4` → `clip_360p.mp4` …
/// `clip_1080p.mp4`. A URL already carrying a suffix is normalised first.
pub fn ladder_sources(base: &Url) -> Vec<VideoSource> {
    QualityLevel::LADDER
        .iter()
        .filter_map(|level| variant_url(base, *level).map(|url| VideoSource::new(url, *level)))
        .collect()
}

pub fn variant_url(base: &Url, level: QualityLevel) -> Option<Url> {
    let name = file_name(base)?;
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let stem = PRESETS
        .iter()
        .find_map(|p| stem.strip_suffix(p.suffix))
        .unwrap_or(stem);
    let new_name = match ext {
        Some(ext) => format!("{}{}.{}", stem, level.preset().suffix, ext),
        None => format!("{}{}", stem, level.preset().suffix),
    };

    let mut url = base.clone();
    url.path_segments_mut().ok()?.pop().push(&new_name);
    Some(url)
}

/// The source for `level` if present, else the nearest lower, else the lowest.
pub fn source_for(sources: &[VideoSource], level: QualityLevel) -> Option<&VideoSource> {
    sources
        .iter()
        .filter(|s| s.quality <= level)
        .max_by_key(|s| s.quality)
        .or_else(|| sources.iter().min_by_key(|s| s.quality))
}
