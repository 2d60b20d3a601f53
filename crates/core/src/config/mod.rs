use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::{MAX_FFT_SIZE, MIN_FFT_SIZE};
use crate::Result;

/// Upper bound on how often the loop section may repeat.
pub const MAX_LOOP_COUNT: u32 = 1024;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub render: RenderConfig,
    pub song: SongConfig,
    pub analysis: AnalysisConfig,
}

impl AppConfig {
    /// Parses a JSON document, filling absent fields with defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.validate();
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Pulls every value back into the range the subsystems accept.
    pub fn validate(&mut self) {
        self.render.refresh_rate_hz = self.render.refresh_rate_hz.max(1);
        self.render.fps_slice_ms = self.render.fps_slice_ms.max(1);
        self.render.metrics_window_secs = self.render.metrics_window_secs.max(1);
        self.song.loop_count = self.song.loop_count.clamp(1, MAX_LOOP_COUNT);
        self.analysis.fft_size = self
            .analysis
            .fft_size
            .clamp(MIN_FFT_SIZE, MAX_FFT_SIZE)
            .next_power_of_two();
        self.analysis.smoothing = if self.analysis.smoothing.is_finite() {
            self.analysis.smoothing.clamp(0.0, 1.0)
        } else {
            AnalysisConfig::default().smoothing
        };
    }
}

/// Frame pacing and diagnostics settings for the render scheduling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub refresh_rate_hz: u32,
    /// Delay between iterations while the output is hidden.
    pub hidden_delay_ms: u64,
    pub metrics_window_secs: u64,
    pub fps_slice_ms: u64,
    pub use_worker: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 60,
            hidden_delay_ms: 200,
            metrics_window_secs: 10,
            fps_slice_ms: 1000,
            use_worker: true,
        }
    }
}

/// Settings applied when compiling a song's tick table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SongConfig {
    pub loop_count: u32,
    pub rebuild_throttle_ms: u64,
}

impl Default for SongConfig {
    fn default() -> Self {
        Self {
            loop_count: 1,
            rebuild_throttle_ms: 50,
        }
    }
}

/// Configuration specific to the audio analyser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    pub smoothing: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            fft_size: 2048,
            smoothing: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json_str(r#"{ "song": { "loop_count": 3 } }"#).unwrap();
        assert_eq!(config.song.loop_count, 3);
        assert_eq!(config.song.rebuild_throttle_ms, 50);
        assert_eq!(config.render, RenderConfig::default());
    }

    #[test]
    fn validation_normalises_ranges() {
        let config = AppConfig::from_json_str(
            r#"{ "song": { "loop_count": 0 }, "analysis": { "fft_size": 1000, "smoothing": 4.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.song.loop_count, 1);
        assert_eq!(config.analysis.fft_size, 1024);
        assert_eq!(config.analysis.smoothing, 1.0);

        let config =
            AppConfig::from_json_str(r#"{ "analysis": { "fft_size": 1000000 } }"#).unwrap();
        assert_eq!(config.analysis.fft_size, MAX_FFT_SIZE);
    }

    #[test]
    fn loop_count_is_capped() {
        let config =
            AppConfig::from_json_str(r#"{ "song": { "loop_count": 4000000000 } }"#).unwrap();
        assert_eq!(config.song.loop_count, MAX_LOOP_COUNT);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(AppConfig::from_json_str("{ song: ").is_err());
    }
}
