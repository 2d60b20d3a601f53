use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::modulation::{ModKey, Source};
use crate::{Result, SoundTileError};

/// RMS amplitude of the latest block.
pub const LEVEL: ModKey<f64> = ModKey::new("level");
/// Frequency in Hz of the loudest smoothed bin.
pub const PEAK_FREQUENCY: ModKey<f64> = ModKey::new("peakFrequency");

pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32_768;
/// Floor reported for silent bins.
pub const MIN_DECIBELS: f32 = -100.0;

/// Features extracted from one block of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFrame {
    /// Midpoint of the block in seconds since the analyser was reset.
    pub time: f64,
    pub rms: f64,
    pub peak_frequency: f64,
}

/// Spectrum analyser feeding audio tiles.
///
/// Each block is windowed over the most recent `fft_size` samples; bin
/// magnitudes are smoothed across blocks before conversion to decibels, the
/// same model browsers use for their analyser nodes.
pub struct Analyser {
    sample_rate: u32,
    fft_size: usize,
    smoothing: f32,
    processed_samples: usize,
    history: Vec<f32>,
    smoothed: Vec<f32>,
    decibels: Vec<f32>,
    latest: Option<AnalysisFrame>,
    source: Source,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl Analyser {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        check_fft_size(config.fft_size)?;
        let bins = config.fft_size / 2 + 1;
        Ok(Self {
            sample_rate: config.sample_rate.max(1),
            fft_size: config.fft_size,
            smoothing: clamp_smoothing(config.smoothing),
            processed_samples: 0,
            history: vec![0.0; config.fft_size],
            smoothed: vec![0.0; bins],
            decibels: vec![MIN_DECIBELS; bins],
            latest: None,
            source: Source::new("Audio Analyser")
                .with_property(LEVEL, 0.0)
                .with_property(PEAK_FREQUENCY, 0.0),
            fft_planner: RealFftPlanner::new(),
            fft: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Changes the transform length; smoothing history is discarded.
    pub fn set_fft_size(&mut self, fft_size: usize) -> Result<()> {
        check_fft_size(fft_size)?;
        if fft_size != self.fft_size {
            let bins = fft_size / 2 + 1;
            self.fft_size = fft_size;
            self.history = vec![0.0; fft_size];
            self.smoothed = vec![0.0; bins];
            self.decibels = vec![MIN_DECIBELS; bins];
        }
        Ok(())
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn set_smoothing(&mut self, smoothing: f64) {
        self.smoothing = clamp_smoothing(smoothing);
    }

    /// Modulation source publishing [`LEVEL`] and [`PEAK_FREQUENCY`].
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Smoothed spectrum in decibels, one value per bin up to Nyquist.
    pub fn frequency_data(&self) -> &[f32] {
        &self.decibels
    }

    pub fn latest_frame(&self) -> Option<&AnalysisFrame> {
        self.latest.as_ref()
    }

    /// Clears accumulated state while preserving configuration.
    pub fn reset(&mut self) {
        self.processed_samples = 0;
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.decibels.fill(MIN_DECIBELS);
        self.latest = None;
    }

    /// Consumes audio samples, updates the spectrum and pushes new values to
    /// the modulation source.
    pub fn process_block(&mut self, samples: &[f32]) -> Result<AnalysisFrame> {
        if samples.len() < 2 {
            return Err(SoundTileError::InvalidInput(
                "analysis requires blocks with at least two samples",
            ));
        }

        let sample_rate = f64::from(self.sample_rate);
        let start_time = self.processed_samples as f64 / sample_rate;
        let end_time = (self.processed_samples + samples.len()) as f64 / sample_rate;
        self.push_history(samples);
        self.update_spectrum()?;
        self.processed_samples += samples.len();

        let frame = AnalysisFrame {
            time: (start_time + end_time) * 0.5,
            rms: f64::from(compute_rms(samples)),
            peak_frequency: self.peak_frequency(),
        };
        self.source.set(LEVEL, frame.rms);
        self.source.set(PEAK_FREQUENCY, frame.peak_frequency);
        self.latest = Some(frame);
        Ok(frame)
    }

    fn push_history(&mut self, samples: &[f32]) {
        let size = self.fft_size;
        if samples.len() >= size {
            self.history.copy_from_slice(&samples[samples.len() - size..]);
        } else {
            self.history.rotate_left(samples.len());
            self.history[size - samples.len()..].copy_from_slice(samples);
        }
    }

    fn update_spectrum(&mut self) -> Result<()> {
        let size = self.fft_size;
        let smoothing = self.smoothing;
        let fft = prepare_fft(&mut self.fft_planner, &mut self.fft, size);
        for (index, (input, sample)) in fft.input.iter_mut().zip(&self.history).enumerate() {
            *input = sample * blackman_value(index, size);
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 1.0 / size as f32;
        for ((bin, smoothed), decibels) in fft
            .spectrum
            .iter()
            .zip(self.smoothed.iter_mut())
            .zip(self.decibels.iter_mut())
        {
            let magnitude = bin.norm() * scale;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
            *decibels = if *smoothed > 0.0 {
                (20.0 * smoothed.log10()).max(MIN_DECIBELS)
            } else {
                MIN_DECIBELS
            };
        }
        Ok(())
    }

    fn peak_frequency(&self) -> f64 {
        // DC is not a frequency anyone wants to visualise.
        let peak = self
            .smoothed
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1));
        match peak {
            Some((bin, &magnitude)) if magnitude > f32::EPSILON => {
                bin as f64 * f64::from(self.sample_rate) / self.fft_size as f64
            }
            _ => 0.0,
        }
    }
}

fn prepare_fft<'a>(
    planner: &mut RealFftPlanner<f32>,
    slot: &'a mut Option<FftResources>,
    size: usize,
) -> &'a mut FftResources {
    if slot.as_ref().is_some_and(|fft| fft.size != size) {
        *slot = None;
    }
    slot.get_or_insert_with(|| {
        let plan = planner.plan_fft_forward(size);
        FftResources {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    })
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for Analyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyser")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .field("processed_samples", &self.processed_samples)
            .field("latest", &self.latest)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn check_fft_size(size: usize) -> Result<()> {
    if size.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(SoundTileError::msg(format!(
            "fft size must be a power of two between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}, got {size}"
        )))
    }
}

fn clamp_smoothing(smoothing: f64) -> f32 {
    if smoothing.is_finite() {
        smoothing.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn blackman_value(index: usize, len: usize) -> f32 {
    const ALPHA: f32 = 0.16;
    let phase = 2.0 * PI * index as f32 / len as f32;
    let a0 = (1.0 - ALPHA) / 2.0;
    let a2 = ALPHA / 2.0;
    a0 - 0.5 * phase.cos() + a2 * (2.0 * phase).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::Target;

    fn analyser(sample_rate: u32, fft_size: usize, smoothing: f64) -> Analyser {
        Analyser::new(&AnalysisConfig {
            sample_rate,
            fft_size,
            smoothing,
        })
        .unwrap()
    }

    fn sine(frequency: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn silence_has_no_level_or_peak() {
        let mut analyser = analyser(48_000, 1024, 0.8);
        let frame = analyser.process_block(&[0.0; 1024]).unwrap();
        assert_eq!(frame.rms, 0.0);
        assert_eq!(frame.peak_frequency, 0.0);
        assert!(analyser.frequency_data().iter().all(|&db| db == MIN_DECIBELS));
    }

    #[test]
    fn finds_sine_frequency_and_level() {
        let mut analyser = analyser(1024, 256, 0.0);
        let frame = analyser.process_block(&sine(64.0, 1024, 256)).unwrap();
        assert_eq!(frame.peak_frequency, 64.0);
        assert!((frame.rms - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-3);
        assert!((frame.time - 0.125).abs() < 1e-9);
        assert_eq!(analyser.frequency_data().len(), 129);
    }

    #[test]
    fn smoothing_blends_consecutive_blocks() {
        let mut analyser = analyser(1024, 256, 0.5);
        let block = sine(64.0, 1024, 256);
        analyser.process_block(&block).unwrap();
        let first = analyser.frequency_data()[16];
        analyser.process_block(&block).unwrap();
        let second = analyser.frequency_data()[16];
        assert!((second - first - 20.0 * 1.5f32.log10()).abs() < 1e-3);
    }

    #[test]
    fn short_blocks_accumulate_history() {
        let mut analyser = analyser(1024, 256, 0.0);
        let block = sine(64.0, 1024, 256);
        for chunk in block.chunks(64) {
            analyser.process_block(chunk).unwrap();
        }
        assert_eq!(analyser.latest_frame().unwrap().peak_frequency, 64.0);
    }

    #[test]
    fn rejects_bad_input_and_sizes() {
        let mut analyser = analyser(48_000, 1024, 0.8);
        assert!(matches!(
            analyser.process_block(&[1.0]),
            Err(SoundTileError::InvalidInput(_))
        ));
        assert!(analyser.set_fft_size(1000).is_err());
        assert!(analyser.set_fft_size(16).is_err());
        analyser.set_fft_size(4096).unwrap();
        assert_eq!(analyser.frequency_data().len(), 2049);
    }

    #[test]
    fn pushes_values_to_modulation_targets() {
        let mut analyser = analyser(1024, 256, 0.0);
        let target = Target::new("meter").with_slot(LEVEL, -1.0);
        assert!(analyser.source().connect(&target, LEVEL, LEVEL));
        assert_eq!(target.get(LEVEL), Some(0.0));
        analyser.process_block(&[0.5; 256]).unwrap();
        assert!((target.get(LEVEL).unwrap() - 0.5).abs() < 1e-6);
    }
}
