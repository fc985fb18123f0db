//! Analyser-Node - Frequenzdaten im Stil von `getByteFrequencyData`
//!
//! Der Render-Thread schreibt Zeitbereichs-Samples in ein Fenster, der
//! Spectral Sampler liest daraus periodisch ein Byte-Spektrum. Die FFT
//! läuft außerhalb des Locks.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

// ============================================================================
// CONSTANTS
// ============================================================================

/// FFT-Größe (Fensterlänge in Samples)
pub const FFT_SIZE: usize = 2048;

/// Zeitliche Glättung zwischen zwei Abfragen
pub const SMOOTHING: f32 = 0.8;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

const BIN_COUNT: usize = FFT_SIZE / 2;

/// Blackman-Fenster
static WINDOW: Lazy<Vec<f32>> = Lazy::new(|| {
    let n = FFT_SIZE as f32;
    (0..FFT_SIZE)
        .map(|i| {
            let x = i as f32 / n;
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
});

static FORWARD: Lazy<Arc<dyn RealToComplex<f32>>> =
    Lazy::new(|| RealFftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE));

// ============================================================================
// ANALYSER
// ============================================================================

struct AnalyserState {
    history: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
}

/// Geteilter Zugriff auf einen Analyser (Render-Thread und Sampler)
#[derive(Clone)]
pub struct AnalyserTap {
    sample_rate: u32,
    state: Arc<Mutex<AnalyserState>>,
}

impl AnalyserTap {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(Mutex::new(AnalyserState {
                history: vec![0.0; FFT_SIZE],
                write_pos: 0,
                smoothed: vec![0.0; BIN_COUNT],
            })),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frequency_bin_count(&self) -> usize {
        BIN_COUNT
    }

    /// Nimmt interleaved Samples auf (Downmix auf Mono)
    pub fn push_interleaved(&self, samples: &[f32], channels: usize) {
        let channels = channels.max(1);
        let mut state = self.state.lock();
        for frame in samples.chunks_exact(channels) {
            let mono = frame.iter().sum::<f32>() / channels as f32;
            let pos = state.write_pos;
            state.history[pos] = mono;
            state.write_pos = (pos + 1) % FFT_SIZE;
        }
    }

    /// Aktuelles Byte-Spektrum (`frequency_bin_count` Werte, 0..=255)
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let (frame, previous) = {
            let state = self.state.lock();
            let mut frame = Vec::with_capacity(FFT_SIZE);
            frame.extend_from_slice(&state.history[state.write_pos..]);
            frame.extend_from_slice(&state.history[..state.write_pos]);
            (frame, state.smoothed.clone())
        };

        let magnitudes = magnitude_spectrum(&frame);
        let smoothed: Vec<f32> = previous
            .iter()
            .zip(&magnitudes)
            .map(|(prev, mag)| SMOOTHING * prev + (1.0 - SMOOTHING) * mag)
            .collect();

        let bytes = smoothed.iter().map(|&m| to_byte(m)).collect();
        self.state.lock().smoothed = smoothed;
        bytes
    }

    /// Setzt Fenster und Glättung zurück
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.fill(0.0);
        state.write_pos = 0;
        state.smoothed.fill(0.0);
    }
}

/// |X[k]| / N für die ersten `BIN_COUNT` Bins eines gefensterten Frames
fn magnitude_spectrum(frame: &[f32]) -> Vec<f32> {
    let mut input: Vec<f32> = frame.iter().zip(WINDOW.iter()).map(|(s, w)| s * w).collect();
    let mut spectrum = FORWARD.make_output_vec();

    if let Err(e) = FORWARD.process(&mut input, &mut spectrum) {
        tracing::warn!("Analyser FFT failed: {}", e);
        return vec![0.0; BIN_COUNT];
    }

    spectrum
        .iter()
        .take(BIN_COUNT)
        .map(|bin| bin.norm() / FFT_SIZE as f32)
        .collect()
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 / (MAX_DECIBELS - MIN_DECIBELS) * (db - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let analyser = AnalyserTap::new(48000);
        assert!(analyser.byte_frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_peak_lands_in_expected_bin() {
        let analyser = AnalyserTap::new(48000);
        let tone: Vec<f32> = (0..FFT_SIZE)
            .flat_map(|i| {
                let s = (2.0 * PI * 1000.0 * i as f32 / 48000.0).sin() * 0.5;
                [s, s]
            })
            .collect();
        analyser.push_interleaved(&tone, 2);

        let bytes = analyser.byte_frequency_data();
        assert_eq!(bytes.len(), analyser.frequency_bin_count());

        let (peak_bin, peak) = bytes
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(i, &b)| (i, b))
            .unwrap();
        let bin_width = 48000.0 / FFT_SIZE as f32;
        assert!((peak_bin as f32 * bin_width - 1000.0).abs() < 50.0);
        assert!(peak > 50);
    }

    #[test]
    fn test_reset_clears_smoothing() {
        let analyser = AnalyserTap::new(48000);
        analyser.push_interleaved(&vec![0.5; FFT_SIZE * 2], 2);
        analyser.byte_frequency_data();
        analyser.reset();
        assert!(analyser.byte_frequency_data().iter().all(|&b| b == 0));
    }
}
