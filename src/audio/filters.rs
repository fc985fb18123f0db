//! Biquad-Filter für die Conditioning-Chain
//!
//! Koeffizienten nach den Web-Audio-Formeln (Audio EQ Cookbook):
//! Low-/Highpass interpretieren Q in dB, Notch linear. Direct Form I mit
//! eigenem Zustand pro Kanal.

use serde::Serialize;
use std::f64::consts::PI;

// ============================================================================
// FILTER TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Highpass,
    Notch,
    Lowpass,
}

/// Ein Eintrag der Filterkaskade
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FilterSpec {
    pub kind: FilterKind,
    pub frequency_hz: f32,
    pub q: f32,
}

impl FilterSpec {
    pub const fn new(kind: FilterKind, frequency_hz: f32, q: f32) -> Self {
        Self {
            kind,
            frequency_hz,
            q,
        }
    }
}

/// Feste Kaskade: Rumpel-Highpass, Brumm-Notches (Harmonische), Lowpass.
/// Reihenfolge ist Teil des Verhaltens.
pub const FILTER_CASCADE: [FilterSpec; 12] = [
    FilterSpec::new(FilterKind::Highpass, 250.0, 2.0),
    FilterSpec::new(FilterKind::Notch, 93.75, 20.0),
    FilterSpec::new(FilterKind::Notch, 117.19, 20.0),
    FilterSpec::new(FilterKind::Notch, 140.63, 18.0),
    FilterSpec::new(FilterKind::Notch, 164.06, 18.0),
    FilterSpec::new(FilterKind::Notch, 187.50, 18.0),
    FilterSpec::new(FilterKind::Notch, 210.94, 18.0),
    FilterSpec::new(FilterKind::Notch, 234.38, 18.0),
    FilterSpec::new(FilterKind::Notch, 257.81, 18.0),
    FilterSpec::new(FilterKind::Notch, 70.31, 15.0),
    FilterSpec::new(FilterKind::Notch, 46.88, 15.0),
    FilterSpec::new(FilterKind::Lowpass, 15000.0, 1.0),
];

/// Ausgangsverstärkung der Chain
pub const OUTPUT_GAIN: f32 = 1.0;

// ============================================================================
// BIQUAD
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

#[derive(Debug, Clone)]
pub struct BiquadFilter {
    spec: FilterSpec,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    state: Vec<ChannelState>,
}

impl BiquadFilter {
    pub fn new(spec: FilterSpec, sample_rate: u32, channels: usize) -> Self {
        let nyquist = sample_rate as f64 / 2.0;
        let f0 = (spec.frequency_hz as f64).clamp(1.0, nyquist * 0.999);
        let w0 = 2.0 * PI * f0 / sample_rate as f64;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let q = spec.q as f64;

        let alpha = match spec.kind {
            FilterKind::Lowpass | FilterKind::Highpass => {
                sin_w0 / (2.0 * 10f64.powf(q / 20.0))
            }
            FilterKind::Notch => sin_w0 / (2.0 * q.max(1e-4)),
        };

        let (b0, b1, b2) = match spec.kind {
            FilterKind::Lowpass => {
                let b1 = 1.0 - cos_w0;
                (b1 / 2.0, b1, b1 / 2.0)
            }
            FilterKind::Highpass => {
                let b1 = 1.0 + cos_w0;
                (b1 / 2.0, -b1, b1 / 2.0)
            }
            FilterKind::Notch => (1.0, -2.0 * cos_w0, 1.0),
        };

        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        Self {
            spec,
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            state: vec![ChannelState::default(); channels.max(1)],
        }
    }

    pub fn spec(&self) -> FilterSpec {
        self.spec
    }

    /// Filtert interleaved Samples in-place
    pub fn process_interleaved(&mut self, samples: &mut [f32]) {
        let channels = self.state.len();
        for frame in samples.chunks_mut(channels) {
            for (sample, st) in frame.iter_mut().zip(self.state.iter_mut()) {
                let x0 = *sample as f64;
                let y0 = self.b0 * x0 + self.b1 * st.x1 + self.b2 * st.x2
                    - self.a1 * st.y1
                    - self.a2 * st.y2;
                st.x2 = st.x1;
                st.x1 = x0;
                st.y2 = st.y1;
                st.y1 = y0;
                *sample = y0 as f32;
            }
        }
    }

    pub fn reset(&mut self) {
        self.state.fill(ChannelState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48000;

    fn stereo_tone(freq: f32, seconds: f32) -> Vec<f32> {
        let frames = (RATE as f32 * seconds) as usize;
        (0..frames)
            .flat_map(|i| {
                let s = (2.0 * std::f32::consts::PI * freq * i as f32 / RATE as f32).sin() * 0.5;
                [s, s]
            })
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    /// Verhältnis Ausgang/Eingang über die letzte halbe Sekunde
    fn steady_gain(filters: &mut [BiquadFilter], freq: f32) -> f32 {
        let input = stereo_tone(freq, 2.0);
        let mut output = input.clone();
        for filter in filters.iter_mut() {
            filter.process_interleaved(&mut output);
        }
        let tail = RATE as usize; // letzte halbe Sekunde (Stereo)
        rms(&output[output.len() - tail..]) / rms(&input[input.len() - tail..])
    }

    fn cascade() -> Vec<BiquadFilter> {
        FILTER_CASCADE
            .iter()
            .map(|spec| BiquadFilter::new(*spec, RATE, 2))
            .collect()
    }

    #[test]
    fn test_cascade_order() {
        assert_eq!(FILTER_CASCADE.len(), 12);
        assert_eq!(FILTER_CASCADE[0].kind, FilterKind::Highpass);
        assert_eq!(FILTER_CASCADE[0].frequency_hz, 250.0);
        assert_eq!(FILTER_CASCADE[11].kind, FilterKind::Lowpass);
        assert_eq!(FILTER_CASCADE[11].frequency_hz, 15000.0);
        assert_eq!(FILTER_CASCADE[10].frequency_hz, 46.88);
        assert!(FILTER_CASCADE[1..11]
            .iter()
            .all(|f| f.kind == FilterKind::Notch));
    }

    #[test]
    fn test_notch_attenuates_centre() {
        let spec = FilterSpec::new(FilterKind::Notch, 93.75, 20.0);
        let mut filters = vec![BiquadFilter::new(spec, RATE, 2)];
        assert!(steady_gain(&mut filters, 93.75) < 0.1);
    }

    #[test]
    fn test_notch_passes_far_tone() {
        let spec = FilterSpec::new(FilterKind::Notch, 93.75, 20.0);
        let mut filters = vec![BiquadFilter::new(spec, RATE, 2)];
        let gain = steady_gain(&mut filters, 1000.0);
        assert!((gain - 1.0).abs() < 0.05, "gain {gain}");
    }

    #[test]
    fn test_cascade_passes_midrange() {
        let gain = steady_gain(&mut cascade(), 1000.0);
        assert!((gain - 1.0).abs() < 0.15, "gain {gain}");
    }

    #[test]
    fn test_cascade_removes_rumble() {
        assert!(steady_gain(&mut cascade(), 50.0) < 0.1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut filter = BiquadFilter::new(FILTER_CASCADE[0], RATE, 2);
        let mut samples = vec![1.0f32; 64];
        filter.process_interleaved(&mut samples);
        filter.reset();

        let mut silence = vec![0.0f32; 8];
        filter.process_interleaved(&mut silence);
        assert!(silence.iter().all(|&s| s == 0.0));
    }
}
