//! Spectral Sampler - periodische Spitzen aus dem Analyser
//!
//! Ein einziger Timer-Task pro Sampler. `start` auf einem laufenden Sampler
//! tauscht nur den Analyser aus.

use super::analyser::AnalyserTap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bins mit Magnitude <= diesem Wert werden ignoriert
pub const PEAK_THRESHOLD: u8 = 50;

/// Maximale Anzahl Spitzen pro Snapshot
pub const MAX_PEAKS: usize = 10;

/// Standard-Abtastperiode
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// SNAPSHOTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpectralPeak {
    pub frequency_hz: f32,
    pub amplitude: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpectralSnapshot {
    pub taken_at: DateTime<Utc>,
    pub peaks: Vec<SpectralPeak>,
}

/// Wählt die stärksten Bins: Magnitude > Schwelle, absteigend, höchstens
/// `MAX_PEAKS`. Bin `i` entspricht `i * sample_rate / (2 * bin_count)`.
pub fn rank_peaks(bins: &[u8], sample_rate: u32) -> Vec<SpectralPeak> {
    if bins.is_empty() {
        return Vec::new();
    }
    let bin_hz = sample_rate as f32 / (2.0 * bins.len() as f32);

    let mut peaks: Vec<SpectralPeak> = bins
        .iter()
        .enumerate()
        .filter(|(_, &magnitude)| magnitude > PEAK_THRESHOLD)
        .map(|(i, &magnitude)| SpectralPeak {
            frequency_hz: i as f32 * bin_hz,
            amplitude: magnitude,
        })
        .collect();

    peaks.sort_by(|a, b| b.amplitude.cmp(&a.amplitude));
    peaks.truncate(MAX_PEAKS);
    peaks
}

// ============================================================================
// SAMPLER
// ============================================================================

pub struct SpectralSampler {
    interval: Duration,
    target: Arc<Mutex<Option<AnalyserTap>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    latest: Arc<Mutex<Option<SpectralSnapshot>>>,
    event_tx: broadcast::Sender<SpectralSnapshot>,
}

impl SpectralSampler {
    pub fn new(interval: Duration) -> Self {
        // `tokio::time::interval` verlangt eine Periode > 0
        let interval = if interval.is_zero() {
            tracing::warn!("Spectral interval of zero, using {:?}", DEFAULT_INTERVAL);
            DEFAULT_INTERVAL
        } else {
            interval
        };
        let (event_tx, _) = broadcast::channel(16);
        Self {
            interval,
            target: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
            latest: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Abonniert Snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<SpectralSnapshot> {
        self.event_tx.subscribe()
    }

    pub fn latest(&self) -> Option<SpectralSnapshot> {
        self.latest.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Startet das Sampling für `analyser`; der erste Snapshot folgt sofort.
    pub fn start(&self, analyser: AnalyserTap) {
        *self.target.lock() = Some(analyser);

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("Spectral sampler retargeted");
            return;
        }

        let target = Arc::clone(&self.target);
        let latest = Arc::clone(&self.latest);
        let event_tx = self.event_tx.clone();
        let period = self.interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(analyser) = target.lock().clone() else {
                    break;
                };

                let peaks = rank_peaks(&analyser.byte_frequency_data(), analyser.sample_rate());
                let snapshot = SpectralSnapshot {
                    taken_at: Utc::now(),
                    peaks,
                };

                *latest.lock() = Some(snapshot.clone());
                let _ = event_tx.send(snapshot);
            }
        }));

        tracing::debug!("Spectral sampler started ({:?} period)", period);
    }

    /// Stoppt das Sampling. Mehrfacher Aufruf ist ein No-op.
    pub fn stop(&self) {
        self.target.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("Spectral sampler stopped");
        }
    }
}

impl Default for SpectralSampler {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl Drop for SpectralSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_peaks_threshold_and_order() {
        let mut bins = vec![0u8; 1024];
        bins[10] = 120;
        bins[20] = 200;
        bins[30] = 50; // genau auf der Schwelle
        bins[40] = 51;

        let peaks = rank_peaks(&bins, 48000);
        let amplitudes: Vec<u8> = peaks.iter().map(|p| p.amplitude).collect();
        assert_eq!(amplitudes, vec![200, 120, 51]);

        // 20 * 48000 / 2048
        assert!((peaks[0].frequency_hz - 468.75).abs() < 1e-3);
    }

    #[test]
    fn test_rank_peaks_caps_at_ten() {
        let bins: Vec<u8> = (0..1024).map(|i| 60 + (i % 100) as u8).collect();
        let peaks = rank_peaks(&bins, 48000);
        assert_eq!(peaks.len(), MAX_PEAKS);
        assert!(peaks.windows(2).all(|w| w[0].amplitude >= w[1].amplitude));
    }

    #[test]
    fn test_rank_peaks_empty() {
        assert!(rank_peaks(&[], 48000).is_empty());
        assert!(rank_peaks(&[10; 1024], 48000).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_and_immediate_sample() {
        let sampler = SpectralSampler::new(Duration::from_secs(2));
        let mut rx = sampler.subscribe();

        sampler.start(AnalyserTap::new(48000));
        sampler.start(AnalyserTap::new(48000));
        assert!(sampler.is_running());

        // Erster Snapshot ohne Wartezeit
        let first = tokio::time::timeout(Duration::from_millis(10), rx.recv()).await;
        assert!(first.is_ok());

        // Genau ein Snapshot pro Periode trotz doppeltem start
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        sampler.stop();
        sampler.stop();
        assert!(!sampler.is_running());
        assert!(sampler.latest().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_falls_back_to_default() {
        let sampler = SpectralSampler::new(Duration::ZERO);
        let mut rx = sampler.subscribe();

        sampler.start(AnalyserTap::new(48000));
        assert!(rx.recv().await.is_ok());
        assert!(sampler.is_running());

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_ok());

        sampler.stop();
    }
}
