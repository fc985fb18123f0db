//! Audio Context - Ausgabeziel für Conditioning-Chains
//!
//! Ein Context besitzt genau einen Destination-Stream, der alle
//! verbundenen Chains summiert. Der `AudioEngine` verwaltet einen einzigen
//! Context pro Prozess und stellt ihn bei Bedarf wieder her.

use super::media::MEDIA_SAMPLE_RATE;
use super::output::{AudioError, AudioOutput, OutputStream};
use super::pipeline::ConditioningChain;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Label des Destination-Streams
pub const DESTINATION_LABEL: &str = "destination";

/// Maximale Wartezeit auf Locks, die der Render-Thread hält
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioGraphError {
    #[error("Audio context is closed")]
    ContextClosed,

    #[error("Audio output unavailable: {0}")]
    Output(#[from] AudioError),

    #[error("No usable media source: {0}")]
    NoUsableSource(String),

    #[error("Graph node busy: {0}")]
    NodeBusy(&'static str),
}

// ============================================================================
// AUDIO CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Suspended,
    Closed,
}

struct ConnectedChain {
    id: Uuid,
    chain: Arc<Mutex<ConditioningChain>>,
}

pub struct AudioContext {
    id: Uuid,
    sample_rate: u32,
    state: Arc<Mutex<ContextState>>,
    inputs: Arc<Mutex<Vec<ConnectedChain>>>,
    destination: Mutex<Option<Box<dyn OutputStream>>>,
}

impl AudioContext {
    /// Öffnet einen neuen Context samt Destination-Stream
    pub fn open(output: &dyn AudioOutput) -> Result<Self, AudioGraphError> {
        let state = Arc::new(Mutex::new(ContextState::Running));
        let inputs: Arc<Mutex<Vec<ConnectedChain>>> = Arc::new(Mutex::new(Vec::new()));

        let render_state = Arc::clone(&state);
        let render_inputs = Arc::clone(&inputs);
        let destination = output.open(
            DESTINATION_LABEL,
            Box::new(move |out: &mut [f32]| {
                out.fill(0.0);
                if *render_state.lock() != ContextState::Running {
                    return;
                }
                for input in render_inputs.lock().iter() {
                    input.chain.lock().render_add(out);
                }
            }),
        )?;

        let id = Uuid::new_v4();
        tracing::info!("Audio context {} opened", id);

        Ok(Self {
            id,
            sample_rate: MEDIA_SAMPLE_RATE,
            state,
            inputs,
            destination: Mutex::new(Some(destination)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    /// Liveness-Checkpoint für den Graph-Aufbau
    pub fn ensure_open(&self) -> Result<(), AudioGraphError> {
        match self.state() {
            ContextState::Closed => Err(AudioGraphError::ContextClosed),
            _ => Ok(()),
        }
    }

    pub fn suspend(&self) -> Result<(), AudioGraphError> {
        self.ensure_open()?;
        if let Some(stream) = self.destination.lock().as_ref() {
            stream.pause()?;
        }
        *self.state.lock() = ContextState::Suspended;
        tracing::debug!("Audio context {} suspended", self.id);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), AudioGraphError> {
        self.ensure_open()?;
        if let Some(stream) = self.destination.lock().as_ref() {
            stream.resume()?;
        }
        *self.state.lock() = ContextState::Running;
        tracing::debug!("Audio context {} resumed", self.id);
        Ok(())
    }

    /// Verbindet eine Chain mit der Destination
    pub(crate) fn connect(
        &self,
        chain: Arc<Mutex<ConditioningChain>>,
    ) -> Result<Uuid, AudioGraphError> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        self.inputs.lock().push(ConnectedChain { id, chain });
        Ok(id)
    }

    /// Trennt eine Chain von der Destination
    pub(crate) fn disconnect(&self, id: Uuid) -> Result<(), AudioGraphError> {
        let mut inputs = self
            .inputs
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or(AudioGraphError::NodeBusy("destination"))?;
        inputs.retain(|input| input.id != id);
        Ok(())
    }

    /// Anzahl verbundener Chains
    pub fn connected_inputs(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Schließt den Context endgültig
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == ContextState::Closed {
            return;
        }
        *state = ContextState::Closed;
        drop(state);

        self.inputs.lock().clear();
        self.destination.lock().take();
        tracing::info!("Audio context {} closed", self.id);
    }
}

// ============================================================================
// AUDIO ENGINE
// ============================================================================

/// Prozessweiter Verwalter des Audio Contexts.
///
/// Wird dem Session Controller injiziert; `shutdown` nur beim Beenden
/// des Prozesses, nie bei `stop`.
pub struct AudioEngine {
    output: Arc<dyn AudioOutput>,
    context: Mutex<Option<Arc<AudioContext>>>,
}

impl AudioEngine {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            context: Mutex::new(None),
        }
    }

    pub fn output(&self) -> &Arc<dyn AudioOutput> {
        &self.output
    }

    /// Liefert einen laufenden Context: erstellt ihn, falls keiner existiert
    /// oder der alte geschlossen ist, und setzt einen pausierten fort.
    pub fn acquire(&self) -> Result<Arc<AudioContext>, AudioGraphError> {
        let mut slot = self.context.lock();

        if let Some(context) = slot.as_ref() {
            match context.state() {
                ContextState::Running => return Ok(Arc::clone(context)),
                ContextState::Suspended => {
                    context.resume()?;
                    return Ok(Arc::clone(context));
                }
                ContextState::Closed => {
                    tracing::info!("Audio context {} was closed, recreating", context.id());
                }
            }
        }

        let context = Arc::new(AudioContext::open(self.output.as_ref())?);
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Aktueller Context, ohne ihn anzulegen
    pub fn current(&self) -> Option<Arc<AudioContext>> {
        self.context.lock().clone()
    }

    /// Schließt den Context beim Herunterfahren
    pub fn shutdown(&self) {
        if let Some(context) = self.context.lock().take() {
            context.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::NullOutput;

    fn engine() -> (AudioEngine, NullOutput) {
        let output = NullOutput::new();
        (AudioEngine::new(Arc::new(output.clone())), output)
    }

    #[test]
    fn test_acquire_reuses_running_context() {
        let (engine, _) = engine();
        let a = engine.acquire().unwrap();
        let b = engine.acquire().unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_acquire_resumes_suspended_context() {
        let (engine, _) = engine();
        let context = engine.acquire().unwrap();
        context.suspend().unwrap();

        let again = engine.acquire().unwrap();
        assert_eq!(again.id(), context.id());
        assert_eq!(again.state(), ContextState::Running);
    }

    #[test]
    fn test_acquire_recreates_closed_context() {
        let (engine, output) = engine();
        let context = engine.acquire().unwrap();
        context.close();
        assert!(output.open_streams().is_empty());

        let fresh = engine.acquire().unwrap();
        assert_ne!(fresh.id(), context.id());
        assert_eq!(output.open_streams(), vec![DESTINATION_LABEL.to_string()]);
    }

    #[test]
    fn test_closed_context_fails_checkpoint() {
        let (engine, _) = engine();
        let context = engine.acquire().unwrap();
        context.close();
        assert!(matches!(
            context.ensure_open(),
            Err(AudioGraphError::ContextClosed)
        ));
    }

    #[test]
    fn test_destination_unavailable() {
        let engine = AudioEngine::new(Arc::new(NullOutput::failing(&[DESTINATION_LABEL])));
        assert!(matches!(engine.acquire(), Err(AudioGraphError::Output(_))));
    }

    #[test]
    fn test_shutdown_closes_context() {
        let (engine, _) = engine();
        let context = engine.acquire().unwrap();
        engine.shutdown();
        assert_eq!(context.state(), ContextState::Closed);
        assert!(engine.current().is_none());
    }
}
