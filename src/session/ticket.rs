//! Generationen-Ticket gegen verspätete Abschlüsse
//!
//! Jeder `start` zieht ein neues Ticket, jedes `stop` entwertet alle
//! ausgegebenen. Nach jedem `await` prüft die laufende Arbeit ihr Ticket und
//! gibt bei Ablauf alles frei, was sie erworben hat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SessionTicket {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl SessionTicket {
    /// Ticket ohne Controller, bleibt immer gültig
    pub fn detached() -> Self {
        Self {
            generation: 0,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Zähler, aus dem Tickets ausgegeben werden
#[derive(Debug, Clone, Default)]
pub(crate) struct GenerationCounter {
    current: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub(crate) fn issue(&self) -> SessionTicket {
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        SessionTicket {
            generation,
            current: Arc::clone(&self.current),
        }
    }

    pub(crate) fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ticket_expires_old() {
        let counter = GenerationCounter::default();
        let first = counter.issue();
        assert!(first.is_live());

        let second = counter.issue();
        assert!(!first.is_live());
        assert!(second.is_live());

        counter.invalidate();
        assert!(!second.is_live());
    }

    #[test]
    fn test_detached_ticket_is_live() {
        assert!(SessionTicket::detached().is_live());
    }
}
