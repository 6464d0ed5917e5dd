use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque handle to a session in a [`BatchScheduler`](super::BatchScheduler)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a session will do on the next step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing queued; accepts text or a generation request
    Idle,
    /// Text is waiting to be fed through the model
    Prefilling,
    /// Tokens remain in the generation quota
    Decoding,
}

/// One conversation: its recurrent state plus the bookkeeping the scheduler
/// needs to drive it.
///
/// At most one of `pending` and a non-zero `quota` is set at a time.
pub(crate) struct Session<S> {
    pub(crate) id: SessionId,
    pub(crate) state: S,
    /// Tokens generated since the last ingest
    pub(crate) history: Vec<u32>,
    /// Token fed at the start of the next forward pass
    pub(crate) last_token: u32,
    pub(crate) stop: Vec<String>,
    pub(crate) temperature: f32,
    pub(crate) tau: f32,
    pub(crate) pending: Option<String>,
    pub(crate) quota: usize,
    pub(crate) busy: bool,
    pub(crate) listener: Option<mpsc::UnboundedSender<u32>>,
}

impl<S> Session<S> {
    pub(crate) fn new(state: S, last_token: u32, temperature: f32, tau: f32) -> Self {
        Self {
            id: SessionId::new(),
            state,
            history: Vec::new(),
            last_token,
            stop: Vec::new(),
            temperature,
            tau,
            pending: None,
            quota: 0,
            busy: false,
            listener: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        if self.pending.is_some() {
            Phase::Prefilling
        } else if self.quota > 0 {
            Phase::Decoding
        } else {
            Phase::Idle
        }
    }

    /// Busy sessions reject new text and new generation requests
    pub(crate) fn accepts_requests(&self) -> bool {
        !self.busy && self.phase() == Phase::Idle
    }

    /// Forward an emitted token; a dropped receiver is not an error
    pub(crate) fn notify(&self, token: u32) {
        if let Some(listener) = &self.listener {
            let _ = listener.send(token);
        }
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("busy", &self.busy)
            .field("quota", &self.quota)
            .field("last_token", &self.last_token)
            .field("history", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_follows_queued_work() {
        let mut session = Session::new((), 187, 0.9, 0.7);
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.accepts_requests());

        session.pending = Some("text".to_string());
        assert_eq!(session.phase(), Phase::Prefilling);
        assert!(!session.accepts_requests());

        session.pending = None;
        session.quota = 3;
        assert_eq!(session.phase(), Phase::Decoding);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
