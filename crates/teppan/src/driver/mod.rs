//! # Async Driver
//!
//! [`AsyncScheduler`] runs a [`BatchScheduler`] on a background tokio task
//! and turns each [`GenerationRequest`] into a stream of tokens:
//!
//! ```text
//! run(request) ── create session ── ingest(prompt) ─┐
//!                                                   ▼
//!           worker: step() ── prefilled ──► generate(max_tokens)
//!                   step() ── emitted ────► ItemStream
//!                   step() ── finished ───► release session, stream ends
//!                   step() ── failed ─────► release session, stream ends
//! ```
//!
//! Requests share the scheduler's pool, so [`Generator::run`] fails with
//! [`SessionError::CapacityExceeded`] while every slot is taken.

mod item_stream;

pub use item_stream::ItemStream;

use std::collections::HashMap;
use std::sync::{Arc, atomic::Ordering};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};
use crate::core::worker::WorkerHandle;
use crate::error::{Result, SessionError};
use crate::scheduler::{BatchScheduler, RecurrentModel, Sampler, SessionId, Tokenizer};

/// One prompt to continue
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Upper bound on emitted tokens
    pub max_tokens: usize,
    /// Overrides the scheduler default
    pub temperature: Option<f32>,
    /// Overrides the scheduler default
    pub tau: Option<f32>,
    pub stop: Vec<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            temperature: None,
            tau: None,
            stop: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tau(mut self, tau: f32) -> Self {
        self.tau = Some(tau);
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }
}

/// # Generator
///
/// Anything that can turn a prompt into a stream of tokens.
#[async_trait]
pub trait Generator {
    /// Start generating for `request`. Returns as soon as the request is
    /// queued; tokens arrive on the stream as they are produced.
    async fn run(&self, request: GenerationRequest) -> Result<ItemStream<u32>>;
}

struct Shared<M: RecurrentModel, T, S> {
    scheduler: BatchScheduler<M, T, S>,
    /// Quotas to start once a session's prompt has been fed
    waiting: HashMap<SessionId, usize>,
}

impl<M, T, S> Shared<M, T, S>
where
    M: RecurrentModel,
    T: Tokenizer,
    S: Sampler,
{
    fn advance(&mut self) -> Result<()> {
        let report = self.scheduler.step();
        for id in report.prefilled {
            if let Some(tokens) = self.waiting.remove(&id) {
                self.scheduler.generate(id, tokens)?;
            }
        }
        for id in report.finished.into_iter().chain(report.failed) {
            self.waiting.remove(&id);
            self.scheduler.release_session(id)?;
        }
        Ok(())
    }

    /// Drop every session so no stream waits on a scheduler that cannot
    /// make progress
    fn abandon(&mut self) {
        let sessions: Vec<SessionId> = self.scheduler.sessions().collect();
        for id in sessions {
            let _ = self.scheduler.release_session(id);
        }
        self.waiting.clear();
    }

    fn submit(&mut self, request: GenerationRequest, listener: mpsc::UnboundedSender<u32>) -> Result<SessionId> {
        let id = self.scheduler.create_session()?;
        if let Err(error) = self.configure(id, request, listener) {
            let _ = self.scheduler.release_session(id);
            return Err(error.into());
        }
        Ok(id)
    }

    fn configure(
        &mut self,
        id: SessionId,
        request: GenerationRequest,
        listener: mpsc::UnboundedSender<u32>,
    ) -> std::result::Result<(), SessionError> {
        let scheduler = &mut self.scheduler;
        if let Some(temperature) = request.temperature {
            scheduler.set_temperature(id, temperature)?;
        }
        if let Some(tau) = request.tau {
            scheduler.set_tau(id, tau)?;
        }
        scheduler.set_stop_sequences(id, request.stop)?;
        scheduler.set_listener(id, listener)?;
        scheduler.ingest(id, request.prompt)?;

        if request.max_tokens == 0 {
            scheduler.release_session(id)?;
        } else if scheduler.is_busy(id)? {
            self.waiting.insert(id, request.max_tokens);
        } else {
            scheduler.generate(id, request.max_tokens)?;
        }
        Ok(())
    }
}

/// # AsyncScheduler
///
/// A [`BatchScheduler`] stepped by a background task for as long as any
/// session has work. Must be created inside a tokio runtime; dropping it
/// stops the task.
pub struct AsyncScheduler<M: RecurrentModel, T, S> {
    shared: Arc<Mutex<Shared<M, T, S>>>,
    worker: WorkerHandle,
}

impl<M, T, S> AsyncScheduler<M, T, S>
where
    M: RecurrentModel + Send + 'static,
    T: Tokenizer + Send + 'static,
    S: Sampler + Send + 'static,
{
    pub fn new(scheduler: BatchScheduler<M, T, S>) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            scheduler,
            waiting: HashMap::new(),
        }));
        let worker = WorkerHandle::spawn({
            let shared = shared.clone();
            move |running, notifier| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        let stepped = {
                            let mut shared = shared.lock().await;
                            if shared.scheduler.has_work() {
                                if let Err(error) = shared.advance() {
                                    error!(%error, "step failed, releasing every session");
                                    shared.abandon();
                                }
                                true
                            } else {
                                false
                            }
                        };
                        if stepped {
                            tokio::task::yield_now().await;
                        } else {
                            notifier.notified().await;
                        }
                    }
                    debug!("scheduler loop stopped");
                })
            }
        });
        Self { shared, worker }
    }

    /// Sessions currently holding a slot
    pub async fn active_sessions(&self) -> usize {
        self.shared.lock().await.scheduler.len()
    }

    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

#[async_trait]
impl<M, T, S> Generator for AsyncScheduler<M, T, S>
where
    M: RecurrentModel + Send + 'static,
    T: Tokenizer + Send + 'static,
    S: Sampler + Send + 'static,
{
    async fn run(&self, request: GenerationRequest) -> Result<ItemStream<u32>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.shared.lock().await.submit(request, sender)?;
        debug!(session = %id, "request queued");
        self.worker.wake();
        Ok(ItemStream::new(receiver))
    }
}
