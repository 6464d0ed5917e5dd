use tokio::sync::mpsc;
use tracing::{debug, debug_span, warn};
use crate::config::SchedulerConfig;
use crate::error::{Error, SessionError};
use super::core_trait::{RecurrentModel, Sampler, Tokenizer};
use super::session::{Phase, Session, SessionId};

/// What one [`BatchScheduler::step`] did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    /// Sessions whose pending text was consumed
    pub prefilled: Vec<SessionId>,
    /// Tokens appended to a session's history, in batch order
    pub emitted: Vec<(SessionId, u32)>,
    /// Sessions whose quota reached zero
    pub finished: Vec<SessionId>,
    /// Sessions whose model pass failed; their remaining work was dropped and
    /// they are idle again
    pub failed: Vec<SessionId>,
}

impl StepReport {
    pub fn is_empty(&self) -> bool {
        self.prefilled.is_empty() && self.emitted.is_empty() && self.finished.is_empty() && self.failed.is_empty()
    }

    fn merge(&mut self, other: StepReport) {
        self.prefilled.extend(other.prefilled);
        self.emitted.extend(other.emitted);
        self.finished.extend(other.finished);
        self.failed.extend(other.failed);
    }
}

/// # BatchScheduler
///
/// Drives up to `max_sessions` independent sessions over one shared
/// [`RecurrentModel`].
///
/// Hosts create sessions, queue text with [`ingest`](Self::ingest) or a token
/// quota with [`generate`](Self::generate), and call [`step`](Self::step)
/// periodically. Each step:
///
/// 1. feeds every session's pending text through the model, one session at a
///    time in chunks of `prefill_chunk` tokens
/// 2. runs one batched single-token forward pass over every session with
///    quota left, samples a token per row and appends it to the session's
///    history, unless it is token 0 or completes a stop string
///
/// A session is busy from the moment work is queued until that work is
/// done; busy sessions reject new requests with [`SessionError::Busy`].
///
/// The scheduler is single-threaded and spawns nothing;
/// [`AsyncScheduler`](crate::driver::AsyncScheduler) runs it on a background
/// task.
pub struct BatchScheduler<M: RecurrentModel, T, S> {
    model: M,
    tokenizer: T,
    sampler: S,
    config: SchedulerConfig,
    prefill_chunk: usize,
    slots: Vec<Option<Session<M::State>>>,
}

impl<M, T, S> BatchScheduler<M, T, S>
where
    M: RecurrentModel,
    T: Tokenizer,
    S: Sampler,
{
    /// # Panics
    ///
    /// Panics if the configured default last token is outside the model's
    /// vocabulary.
    pub fn new(model: M, tokenizer: T, sampler: S, config: SchedulerConfig) -> Self {
        assert!(
            (config.default_last_token as usize) < model.vocab_size(),
            "default last token {} is outside the vocabulary of {}",
            config.default_last_token,
            model.vocab_size()
        );
        let prefill_chunk = config.prefill_chunk().min(model.max_tokens()).max(1);
        if prefill_chunk < config.prefill_chunk() {
            debug!(
                requested = config.prefill_chunk(),
                prefill_chunk,
                "prefill chunk clamped to the model's token budget"
            );
        }
        let slots = (0..config.max_sessions).map(|_| None).collect();
        Self {
            model,
            tokenizer,
            sampler,
            config,
            prefill_chunk,
            slots,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the live sessions, in slot order
    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.slots.iter().flatten().map(|session| session.id)
    }

    fn session(&self, id: SessionId) -> Result<&Session<M::State>, SessionError> {
        self.slots
            .iter()
            .flatten()
            .find(|session| session.id == id)
            .ok_or(SessionError::UnknownSession(id))
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session<M::State>, SessionError> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|session| session.id == id)
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Claim a free slot for a new session with a fresh state
    pub fn create_session(&mut self) -> Result<SessionId, Error> {
        let capacity = self.capacity();
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            warn!(capacity, "session pool is full");
            return Err(SessionError::CapacityExceeded { capacity }.into());
        };
        let session = Session::new(
            self.model.new_state()?,
            self.config.default_last_token,
            self.config.default_temperature,
            self.config.default_tau,
        );
        let id = session.id;
        *slot = Some(session);
        debug!(session = %id, "session created");
        Ok(id)
    }

    /// Free the session's slot. Queued work is dropped and any listener sees
    /// its channel close.
    pub fn release_session(&mut self, id: SessionId) -> Result<(), SessionError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|session| session.id == id))
            .ok_or(SessionError::UnknownSession(id))?;
        *slot = None;
        debug!(session = %id, "session released");
        Ok(())
    }

    /// Replace the session's state with a fresh one and forget its history
    pub fn reset_session(&mut self, id: SessionId) -> Result<(), Error> {
        let fresh = self.model.new_state()?;
        let last_token = self.config.default_last_token;
        let session = self.session_mut(id)?;
        if !session.accepts_requests() {
            return Err(SessionError::Busy { id }.into());
        }
        session.state = fresh;
        session.history.clear();
        session.last_token = last_token;
        Ok(())
    }

    /// Queue `text` to be fed through the session's state on the next step.
    ///
    /// The generated history is cleared. Empty text only clears the history.
    pub fn ingest(&mut self, id: SessionId, text: impl Into<String>) -> Result<(), SessionError> {
        let session = self.session_mut(id)?;
        if !session.accepts_requests() {
            warn!(session = %id, phase = ?session.phase(), "ingest rejected");
            return Err(SessionError::Busy { id });
        }
        let text = text.into();
        session.history.clear();
        if !text.is_empty() {
            session.pending = Some(text);
            session.busy = true;
        }
        Ok(())
    }

    /// Ask for up to `tokens` more tokens; zero is a no-op
    pub fn generate(&mut self, id: SessionId, tokens: usize) -> Result<(), SessionError> {
        let session = self.session_mut(id)?;
        if !session.accepts_requests() {
            warn!(session = %id, phase = ?session.phase(), "generate rejected");
            return Err(SessionError::Busy { id });
        }
        if tokens > 0 {
            session.quota = tokens;
            session.busy = true;
        }
        Ok(())
    }

    pub fn is_busy(&self, id: SessionId) -> Result<bool, SessionError> {
        Ok(self.session(id)?.busy)
    }

    pub fn phase(&self, id: SessionId) -> Result<Phase, SessionError> {
        Ok(self.session(id)?.phase())
    }

    /// Tokens generated since the last ingest
    pub fn history(&self, id: SessionId) -> Result<&[u32], SessionError> {
        Ok(&self.session(id)?.history)
    }

    /// [`history`](Self::history), decoded
    pub fn context(&self, id: SessionId) -> Result<String, SessionError> {
        self.tokenizer.decode(&self.session(id)?.history)
    }

    pub fn quota(&self, id: SessionId) -> Result<usize, SessionError> {
        Ok(self.session(id)?.quota)
    }

    pub fn last_token(&self, id: SessionId) -> Result<u32, SessionError> {
        Ok(self.session(id)?.last_token)
    }

    /// Override the token the next pass starts from.
    ///
    /// Fails with [`SessionError::InvalidToken`] when the model has no row for
    /// `token`.
    pub fn set_last_token(&mut self, id: SessionId, token: u32) -> Result<(), SessionError> {
        let vocab = self.model.vocab_size();
        let session = self.session_mut(id)?;
        if token as usize >= vocab {
            return Err(SessionError::InvalidToken { token, vocab });
        }
        session.last_token = token;
        Ok(())
    }

    pub fn set_temperature(&mut self, id: SessionId, temperature: f32) -> Result<(), SessionError> {
        self.session_mut(id)?.temperature = temperature;
        Ok(())
    }

    pub fn set_tau(&mut self, id: SessionId, tau: f32) -> Result<(), SessionError> {
        self.session_mut(id)?.tau = tau;
        Ok(())
    }

    /// Generation stops before any token whose decoding, together with the
    /// recent history, contains one of `stop`
    pub fn set_stop_sequences<I>(&mut self, id: SessionId, stop: I) -> Result<(), SessionError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.session_mut(id)?.stop = stop.into_iter().map(Into::into).collect();
        Ok(())
    }

    /// Send every token the session emits to `listener`
    pub fn set_listener(&mut self, id: SessionId, listener: mpsc::UnboundedSender<u32>) -> Result<(), SessionError> {
        self.session_mut(id)?.listener = Some(listener);
        Ok(())
    }

    /// Whether a [`step`](Self::step) would do anything
    pub fn has_work(&self) -> bool {
        self.slots.iter().flatten().any(|session| session.phase() != Phase::Idle)
    }

    /// Advance every session with queued work.
    ///
    /// A failing model pass only affects the sessions it ran for: they are
    /// listed in [`StepReport::failed`] and every other session still steps.
    pub fn step(&mut self) -> StepReport {
        let span = debug_span!("scheduler.step");
        let _guard = span.enter();
        let mut report = StepReport::default();

        for session in self.slots.iter_mut().flatten() {
            let Some(text) = session.pending.take() else {
                continue;
            };
            session.busy = false;
            match prefill(&mut self.model, &self.tokenizer, self.prefill_chunk, session, &text) {
                Ok(()) => report.prefilled.push(session.id),
                Err(error) => {
                    warn!(session = %session.id, %error, "prefill failed, dropping text");
                    report.failed.push(session.id);
                }
            }
        }

        let mut decoding: Vec<&mut Session<M::State>> = self
            .slots
            .iter_mut()
            .flatten()
            .filter(|session| session.quota > 0)
            .collect();
        let batch = self.model.max_batch().max(1);
        for group in decoding.chunks_mut(batch) {
            let result = decode(
                &mut self.model,
                &self.tokenizer,
                &mut self.sampler,
                self.config.stop_window,
                group,
                &mut report,
            );
            if let Err(error) = result {
                warn!(batch = group.len(), %error, "decode failed, stopping the batch");
                for session in group.iter_mut().filter(|session| session.quota > 0) {
                    session.quota = 0;
                    session.busy = false;
                    report.failed.push(session.id);
                }
            }
        }
        report
    }

    /// Step until no session has queued work
    pub fn run_until_idle(&mut self) -> StepReport {
        let mut total = StepReport::default();
        while self.has_work() {
            total.merge(self.step());
        }
        total
    }
}

/// Feed `text` through the session's state in slot 0.
///
/// The session's carried `last_token` goes first and the final text token is
/// held back as the new `last_token`, so every token is fed exactly once.
/// The session is untouched unless every chunk runs.
fn prefill<M: RecurrentModel, T: Tokenizer>(
    model: &mut M,
    tokenizer: &T,
    chunk: usize,
    session: &mut Session<M::State>,
    text: &str,
) -> Result<(), Error> {
    let mut tokens = match tokenizer.encode(text) {
        Ok(tokens) => tokens,
        Err(error) => {
            warn!(session = %session.id, %error, "dropping text the tokenizer rejected");
            return Ok(());
        }
    };
    let vocab = model.vocab_size();
    let encoded = tokens.len();
    tokens.retain(|&token| (token as usize) < vocab);
    if tokens.len() < encoded {
        warn!(session = %session.id, dropped = encoded - tokens.len(), vocab, "dropping tokens outside the vocabulary");
    }
    let Some((&last, head)) = tokens.split_last() else {
        return Ok(());
    };

    let mut feed = Vec::with_capacity(tokens.len());
    feed.push(session.last_token);
    feed.extend_from_slice(head);

    model.load_state(&session.state, 0)?;
    for window in feed.chunks(chunk) {
        model.forward(&[window.to_vec()])?;
    }
    model.store_state(&mut session.state, 0)?;
    session.last_token = last;
    debug!(session = %session.id, tokens = tokens.len(), chunks = feed.len().div_ceil(chunk), "prefilled");
    Ok(())
}

/// Whether appending `token` to the last `window` history tokens decodes to
/// text containing one of the session's stop strings
fn hits_stop<T: Tokenizer, St>(tokenizer: &T, session: &Session<St>, token: u32, window: usize) -> bool {
    if session.stop.is_empty() {
        return false;
    }
    let start = session.history.len() - window.min(session.history.len());
    let mut tail = session.history[start..].to_vec();
    tail.push(token);
    match tokenizer.decode(&tail) {
        Ok(text) => session.stop.iter().any(|stop| text.contains(stop.as_str())),
        Err(error) => {
            warn!(session = %session.id, %error, "stop check could not decode");
            false
        }
    }
}

/// One single-token forward pass over `group`, row `i` in slot `i`
fn decode<M: RecurrentModel, T: Tokenizer, S: Sampler>(
    model: &mut M,
    tokenizer: &T,
    sampler: &mut S,
    stop_window: usize,
    group: &mut [&mut Session<M::State>],
    report: &mut StepReport,
) -> Result<(), Error> {
    debug!(batch = group.len(), "decode");
    let mut tokens = Vec::with_capacity(group.len());
    for (slot, session) in group.iter().enumerate() {
        model.load_state(&session.state, slot)?;
        tokens.push(vec![session.last_token]);
    }
    let logits = model.forward(&tokens)?;

    for (slot, session) in group.iter_mut().enumerate() {
        let session: &mut Session<M::State> = session;
        let row = logits.get(slot).get(0).to_vec::<f32>()?;
        let token = sampler.select(&row, session.temperature, session.tau);
        session.quota -= 1;

        let stopped = token == 0 || hits_stop(tokenizer, session, token, stop_window);
        if stopped {
            debug!(session = %session.id, token, "stopped");
            session.quota = 0;
        } else {
            model.store_state(&mut session.state, slot)?;
            session.last_token = token;
            session.history.push(token);
            session.notify(token);
            report.emitted.push((session.id, token));
        }

        if session.quota == 0 {
            session.busy = false;
            report.finished.push(session.id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::Rwkv;
    use crate::sampler::TypicalSampler;
    use crate::testing::{tiny_checkpoint, ByteTokenizer, EchoModel, ScriptedSampler};

    fn echo(capacity: usize, sampler: ScriptedSampler) -> BatchScheduler<EchoModel, ByteTokenizer, ScriptedSampler> {
        let config = SchedulerConfig::default().with_max_sessions(capacity);
        BatchScheduler::new(EchoModel::new(capacity, 8), ByteTokenizer, sampler, config)
    }

    #[test]
    fn test_pool_exhaustion_leaves_others_untouched() {
        let mut scheduler = echo(2, ScriptedSampler::repeat(b'x' as u32));
        let a = scheduler.create_session().unwrap();
        let b = scheduler.create_session().unwrap();
        scheduler.generate(a, 2).unwrap();

        let result = scheduler.create_session();
        assert!(matches!(result, Err(Error::Session(SessionError::CapacityExceeded { capacity: 2 }))));
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.quota(a).unwrap(), 2);
        assert!(!scheduler.is_busy(b).unwrap());
    }

    #[test]
    fn test_release_frees_a_slot() {
        let mut scheduler = echo(1, ScriptedSampler::repeat(b'x' as u32));
        let a = scheduler.create_session().unwrap();
        scheduler.release_session(a).unwrap();
        assert!(matches!(scheduler.quota(a), Err(SessionError::UnknownSession(id)) if id == a));
        assert!(scheduler.create_session().is_ok());
    }

    #[test]
    fn test_busy_sessions_reject_requests() {
        let mut scheduler = echo(1, ScriptedSampler::repeat(b'x' as u32));
        let id = scheduler.create_session().unwrap();
        scheduler.ingest(id, "hi").unwrap();
        assert!(scheduler.is_busy(id).unwrap());
        assert!(matches!(scheduler.ingest(id, "again"), Err(SessionError::Busy { .. })));
        assert!(matches!(scheduler.generate(id, 3), Err(SessionError::Busy { .. })));

        scheduler.step();
        assert!(!scheduler.is_busy(id).unwrap());
        scheduler.generate(id, 3).unwrap();
        assert!(matches!(scheduler.ingest(id, "more"), Err(SessionError::Busy { .. })));
    }

    #[test]
    fn test_empty_text_and_zero_quota_stay_idle() {
        let mut scheduler = echo(1, ScriptedSampler::repeat(b'x' as u32));
        let id = scheduler.create_session().unwrap();
        scheduler.ingest(id, "").unwrap();
        scheduler.generate(id, 0).unwrap();
        assert_eq!(scheduler.phase(id).unwrap(), Phase::Idle);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn test_prefill_feeds_every_token_once() {
        let config = SchedulerConfig::default().with_max_sessions(1).with_prefill_chunk(2);
        let mut scheduler = BatchScheduler::new(EchoModel::new(1, 8), ByteTokenizer, ScriptedSampler::repeat(1), config);
        let id = scheduler.create_session().unwrap();
        scheduler.ingest(id, "hello").unwrap();
        let report = scheduler.step();

        assert_eq!(report.prefilled, vec![id]);
        let fed: Vec<u32> = [187, b'h', b'e', b'l', b'l'].map(u32::from).to_vec();
        let calls: Vec<Vec<Vec<u32>>> = vec![vec![vec![187, 104]], vec![vec![101, 108]], vec![vec![108]]];
        assert_eq!(scheduler.model().calls(), calls.as_slice());
        assert_eq!(scheduler.session(id).unwrap().state, fed);
        assert_eq!(scheduler.last_token(id).unwrap(), b'o' as u32);
    }

    #[test]
    fn test_prefill_chunk_is_clamped_to_model() {
        let config = SchedulerConfig::default().with_max_sessions(1).with_prefill_chunk(100);
        let mut scheduler = BatchScheduler::new(EchoModel::new(1, 3), ByteTokenizer, ScriptedSampler::repeat(1), config);
        let id = scheduler.create_session().unwrap();
        scheduler.ingest(id, "abcdefg").unwrap();
        scheduler.step();
        assert!(scheduler.model().calls().iter().all(|call| call[0].len() <= 3));
    }

    #[test]
    fn test_sessions_keep_separate_states() {
        let sampler = ScriptedSampler::new([b'1', b'2', b'3', b'4'].map(u32::from));
        let mut scheduler = echo(2, sampler);
        let a = scheduler.create_session().unwrap();
        let b = scheduler.create_session().unwrap();
        scheduler.set_last_token(a, 10).unwrap();
        scheduler.set_last_token(b, 20).unwrap();
        scheduler.generate(a, 2).unwrap();
        scheduler.generate(b, 2).unwrap();
        scheduler.run_until_idle();

        // rows sample in slot order: a gets 1 then 3, b gets 2 then 4
        assert_eq!(scheduler.session(a).unwrap().state, vec![10, b'1' as u32]);
        assert_eq!(scheduler.session(b).unwrap().state, vec![20, b'2' as u32]);
        assert_eq!(scheduler.context(a).unwrap(), "13");
        assert_eq!(scheduler.context(b).unwrap(), "24");
    }

    #[test]
    fn test_stop_string_ends_generation() {
        let sampler = ScriptedSampler::new("abcSTOP".bytes().map(u32::from));
        let mut scheduler = echo(1, sampler);
        let id = scheduler.create_session().unwrap();
        scheduler.set_stop_sequences(id, ["ST"]).unwrap();
        scheduler.generate(id, 10).unwrap();
        let report = scheduler.run_until_idle();

        assert_eq!(scheduler.context(id).unwrap(), "abcS");
        assert_eq!(scheduler.quota(id).unwrap(), 0);
        assert_eq!(scheduler.last_token(id).unwrap(), b'S' as u32);
        assert!(!scheduler.is_busy(id).unwrap());
        assert_eq!(report.emitted.len(), 4);
        assert_eq!(report.finished, vec![id]);
    }

    #[test]
    fn test_stop_window_bounds_the_check() {
        // "S" falls out of a one-token window before "T" arrives
        let sampler = ScriptedSampler::new("SxTy".bytes().map(u32::from));
        let config = SchedulerConfig::default().with_max_sessions(1).with_stop_window(1);
        let mut scheduler = BatchScheduler::new(EchoModel::new(1, 8), ByteTokenizer, sampler, config);
        let id = scheduler.create_session().unwrap();
        scheduler.set_stop_sequences(id, vec!["ST".to_string(), "SxT".to_string()]).unwrap();
        scheduler.generate(id, 4).unwrap();
        scheduler.run_until_idle();
        assert_eq!(scheduler.context(id).unwrap(), "SxTy");
    }

    #[test]
    fn test_token_zero_terminates() {
        let mut scheduler = echo(1, ScriptedSampler::new([b'a' as u32, 0, b'b' as u32]));
        let id = scheduler.create_session().unwrap();
        scheduler.generate(id, 5).unwrap();
        let report = scheduler.run_until_idle();

        assert_eq!(scheduler.history(id).unwrap(), &[b'a' as u32]);
        assert_eq!(scheduler.quota(id).unwrap(), 0);
        assert_eq!(report.emitted, vec![(id, b'a' as u32)]);
        // the state after 'a' was kept, the step that produced 0 was discarded
        assert_eq!(scheduler.session(id).unwrap().state, vec![187]);
    }

    #[test]
    fn test_listener_receives_emitted_tokens() {
        let mut scheduler = echo(1, ScriptedSampler::new("ok".bytes().map(u32::from)));
        let id = scheduler.create_session().unwrap();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        scheduler.set_listener(id, sender).unwrap();
        scheduler.generate(id, 2).unwrap();
        scheduler.run_until_idle();
        assert_eq!(receiver.try_recv().unwrap(), b'o' as u32);
        assert_eq!(receiver.try_recv().unwrap(), b'k' as u32);

        scheduler.release_session(id).unwrap();
        assert!(matches!(receiver.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_reset_restores_a_fresh_session() {
        let mut scheduler = echo(1, ScriptedSampler::repeat(b'x' as u32));
        let id = scheduler.create_session().unwrap();
        scheduler.generate(id, 2).unwrap();
        scheduler.run_until_idle();
        scheduler.reset_session(id).unwrap();
        assert!(scheduler.session(id).unwrap().state.is_empty());
        assert!(scheduler.history(id).unwrap().is_empty());
        assert_eq!(scheduler.last_token(id).unwrap(), 187);
    }

    #[test]
    fn test_failed_prefill_leaves_other_sessions_running() {
        let config = SchedulerConfig::default().with_max_sessions(2);
        let model = EchoModel::new(2, 8).failing_on(b'!' as u32);
        let mut scheduler = BatchScheduler::new(model, ByteTokenizer, ScriptedSampler::repeat(b'x' as u32), config);
        let a = scheduler.create_session().unwrap();
        let b = scheduler.create_session().unwrap();
        scheduler.generate(b, 2).unwrap();
        scheduler.ingest(a, "b!d").unwrap();

        let report = scheduler.step();
        assert_eq!(report.failed, vec![a]);
        assert!(report.prefilled.is_empty());
        assert_eq!(report.emitted, vec![(b, b'x' as u32)]);
        assert_eq!(scheduler.phase(a).unwrap(), Phase::Idle);
        assert_eq!(scheduler.last_token(a).unwrap(), 187);
        assert!(scheduler.session(a).unwrap().state.is_empty());

        scheduler.ingest(a, "fine").unwrap();
        let report = scheduler.run_until_idle();
        assert_eq!(report.prefilled, vec![a]);
        assert_eq!(report.finished, vec![b]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_failed_decode_stops_only_its_batch() {
        let config = SchedulerConfig::default().with_max_sessions(2);
        let model = EchoModel::new(2, 8).failing_on(b'!' as u32);
        let mut scheduler = BatchScheduler::new(model, ByteTokenizer, ScriptedSampler::repeat(b'x' as u32), config);
        let a = scheduler.create_session().unwrap();
        let b = scheduler.create_session().unwrap();
        scheduler.set_last_token(a, b'!' as u32).unwrap();
        scheduler.generate(a, 3).unwrap();
        scheduler.generate(b, 3).unwrap();

        let report = scheduler.step();
        assert_eq!(report.failed, vec![a, b]);
        assert!(report.emitted.is_empty());
        for id in [a, b] {
            assert_eq!(scheduler.quota(id).unwrap(), 0);
            assert!(!scheduler.is_busy(id).unwrap());
        }
        assert!(!scheduler.has_work());

        scheduler.set_last_token(a, b'a' as u32).unwrap();
        scheduler.generate(a, 1).unwrap();
        let report = scheduler.run_until_idle();
        assert_eq!(report.emitted, vec![(a, b'x' as u32)]);
    }

    #[test]
    fn test_last_token_outside_vocabulary_is_rejected() {
        let mut scheduler = echo(1, ScriptedSampler::repeat(b'x' as u32));
        let id = scheduler.create_session().unwrap();
        let result = scheduler.set_last_token(id, 300);
        assert!(matches!(result, Err(SessionError::InvalidToken { token: 300, vocab: 256 })));
        assert_eq!(scheduler.last_token(id).unwrap(), 187);

        scheduler.generate(id, 1).unwrap();
        assert_eq!(scheduler.run_until_idle().finished, vec![id]);
    }

    #[test]
    #[should_panic(expected = "outside the vocabulary")]
    fn test_default_last_token_must_fit_the_model() {
        let config = SchedulerConfig::default().with_max_sessions(1).with_default_last_token(256);
        let _ = BatchScheduler::new(EchoModel::new(1, 8), ByteTokenizer, ScriptedSampler::repeat(1), config);
    }

    #[test]
    fn test_prefill_drops_tokens_outside_vocabulary() {
        struct CharTokenizer;

        impl Tokenizer for CharTokenizer {
            fn encode(&self, text: &str) -> Result<Vec<u32>, SessionError> {
                Ok(text.chars().map(u32::from).collect())
            }

            fn decode(&self, tokens: &[u32]) -> Result<String, SessionError> {
                Ok(tokens.iter().filter_map(|&t| char::from_u32(t)).collect())
            }
        }

        let config = SchedulerConfig::default().with_max_sessions(1).with_prefill_chunk(4);
        let mut scheduler = BatchScheduler::new(EchoModel::new(1, 8), CharTokenizer, ScriptedSampler::repeat(1), config);
        let id = scheduler.create_session().unwrap();
        scheduler.ingest(id, "a€é").unwrap();
        let report = scheduler.step();

        assert_eq!(report.prefilled, vec![id]);
        let calls: Vec<Vec<Vec<u32>>> = vec![vec![vec![187, 97]]];
        assert_eq!(scheduler.model().calls(), calls.as_slice());
        assert_eq!(scheduler.last_token(id).unwrap(), 233);
    }

    #[test]
    fn test_context_decodes_generated_text() {
        let mut scheduler = echo(1, ScriptedSampler::new("héllo".bytes().map(u32::from)));
        let id = scheduler.create_session().unwrap();
        scheduler.ingest(id, "say").unwrap();
        scheduler.run_until_idle();
        scheduler.generate(id, 6).unwrap();
        scheduler.run_until_idle();

        assert_eq!(scheduler.context(id).unwrap(), "héllo");
        let encoded = scheduler.tokenizer().encode("héllo").unwrap();
        assert_eq!(scheduler.history(id).unwrap(), encoded.as_slice());
    }

    #[test]
    fn test_two_sessions_drain_to_idle() {
        let config = ModelConfig::default().with_head_size(4);
        let model = Rwkv::load(&tiny_checkpoint(), config, 2, 2).unwrap();
        let scheduler_config = SchedulerConfig::default().with_max_sessions(2);
        let mut scheduler = BatchScheduler::new(model, ByteTokenizer, TypicalSampler::from_seed(3), scheduler_config);

        let a = scheduler.create_session().unwrap();
        let b = scheduler.create_session().unwrap();
        for id in [a, b] {
            scheduler.set_temperature(id, 0.0).unwrap();
        }
        scheduler.ingest(a, "A").unwrap();
        scheduler.ingest(b, "B").unwrap();
        let report = scheduler.step();
        assert_eq!(report.prefilled, vec![a, b]);
        assert_eq!(scheduler.last_token(a).unwrap(), b'A' as u32);

        scheduler.generate(a, 5).unwrap();
        scheduler.generate(b, 5).unwrap();
        scheduler.run_until_idle();
        for id in [a, b] {
            assert_eq!(scheduler.quota(id).unwrap(), 0);
            assert!(!scheduler.is_busy(id).unwrap());
            assert!(scheduler.history(id).unwrap().len() <= 5);
        }
        assert!(!scheduler.has_work());
    }
}
