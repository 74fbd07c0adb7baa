// sitesnap/src/engine/mod.rs
//! Step engine shared by the backup, restore and update processes.
//!
//! A process is a fixed, ordered list of steps. Every call to
//! [`Engine::advance`] runs exactly one step for one actor and persists the
//! outcome, so the whole run is driven by an external poll.

pub mod history;
pub mod lock;
pub mod state;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{error, info, warn};

use crate::errors::AppError;
use history::{HistoryStore, RunRecord};
use lock::{LockName, LockRecord, SystemLock};
use state::{ProcessState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Backup,
    Restore,
    Update,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Backup => "backup",
            ProcessKind::Restore => "restore",
            ProcessKind::Update => "update",
        }
    }

    pub fn lock_name(&self) -> LockName {
        match self {
            ProcessKind::Backup => LockName::BackupRunning,
            ProcessKind::Restore | ProcessKind::Update => LockName::MaintenanceMode,
        }
    }

    /// A half-applied restore or update cannot be resumed blindly; a backup
    /// only ever writes its own artifacts and can.
    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            ProcessKind::Backup => FailurePolicy::Resume,
            ProcessKind::Restore | ProcessKind::Update => FailurePolicy::Abort,
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep the persisted step pointer so the next poll retries the step.
    Resume,
    /// Delete the process state and clean up.
    Abort,
}

/// A step identifier with a fixed position in its process's sequence.
pub trait StepId: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const SEQUENCE: &'static [Self];

    fn as_str(&self) -> &'static str;

    fn index(&self) -> usize {
        Self::SEQUENCE
            .iter()
            .position(|candidate| candidate == self)
            .unwrap_or(0)
    }

    fn first() -> Self {
        Self::SEQUENCE[0]
    }

    fn parse(name: &str) -> Option<Self> {
        Self::SEQUENCE
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == name)
    }

    fn percentage(&self) -> f64 {
        progress_percentage(self.index(), Self::SEQUENCE.len())
    }
}

/// Declares a step enum together with its [`StepId`] sequence. Variant order
/// is the execution order.
macro_rules! step_sequence {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::engine::StepId for $name {
            const SEQUENCE: &'static [Self] = &[$($name::$variant),+];

            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }
    };
}
pub(crate) use step_sequence;

/// `round(index / (len - 1) * 100, 2)`.
pub fn progress_percentage(index: usize, len: usize) -> f64 {
    if len < 2 {
        return 100.0;
    }
    let raw = index as f64 / (len - 1) as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// What a caller gets back from every `advance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    pub step: String,
    pub next_step: Option<String>,
    pub percentage: f64,
}

impl StepResult {
    fn advanced<S: StepId>(step: S, next: S, message: String) -> Self {
        StepResult {
            success: true,
            message,
            step: step.as_str().to_string(),
            next_step: Some(next.as_str().to_string()),
            percentage: step.percentage(),
        }
    }

    fn finished<S: StepId>(step: S, message: String) -> Self {
        StepResult {
            success: true,
            message,
            step: step.as_str().to_string(),
            next_step: None,
            percentage: step.percentage(),
        }
    }

    fn failed<S: StepId>(step: S, message: String) -> Self {
        StepResult {
            success: false,
            message,
            step: step.as_str().to_string(),
            next_step: None,
            percentage: step.percentage(),
        }
    }
}

/// Result of a step handler that ran to completion.
///
/// Errors are returned separately through `anyhow::Result` and take the
/// failure path; `Reject` is a closed precondition and changes nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<S> {
    Advance { next: S, message: String },
    Finish { message: String },
    Reject { message: String },
}

impl<S> StepOutcome<S> {
    pub fn advance(next: S, message: impl Into<String>) -> Self {
        StepOutcome::Advance {
            next,
            message: message.into(),
        }
    }

    pub fn finish(message: impl Into<String>) -> Self {
        StepOutcome::Finish {
            message: message.into(),
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        StepOutcome::Reject {
            message: message.into(),
        }
    }
}

pub enum LockAttempt {
    Acquired(LockRecord),
    Busy(LockRecord),
}

/// Mutable view handed to a step handler. Changes to `state` are persisted
/// only when the handler succeeds.
pub struct StepContext<'a> {
    pub state: &'a mut ProcessState,
    lock: &'a SystemLock,
    lock_name: LockName,
}

impl StepContext<'_> {
    pub fn actor(&self) -> &str {
        &self.state.actor
    }

    pub fn acquire_lock(&self) -> crate::errors::Result<LockAttempt> {
        match self.lock.acquire(self.lock_name, &self.state.holder()) {
            Ok(record) => Ok(LockAttempt::Acquired(record)),
            Err(AppError::LockBusy(held)) => Ok(LockAttempt::Busy(held)),
            Err(e) => Err(e),
        }
    }

    pub fn system_lock(&self) -> Option<LockRecord> {
        self.lock.current().ok().flatten()
    }
}

#[async_trait]
pub trait Process: Send + Sync {
    type Step: StepId;
    const KIND: ProcessKind;

    async fn run_step(
        &self,
        step: Self::Step,
        ctx: &mut StepContext<'_>,
    ) -> anyhow::Result<StepOutcome<Self::Step>>;

    /// Best-effort removal of anything the process left on disk. Never fails.
    async fn cleanup(&self, state: &ProcessState);
}

pub struct Engine<P: Process> {
    process: P,
    store: StateStore,
    history: HistoryStore,
    lock: SystemLock,
    ttl: chrono::Duration,
}

impl<P: Process> Engine<P> {
    pub fn new(
        process: P,
        store: StateStore,
        history: HistoryStore,
        lock: SystemLock,
        ttl: chrono::Duration,
    ) -> Self {
        Engine {
            process,
            store,
            history,
            lock,
            ttl,
        }
    }

    #[cfg(test)]
    pub fn process(&self) -> &P {
        &self.process
    }

    /// Persisted state for `actor`, with expired state discarded.
    pub async fn state(&self, actor: &str) -> anyhow::Result<Option<ProcessState>> {
        let Some(state) = self.store.load(P::KIND, actor)? else {
            return Ok(None);
        };
        if state.is_expired(Utc::now()) {
            warn!(kind = %P::KIND, actor, step = %state.current_step, "Process state expired, restarting from the first step");
            self.record(&state, |run| run.abort("expired"));
            self.discard(&state).await;
            return Ok(None);
        }
        Ok(Some(state))
    }

    pub async fn current_step(&self, actor: &str) -> anyhow::Result<P::Step> {
        Ok(self
            .state(actor)
            .await?
            .and_then(|state| P::Step::parse(&state.current_step))
            .unwrap_or_else(P::Step::first))
    }

    /// Seeds a fresh state at the first step with `payload`.
    pub async fn begin(&self, actor: &str, payload: Map<String, Value>) -> anyhow::Result<ProcessState> {
        let first = P::Step::first();
        if let Some(existing) = self.state(actor).await? {
            if existing.current_step != first.as_str() {
                return Err(AppError::Precondition(format!(
                    "A {} is already in progress at step '{}'; abort it first",
                    P::KIND,
                    existing.current_step
                ))
                .into());
            }
        }
        let mut state = ProcessState::new(actor, P::KIND, first.as_str(), self.ttl);
        state.payload = payload;
        self.store.save(&state)?;
        info!(kind = %P::KIND, actor, "Process state created");
        Ok(state)
    }

    /// Runs the current step for `actor` and persists its outcome.
    ///
    /// Step failures are reported through the returned [`StepResult`]; the
    /// error case is reserved for a state store that cannot be read or
    /// written at all.
    pub async fn advance(&self, actor: &str) -> anyhow::Result<StepResult> {
        let first = P::Step::first();
        let state = match self.state(actor).await? {
            Some(state) => state,
            None => ProcessState::new(actor, P::KIND, first.as_str(), self.ttl),
        };

        let Some(step) = P::Step::parse(&state.current_step) else {
            let message = format!("Unknown {} step '{}'", P::KIND, state.current_step);
            error!(kind = %P::KIND, actor, "{message}");
            self.record(&state, |run| run.abort(&message));
            self.discard(&state).await;
            return Ok(StepResult::failed(first, message));
        };

        info!(kind = %P::KIND, actor, step = step.as_str(), "Running step");
        let mut working = state.clone();

        if step != first {
            match self.lock.acquire(P::KIND.lock_name(), &working.holder()) {
                Ok(_) => {}
                Err(AppError::LockBusy(held)) => {
                    warn!(kind = %P::KIND, actor, step = step.as_str(), "System lock held by another process");
                    return Ok(StepResult::failed(step, held.busy_message()));
                }
                Err(e) => return self.fail(&working, step, e.into()).await,
            }
        }

        let outcome = {
            let mut ctx = StepContext {
                state: &mut working,
                lock: &self.lock,
                lock_name: P::KIND.lock_name(),
            };
            self.process.run_step(step, &mut ctx).await
        };

        match outcome {
            Ok(StepOutcome::Advance { next, message }) => {
                if next.index() <= step.index() {
                    let err = AppError::Integrity(format!(
                        "step '{}' tried to move back to '{}'",
                        step.as_str(),
                        next.as_str()
                    ));
                    return self.fail(&working, step, err.into()).await;
                }
                working.current_step = next.as_str().to_string();
                self.store.save(&working)?;
                self.record(&working, |run| run.progress(next.as_str()));
                info!(kind = %P::KIND, actor, step = step.as_str(), next = next.as_str(), "Step completed");
                Ok(StepResult::advanced(step, next, message))
            }
            Ok(StepOutcome::Finish { message }) => {
                self.store.delete(P::KIND, actor)?;
                self.record(&working, |run| run.finish(step.as_str(), &message));
                self.release_lock(&working);
                info!(kind = %P::KIND, actor, "Process finished");
                Ok(StepResult::finished(step, message))
            }
            Ok(StepOutcome::Reject { message }) => {
                warn!(kind = %P::KIND, actor, step = step.as_str(), "Step rejected: {message}");
                Ok(StepResult::failed(step, message))
            }
            Err(err) => self.fail(&working, step, err).await,
        }
    }

    /// Clears the actor's process, the lock it held and its temp files.
    /// Returns whether there was anything to abort.
    pub async fn abort(&self, actor: &str, reason: &str) -> anyhow::Result<bool> {
        match self.store.load(P::KIND, actor)? {
            Some(state) => {
                info!(kind = %P::KIND, actor, step = %state.current_step, reason, "Aborting process");
                self.record(&state, |run| run.abort(reason));
                self.discard(&state).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(
        &self,
        working: &ProcessState,
        step: P::Step,
        err: anyhow::Error,
    ) -> anyhow::Result<StepResult> {
        let message = format!("{err:#}");
        error!(kind = %P::KIND, actor = %working.actor, step = step.as_str(), error = %message, "Step failed");

        let policy = P::KIND.failure_policy();
        if self.is_persisted(working) {
            self.record(working, |run| {
                run.fail(step.as_str(), &message, policy == FailurePolicy::Abort)
            });
        }
        match policy {
            FailurePolicy::Resume => self.release_lock(working),
            FailurePolicy::Abort => self.discard(working).await,
        }
        Ok(StepResult::failed(step, message))
    }

    /// Past and current runs for `actor`, newest first.
    pub fn history(&self, actor: &str) -> anyhow::Result<Vec<RunRecord>> {
        state::validate_actor(actor)?;
        Ok(self.history.list(P::KIND, Some(actor))?)
    }

    /// A first step that fails before anything was saved leaves no run behind.
    fn is_persisted(&self, state: &ProcessState) -> bool {
        matches!(self.store.load(state.kind, &state.actor), Ok(Some(stored)) if stored.key == state.key)
    }

    fn record(&self, state: &ProcessState, change: impl FnOnce(&mut RunRecord)) {
        if let Err(e) = self.history.update(state, change) {
            warn!(kind = %state.kind, actor = %state.actor, error = %e, "Failed to write run history");
        }
    }

    async fn discard(&self, state: &ProcessState) {
        self.process.cleanup(state).await;
        if let Err(e) = self.store.delete(state.kind, &state.actor) {
            warn!(kind = %state.kind, actor = %state.actor, error = %e, "Failed to delete process state");
        }
        self.release_lock(state);
    }

    fn release_lock(&self, state: &ProcessState) {
        if let Err(e) = self.lock.release(&state.holder()) {
            warn!(kind = %state.kind, actor = %state.actor, error = %e, "Failed to release system lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use history::RunStatus;
    use lock::LockHolder;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    step_sequence! {
        enum ToyStep {
            Start => "start",
            A => "a",
            B => "b",
            End => "end",
        }
    }

    #[derive(Default)]
    struct Toy {
        fail_at: Mutex<Option<ToyStep>>,
        reject_start: AtomicBool,
        cleaned: AtomicUsize,
    }

    impl Toy {
        fn run(&self, step: ToyStep, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutcome<ToyStep>> {
            if *self.fail_at.lock().unwrap() == Some(step) {
                anyhow::bail!("disk full at {}", step.as_str());
            }
            match step {
                ToyStep::Start => {
                    if self.reject_start.load(Ordering::SeqCst) {
                        return Ok(StepOutcome::reject("not now"));
                    }
                    if let LockAttempt::Busy(held) = ctx.acquire_lock()? {
                        return Ok(StepOutcome::reject(held.busy_message()));
                    }
                    ctx.state.set("tmp_dir", "/tmp/toy")?;
                    Ok(StepOutcome::advance(ToyStep::A, "started"))
                }
                ToyStep::A => Ok(StepOutcome::advance(ToyStep::B, "a done")),
                ToyStep::B => Ok(StepOutcome::advance(ToyStep::End, "b done")),
                ToyStep::End => Ok(StepOutcome::finish("all done")),
            }
        }
    }

    #[derive(Default)]
    struct ResumingToy(Toy);

    #[derive(Default)]
    struct AbortingToy(Toy);

    #[async_trait]
    impl Process for ResumingToy {
        type Step = ToyStep;
        const KIND: ProcessKind = ProcessKind::Backup;

        async fn run_step(&self, step: ToyStep, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutcome<ToyStep>> {
            self.0.run(step, ctx)
        }

        async fn cleanup(&self, _state: &ProcessState) {
            self.0.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Process for AbortingToy {
        type Step = ToyStep;
        const KIND: ProcessKind = ProcessKind::Restore;

        async fn run_step(&self, step: ToyStep, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutcome<ToyStep>> {
            self.0.run(step, ctx)
        }

        async fn cleanup(&self, _state: &ProcessState) {
            self.0.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine<P: Process>(dir: &TempDir, process: P) -> Engine<P> {
        let ttl = chrono::Duration::hours(1);
        Engine::new(
            process,
            StateStore::new(dir.path()),
            HistoryStore::new(dir.path()),
            SystemLock::new(dir.path(), ttl),
            ttl,
        )
    }

    #[test]
    fn test_percentage() {
        assert_eq!(progress_percentage(1, 4), 33.33);
        assert_eq!(ToyStep::A.percentage(), 33.33);
        assert_eq!(ToyStep::Start.percentage(), 0.0);
        assert_eq!(ToyStep::End.percentage(), 100.0);
        assert_eq!(ToyStep::parse("b"), Some(ToyStep::B));
        assert_eq!(ToyStep::parse("nope"), None);
    }

    #[tokio::test]
    async fn test_runs_to_completion() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(engine.advance("7").await?);
        }

        let steps: Vec<&str> = results.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, ["start", "a", "b", "end"]);
        assert!(results.iter().all(|r| r.success));
        assert!(results.windows(2).all(|w| w[0].percentage <= w[1].percentage));
        assert_eq!(results[0].percentage, 0.0);
        assert_eq!(results[3].percentage, 100.0);
        assert_eq!(results[3].next_step, None);
        assert_eq!(results[0].next_step.as_deref(), Some("a"));

        assert!(engine.state("7").await?.is_none());
        assert!(engine.lock.current()?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_step_is_idempotent_and_resumable() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        *engine.process().0.fail_at.lock().unwrap() = Some(ToyStep::B);

        engine.advance("7").await?;
        engine.advance("7").await?;
        for _ in 0..3 {
            let result = engine.advance("7").await?;
            assert!(!result.success);
            assert_eq!(result.step, "b");
            assert_eq!(result.next_step, None);
            assert!(result.message.contains("disk full at b"));
        }
        assert_eq!(engine.current_step("7").await?, ToyStep::B);
        assert!(engine.lock.current()?.is_none());
        assert_eq!(engine.process().0.cleaned.load(Ordering::SeqCst), 0);

        *engine.process().0.fail_at.lock().unwrap() = None;
        let result = engine.advance("7").await?;
        assert!(result.success);
        assert_eq!(result.next_step.as_deref(), Some("end"));
        assert!(engine.lock.current()?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_policy_discards_state() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, AbortingToy::default());
        *engine.process().0.fail_at.lock().unwrap() = Some(ToyStep::A);

        engine.advance("7").await?;
        assert!(engine.lock.is_maintenance_mode()?);

        let result = engine.advance("7").await?;
        assert!(!result.success);
        assert_eq!(result.step, "a");
        assert!(engine.state("7").await?.is_none());
        assert!(!engine.lock.is_maintenance_mode()?);
        assert_eq!(engine.process().0.cleaned.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reject_changes_nothing() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        engine.process().0.reject_start.store(true, Ordering::SeqCst);

        let result = engine.advance("7").await?;
        assert!(!result.success);
        assert_eq!(result.message, "not now");
        assert!(engine.state("7").await?.is_none());
        assert!(engine.lock.current()?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_busy_lock_rejects_start() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        let other = LockHolder {
            process_key: "other".to_string(),
            kind: ProcessKind::Update,
            actor: "9".to_string(),
        };
        engine.lock.acquire(LockName::MaintenanceMode, &other)?;

        let result = engine.advance("7").await?;
        assert!(!result.success);
        assert!(result.message.contains("maintenance mode"));
        assert!(engine.state("7").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_state_restarts() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        let mut stale = ProcessState::new("7", ProcessKind::Backup, "b", chrono::Duration::hours(1));
        stale.expires_at = Utc::now() - chrono::Duration::minutes(1);
        engine.store.save(&stale)?;

        assert_eq!(engine.current_step("7").await?, ToyStep::Start);
        let result = engine.advance("7").await?;
        assert_eq!(result.step, "start");
        assert_eq!(engine.process().0.cleaned.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_clears_lock_and_state() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        engine.advance("7").await?;
        assert!(engine.lock.current()?.is_some());

        assert!(engine.abort("7", "operator request").await?);
        assert!(engine.state("7").await?.is_none());
        assert!(engine.lock.current()?.is_none());
        assert!(!engine.abort("7", "again").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_refuses_running_process() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        let mut payload = Map::new();
        payload.insert("file".to_string(), Value::from("a.zip"));

        let seeded = engine.begin("7", payload.clone()).await?;
        assert_eq!(seeded.current_step, "start");
        engine.begin("7", payload.clone()).await?;

        engine.advance("7").await?;
        assert!(engine.begin("7", payload).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_expiry_is_fixed_at_creation() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        engine.advance("7").await?;
        let first = engine.state("7").await?.map(|s| s.expires_at);

        engine.advance("7").await?;
        let second = engine.state("7").await?.map(|s| s.expires_at);
        assert!(first.is_some());
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_records_finished_run() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        engine.advance("7").await?;
        let running = engine.history("7")?;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, RunStatus::Processing);
        assert_eq!(running[0].step, "a");

        for _ in 0..3 {
            engine.advance("7").await?;
        }
        let runs = engine.history("7")?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Finished);
        assert_eq!(runs[0].step, "end");
        assert_eq!(runs[0].result.as_deref(), Some("all done"));
        assert!(runs[0].finished_at.is_some());
        assert!(engine.history("8")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_history_records_failures() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let resuming = engine(&dir, ResumingToy::default());
        *resuming.process().0.fail_at.lock().unwrap() = Some(ToyStep::A);
        resuming.advance("7").await?;
        resuming.advance("7").await?;

        let runs = resuming.history("7")?;
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].step, "a");
        assert!(runs[0].errors[0].contains("disk full at a"));
        assert!(runs[0].finished_at.is_none());

        let aborting = engine(&dir, AbortingToy::default());
        *aborting.process().0.fail_at.lock().unwrap() = Some(ToyStep::A);
        resuming.abort("7", "operator request").await?;
        aborting.advance("7").await?;
        aborting.advance("7").await?;

        let runs = aborting.history("7")?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].finished_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_history_records_abort() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        engine.advance("7").await?;
        engine.abort("7", "operator request").await?;

        let runs = engine.history("7")?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Aborted);
        assert_eq!(runs[0].errors, vec!["operator request"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_start_leaves_no_history() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        *engine.process().0.fail_at.lock().unwrap() = Some(ToyStep::Start);
        engine.advance("7").await?;
        engine.process().0.reject_start.store(true, Ordering::SeqCst);
        *engine.process().0.fail_at.lock().unwrap() = None;
        engine.advance("7").await?;

        assert!(engine.history("7")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_independent_actors() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let engine = engine(&dir, ResumingToy::default());
        engine.advance("1").await?;

        let second = engine.advance("2").await?;
        assert!(!second.success);
        assert!(second.message.contains("backup is currently running"));
        assert_eq!(engine.current_step("1").await?, ToyStep::A);
        Ok(())
    }
}
