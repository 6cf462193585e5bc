//! Experiment scheduler: turns a [`StagePlan`] into paced rate commands.
//!
//! # Timing
//!
//! All decisions are a function of *elapsed run time*: wall-clock time
//! since start minus time spent paused. Ticks are aligned to multiples of
//! the tick interval in elapsed time and the target rate is recomputed
//! from elapsed time on every tick, so late or missed ticks never skew a
//! ramp. A paused run emits nothing; on resume it continues from exactly
//! the elapsed time at which it was paused.
//!
//! # Failures
//!
//! A failed rate write is retried up to `max_attempts` with doubling
//! backoff. Exhausting retries aborts the run and surfaces the error via
//! [`ExperimentScheduler::wait`]. Aborting never commands a safe rate;
//! send a `RunStop` button press if the pump must stop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::dispatcher::Dispatcher;
use crate::errors::{DispatchError, DriverError, Result};
use crate::experiment::{PlanPosition, StagePlan};
use crate::protocol::PumpRateCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub elapsed: Duration,
    pub total: Duration,
    pub stage_index: Option<usize>,
    pub last_emitted_rate: Option<u16>,
    /// Set when retries were exhausted.
    pub error: Option<DispatchError>,
}

/// Elapsed-time accounting that excludes paused spans.
#[derive(Debug, Clone, Copy)]
struct RunClock {
    started: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl RunClock {
    fn start(now: Instant) -> Self {
        Self {
            started: now,
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        let end = self.paused_at.unwrap_or(now);
        end.saturating_duration_since(self.started)
            .saturating_sub(self.paused_total)
    }

    fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(paused_at);
        }
    }
}

#[derive(Debug, Clone)]
struct RunState {
    status: RunStatus,
    clock: RunClock,
    stage_index: Option<usize>,
    last_emitted_rate: Option<u16>,
    error: Option<DispatchError>,
}

/// One run's plan plus its shared state. Control calls publish through the
/// watch channel, which also wakes the run loop.
struct ActiveRun {
    plan: StagePlan,
    state: watch::Sender<RunState>,
    /// Dropped on the first terminal transition.
    claim: Mutex<Option<RunClaim>>,
}

/// The dispatcher's one-run reservation, released on drop.
struct RunClaim {
    dispatcher: Arc<Dispatcher>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.dispatcher.release_run();
    }
}

pub struct ExperimentScheduler {
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    current: Mutex<Option<Arc<ActiveRun>>>,
}

impl ExperimentScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dispatcher,
            config,
            current: Mutex::new(None),
        })
    }

    /// Start a run. Must be called inside a tokio runtime.
    ///
    /// Fails with `RunInProgress` while another run, from this or any other
    /// scheduler on the same dispatcher, is running or paused.
    pub fn start(&self, plan: StagePlan) -> Result<()> {
        let mut current = lock(&self.current);
        if let Some(run) = current.as_ref() {
            if !run.status().is_terminal() {
                return Err(DriverError::RunInProgress);
            }
        }

        self.dispatcher.claim_run(plan.clone())?;
        let claim = RunClaim {
            dispatcher: Arc::clone(&self.dispatcher),
        };
        info!(
            "starting run: {} stages, {:?} total",
            plan.stages().len(),
            plan.total_duration()
        );

        let (state, _) = watch::channel(RunState {
            status: RunStatus::Running,
            clock: RunClock::start(Instant::now()),
            stage_index: None,
            last_emitted_rate: None,
            error: None,
        });
        let run = Arc::new(ActiveRun {
            plan,
            state,
            claim: Mutex::new(Some(claim)),
        });
        tokio::spawn(Arc::clone(&run).drive(Arc::clone(&self.dispatcher), self.config.clone()));
        *current = Some(run);
        Ok(())
    }

    /// Freeze elapsed time. No-op if already paused.
    pub fn pause(&self) -> Result<()> {
        self.control(|state, now| match state.status {
            RunStatus::Running => {
                state.clock.pause(now);
                state.status = RunStatus::Paused;
                info!("run paused at {:?}", state.clock.elapsed(now));
                Ok(true)
            }
            RunStatus::Paused => Ok(false),
            _ => Err(DriverError::NoActiveRun),
        })
    }

    /// Continue from the elapsed time at which the run was paused.
    pub fn resume(&self) -> Result<()> {
        self.control(|state, now| match state.status {
            RunStatus::Paused => {
                state.clock.resume(now);
                state.status = RunStatus::Running;
                info!("run resumed at {:?}", state.clock.elapsed(now));
                Ok(true)
            }
            RunStatus::Running => Ok(false),
            _ => Err(DriverError::NoActiveRun),
        })
    }

    /// Stop future emissions. A write already in flight is left to finish,
    /// and the last emitted rate stays in effect on the pump.
    pub fn abort(&self) -> Result<()> {
        let current = lock(&self.current);
        let run = current.as_ref().ok_or(DriverError::NoActiveRun)?;
        run.finish(RunStatus::Aborted, None);
        Ok(())
    }

    pub fn status(&self) -> Option<RunStatus> {
        lock(&self.current).as_ref().map(|run| run.status())
    }

    pub fn snapshot(&self) -> Option<RunSnapshot> {
        lock(&self.current).as_ref().map(|run| run.snapshot())
    }

    /// Wait for the current run to finish.
    ///
    /// Returns the terminal status, or the dispatch error that aborted it.
    pub async fn wait(&self) -> Result<RunStatus> {
        let mut changes = lock(&self.current)
            .as_ref()
            .map(|run| run.state.subscribe())
            .ok_or(DriverError::NoActiveRun)?;
        let (status, error) = {
            let state = changes
                .wait_for(|s| s.status.is_terminal())
                .await
                .map_err(|_| DriverError::NoActiveRun)?;
            (state.status, state.error.clone())
        };
        match error {
            Some(e) => Err(DriverError::Dispatch(e)),
            None => Ok(status),
        }
    }

    fn control(
        &self,
        f: impl FnOnce(&mut RunState, Instant) -> Result<bool>,
    ) -> Result<()> {
        let current = lock(&self.current);
        let run = current.as_ref().ok_or(DriverError::NoActiveRun)?;
        let now = Instant::now();
        let mut outcome = Ok(());
        run.state.send_if_modified(|state| match f(state, now) {
            Ok(changed) => changed,
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }
}

impl Drop for ExperimentScheduler {
    fn drop(&mut self) {
        let _ = self.abort();
    }
}

impl ActiveRun {
    fn status(&self) -> RunStatus {
        self.state.borrow().status
    }

    fn snapshot(&self) -> RunSnapshot {
        let state = self.state.borrow();
        RunSnapshot {
            status: state.status,
            elapsed: state.clock.elapsed(Instant::now()),
            total: self.plan.total_duration(),
            stage_index: state.stage_index,
            last_emitted_rate: state.last_emitted_rate,
            error: state.error.clone(),
        }
    }

    fn observe(&self) -> (RunStatus, Duration) {
        let state = self.state.borrow();
        (state.status, state.clock.elapsed(Instant::now()))
    }

    /// Move to a terminal status unless already terminal, freeing the
    /// dispatcher before any waiter observes the new status.
    fn finish(&self, status: RunStatus, error: Option<DispatchError>) {
        let now = Instant::now();
        self.state.send_if_modified(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.clock.pause(now);
            state.status = status;
            state.error = error;
            info!("run {:?} at {:?}", status, state.clock.elapsed(now));
            lock(&self.claim).take();
            true
        });
    }

    /// Hold while paused. Returns the status that ended the wait.
    async fn wait_unpaused(&self) -> RunStatus {
        let mut changes = self.state.subscribe();
        changes
            .wait_for(|s| s.status != RunStatus::Paused)
            .await
            .map(|s| s.status)
            .unwrap_or(RunStatus::Aborted)
    }

    async fn drive(self: Arc<Self>, dispatcher: Arc<Dispatcher>, config: SchedulerConfig) {
        let mut changes = self.state.subscribe();
        let mut ticker = Ticker::new(&self.plan, &config);

        loop {
            let (status, elapsed) = self.observe();
            match status {
                RunStatus::Completed | RunStatus::Aborted => return,
                RunStatus::Paused => {
                    if changes.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                RunStatus::Running => {}
            }

            if ticker.due(elapsed) {
                match ticker.tick(&self, &dispatcher, elapsed).await {
                    Ok(true) => {
                        self.finish(RunStatus::Completed, None);
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!("run aborted: rate command failed: {}", e);
                        self.finish(RunStatus::Aborted, Some(e));
                        return;
                    }
                }
            }

            let (_, elapsed) = self.observe();
            let wait = ticker.until_next(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Send one rate with bounded retry. Nothing goes out while paused, and
    /// nothing at all once aborted.
    async fn emit(
        &self,
        dispatcher: &Dispatcher,
        config: &SchedulerConfig,
        rate: u16,
    ) -> std::result::Result<bool, DispatchError> {
        let cmd = PumpRateCommand::new(rate).map_err(|e| DispatchError::Rejected(e.to_string()))?;
        let mut attempt = 1;
        loop {
            if self.wait_unpaused().await.is_terminal() {
                return Ok(false);
            }
            match dispatcher.send_rate(cmd).await {
                Ok(()) => {
                    debug!("run emitted {} µL/min", rate);
                    self.state.send_if_modified(|state| {
                        state.last_emitted_rate = Some(rate);
                        false
                    });
                    return Ok(true);
                }
                Err(e) if attempt < config.max_attempts => {
                    let delay = config.backoff(attempt);
                    warn!(
                        "rate {} failed (attempt {}/{}): {}; retrying in {:?}",
                        rate, attempt, config.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn last_emitted_rate(&self) -> Option<u16> {
        self.state.borrow().last_emitted_rate
    }

    fn set_stage(&self, stage_index: usize) {
        self.state.send_if_modified(|state| {
            if state.stage_index != Some(stage_index) {
                info!("run entered stage {}", stage_index);
                state.stage_index = Some(stage_index);
            }
            false
        });
    }
}

/// Tick bookkeeping for one run, all in elapsed time.
struct Ticker {
    tick: Duration,
    refresh: Duration,
    total: Duration,
    config: SchedulerConfig,
    next_tick: Duration,
    last_sent_at: Option<Duration>,
    last_stage: Option<usize>,
}

impl Ticker {
    fn new(plan: &StagePlan, config: &SchedulerConfig) -> Self {
        Self {
            tick: config.tick_interval,
            refresh: config.refresh_interval,
            total: plan.total_duration(),
            config: config.clone(),
            next_tick: Duration::ZERO,
            last_sent_at: None,
            last_stage: None,
        }
    }

    fn due(&self, elapsed: Duration) -> bool {
        elapsed >= self.next_tick || elapsed >= self.total
    }

    fn until_next(&self, elapsed: Duration) -> Duration {
        self.next_tick.min(self.total).saturating_sub(elapsed)
    }

    /// Returns `Ok(true)` once the final command has been sent.
    async fn tick(
        &mut self,
        run: &ActiveRun,
        dispatcher: &Dispatcher,
        elapsed: Duration,
    ) -> std::result::Result<bool, DispatchError> {
        // Next boundary strictly after `elapsed`; missed ticks are skipped.
        let ticks = elapsed.as_nanos() / self.tick.as_nanos();
        self.next_tick = duration_from_nanos((ticks + 1) * self.tick.as_nanos());

        match run.plan.position(elapsed) {
            PlanPosition::Finished { final_rate } => {
                let last = run.plan.stages().len() - 1;
                self.close_stages(run, dispatcher, last, elapsed).await?;
                run.emit(dispatcher, &self.config, final_rate).await?;
                Ok(true)
            }
            PlanPosition::Active {
                stage_index, rate, ..
            } => {
                self.close_stages(run, dispatcher, stage_index, elapsed)
                    .await?;
                run.set_stage(stage_index);

                let stale = self
                    .last_sent_at
                    .map_or(true, |at| elapsed.saturating_sub(at) >= self.refresh);
                if run.last_emitted_rate() != Some(rate) || stale {
                    if run.emit(dispatcher, &self.config, rate).await? {
                        self.last_sent_at = Some(elapsed);
                    }
                }
                self.last_stage = Some(stage_index);
                Ok(false)
            }
        }
    }

    /// When a tick lands past one or more stage boundaries, pin the
    /// terminal rate of every stage that ended, in order, before `upto`.
    /// Stages shorter than a tick still get their transition on the wire.
    async fn close_stages(
        &mut self,
        run: &ActiveRun,
        dispatcher: &Dispatcher,
        upto: usize,
        elapsed: Duration,
    ) -> std::result::Result<(), DispatchError> {
        let Some(previous) = self.last_stage else {
            return Ok(());
        };
        for ended in previous..upto {
            let end_rate = run.plan.stages()[ended].end_rate();
            if run.last_emitted_rate() != Some(end_rate)
                && run.emit(dispatcher, &self.config, end_rate).await?
            {
                self.last_sent_at = Some(elapsed);
            }
            self.last_stage = Some(ended + 1);
        }
        Ok(())
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
