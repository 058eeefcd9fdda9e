//! Proxy session state machine
//!
//! One manager owns one session: the current state, the current pass, the
//! isolation key minted on activation, the last usage snapshot, and the
//! scheduled rotation or resume. Observers read state through accessors and
//! follow changes on a broadcast channel.
//!
//! Locking: the session mutex guards all session fields and is never held
//! across a credential fetch, a cache write or a timer wait. A second mutex
//! serializes the operations that fetch (activation, rotation, usage
//! refresh) so their results apply in call order. `stop` and `reset` take
//! only the session mutex and therefore act immediately, even mid-fetch; a
//! fetch that resolves afterwards re-checks what it finds under the session
//! mutex before applying anything. Usage reaches the cache after the session
//! mutex is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guardian::{
    CredentialService, FetchOptions, FetchReason, PassResponse, ProxyPass, ProxyUsage, UsageCache,
};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, Timer, TokioTimer};
use crate::error::{Error, Result};
use crate::events::{ManagerEvent, ProxyState};
use crate::scheduler::ScheduledTask;
use crate::status::{PassStatus, classify_pass_status};
use crate::telemetry;

/// Capacity of the event channel. Slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 64;

/// Tuning for rotation timing and fetches.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long before pass expiry or quota reset to rotate
    pub rotation_margin: Duration,
    /// Floor on how soon a rotation may be scheduled, so a pass shorter
    /// than the margin cannot cause back-to-back fetches
    pub min_rotation_delay: Duration,
    /// Per-request timeout handed to the credential service
    pub fetch_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            rotation_margin: Duration::from_secs(60),
            min_rotation_delay: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout.is_zero() {
            return Err(Error::InvalidConfig("fetch_timeout must be > 0".into()));
        }
        if chrono::Duration::from_std(self.rotation_margin).is_err() {
            return Err(Error::InvalidConfig("rotation_margin is out of range".into()));
        }
        if chrono::Duration::from_std(self.min_rotation_delay).is_err() {
            return Err(Error::InvalidConfig(
                "min_rotation_delay is out of range".into(),
            ));
        }
        Ok(())
    }
}

/// Mutable session fields. Only touched under `Inner::session`.
#[derive(Default)]
struct Session {
    state: ProxyState,
    pass: Option<ProxyPass>,
    usage: Option<ProxyUsage>,
    isolation_key: Option<Uuid>,
    activated_at: Option<DateTime<Utc>>,
    /// Abort flag of the activation in flight
    activation: Option<CancellationToken>,
    /// Bumped by `reset`. A fetch started under an older generation is
    /// discarded when it resolves.
    generation: u64,
    /// Pending rotation (Active) or resume attempt (Paused)
    scheduled: Option<ScheduledTask>,
}

impl Session {
    fn cancel_scheduled(&mut self) {
        if let Some(task) = self.scheduled.take() {
            debug!(target_time = %task.target_time(), "cancelled scheduled rotation");
            task.abort();
        }
    }

    fn clear_connection(&mut self) {
        self.pass = None;
        self.isolation_key = None;
        self.activated_at = None;
    }
}

struct Inner {
    session: Mutex<Session>,
    operation: Mutex<()>,
    /// Orders cache writes against the cache clear in `reset`
    persist: Mutex<()>,
    state_tx: watch::Sender<ProxyState>,
    events: broadcast::Sender<ManagerEvent>,
    credentials: Arc<dyn CredentialService>,
    cache: Arc<dyn UsageCache>,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    config: ManagerConfig,
}

/// Cloneable handle to a proxy session. Clones share one session.
#[derive(Clone)]
pub struct ProxySessionManager {
    inner: Arc<Inner>,
}

/// Builds a `ProxySessionManager`. Clock and timer default to the system
/// clock and the tokio timer.
pub struct ManagerBuilder {
    credentials: Arc<dyn CredentialService>,
    cache: Arc<dyn UsageCache>,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Validate the config and load the last cached usage snapshot.
    pub async fn build(self) -> Result<ProxySessionManager> {
        self.config.validate()?;

        let usage = self.cache.load_usage_info().await;
        if let Some(usage) = &usage {
            telemetry::record_usage(usage);
        }
        telemetry::record_state(ProxyState::NotReady);

        let (state_tx, _) = watch::channel(ProxyState::NotReady);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            cached_usage = usage.is_some(),
            rotation_margin_secs = self.config.rotation_margin.as_secs(),
            "proxy session manager initialized"
        );

        Ok(ProxySessionManager {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    usage,
                    ..Session::default()
                }),
                operation: Mutex::new(()),
                persist: Mutex::new(()),
                state_tx,
                events,
                credentials: self.credentials,
                cache: self.cache,
                clock: self.clock,
                timer: self.timer,
                config: self.config,
            }),
        })
    }
}

impl ProxySessionManager {
    pub fn builder(
        credentials: Arc<dyn CredentialService>,
        cache: Arc<dyn UsageCache>,
    ) -> ManagerBuilder {
        ManagerBuilder {
            credentials,
            cache,
            config: ManagerConfig::default(),
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimer),
        }
    }

    /// Activate the session.
    ///
    /// Returns the state the activation settled in. A call made while
    /// another activation is in flight waits for that one and returns its
    /// outcome without fetching again; a call while Active returns at once.
    pub async fn start(&self) -> ProxyState {
        self.inner.start().await
    }

    /// Deactivate the session.
    ///
    /// Active → Ready and Paused → NotReady, cancelling any scheduled
    /// rotation. During an activation this only raises the abort flag: the
    /// in-flight start settles NotReady (or Paused, if the quota turns out to
    /// be spent) and never reaches Active. Elsewhere a no-op.
    pub async fn stop(&self) -> ProxyState {
        self.inner.stop().await
    }

    /// Fetch a fresh pass for the current session.
    ///
    /// Only acts while Active or Paused; otherwise returns `None` without a
    /// fetch. From Paused a valid pass resumes the session with a new
    /// isolation key. An issued pass that is not valid now moves the session
    /// to Error and is still returned.
    pub async fn rotate_proxy_pass(&self) -> Option<ProxyPass> {
        self.inner.rotate_proxy_pass().await
    }

    /// Re-check usage without touching the pass.
    ///
    /// Active with zero remaining → Paused. Paused or NotReady with quota
    /// available → Ready (never straight to Active). A failed fetch leaves
    /// state unchanged.
    pub async fn refresh_usage(&self) -> ProxyState {
        self.inner.refresh_usage().await
    }

    /// Return to NotReady, dropping the pass and any in-flight activation.
    /// With `clear_usage`, also forget the usage snapshot in memory and in
    /// the cache.
    pub async fn reset(&self, clear_usage: bool) {
        self.inner.reset(clear_usage).await
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<ProxyState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn usage_info(&self) -> Option<ProxyUsage> {
        self.inner.session.lock().await.usage.clone()
    }

    pub async fn active_proxy_pass(&self) -> Option<ProxyPass> {
        self.inner.session.lock().await.pass.clone()
    }

    pub async fn isolation_key(&self) -> Option<Uuid> {
        self.inner.session.lock().await.isolation_key
    }

    pub async fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.session.lock().await.activated_at
    }

    pub async fn has_valid_proxy_pass(&self) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .session
            .lock()
            .await
            .pass
            .as_ref()
            .is_some_and(|pass| pass.is_valid(now))
    }

    /// When the pending rotation or resume attempt will run, if any.
    pub async fn next_rotation_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .session
            .lock()
            .await
            .scheduled
            .as_ref()
            .map(ScheduledTask::target_time)
    }

    /// Session summary for the health endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let now = self.inner.clock.now();
        let session = self.inner.session.lock().await;

        let usage = session.usage.as_ref().map(|usage| {
            serde_json::json!({
                "max_bytes": usage.max,
                "remaining_bytes": usage.remaining,
                "used_bytes": usage.used_bytes(),
                "reset_at": usage.reset_at.to_rfc3339(),
                "exhausted": usage.exhausted(),
            })
        });

        serde_json::json!({
            "state": session.state.label(),
            "has_valid_proxy_pass": session.pass.as_ref().is_some_and(|p| p.is_valid(now)),
            "pass_expires_at": session.pass.as_ref().map(|p| p.not_after().to_rfc3339()),
            "activated_at": session.activated_at.map(|t| t.to_rfc3339()),
            "next_rotation_at": session.scheduled.as_ref().map(|t| t.target_time().to_rfc3339()),
            "usage": usage,
        })
    }
}

impl Inner {
    fn fetch_options(&self, reason: FetchReason) -> FetchOptions {
        FetchOptions::new(reason, self.config.fetch_timeout)
    }

    async fn fetch_pass(&self, reason: FetchReason) -> Result<PassResponse> {
        let response = self
            .credentials
            .fetch_proxy_pass(&self.fetch_options(reason))
            .await;
        match &response {
            Ok(r) => {
                telemetry::record_fetch(reason.label(), classify_pass_status(r.status).label())
            }
            Err(_) => telemetry::record_fetch(reason.label(), "transport_error"),
        }
        Ok(response?)
    }

    async fn fetch_usage(&self) -> Result<ProxyUsage> {
        let reason = FetchReason::UsageCheck;
        let usage = self
            .credentials
            .fetch_proxy_usage(&self.fetch_options(reason))
            .await;
        let outcome = if usage.is_ok() { "issued" } else { "transport_error" };
        telemetry::record_fetch(reason.label(), outcome);
        Ok(usage?)
    }

    fn set_state(&self, session: &mut Session, next: ProxyState) {
        let previous = session.state;
        if previous == next {
            return;
        }
        session.state = next;
        self.state_tx.send_replace(next);
        telemetry::record_state(next);
        info!(from = previous.label(), to = next.label(), "proxy state changed");
        let _ = self.events.send(ManagerEvent::StateChanged {
            state: next,
            previous,
        });
    }

    /// Keep and announce a usage snapshot. The cache write happens later,
    /// in `persist_usage`, once the session lock is released.
    fn record_usage(&self, session: &mut Session, usage: ProxyUsage) {
        telemetry::record_usage(&usage);
        debug!(
            remaining = usage.remaining,
            max = usage.max,
            reset_at = %usage.reset_at,
            "usage updated"
        );
        session.usage = Some(usage.clone());
        let _ = self.events.send(ManagerEvent::UsageChanged { usage });
    }

    /// Write a recorded snapshot to the cache, unless a reset happened since
    /// the fetch that produced it. Must be called without the session lock.
    async fn persist_usage(&self, usage: Option<ProxyUsage>, generation: u64) {
        let Some(usage) = usage else {
            return;
        };
        let _persist = self.persist.lock().await;
        let current = self.session.lock().await.generation;
        if current != generation {
            debug!("usage snapshot superseded by reset, not persisted");
            return;
        }
        if let Err(e) = self.cache.store_usage_info(&usage).await {
            warn!(error = %e, "failed to persist usage snapshot");
        }
    }

    /// Schedule `rotate_proxy_pass` at `target`, replacing any pending one.
    fn schedule_rotation(self: &Arc<Self>, session: &mut Session, target: DateTime<Utc>) {
        session.cancel_scheduled();

        let weak = Arc::downgrade(self);
        let task = ScheduledTask::spawn(
            target,
            self.clock.clone(),
            self.timer.clone(),
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.rotate_proxy_pass().await;
                }
            },
        );
        debug!(target_time = %target, "rotation scheduled");
        session.scheduled = Some(task);
    }

    fn rotation_floor(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.min_rotation_delay)
            .unwrap_or(chrono::Duration::zero())
    }

    /// `min(pass expiry, next quota reset) - margin`, no sooner than
    /// `min_rotation_delay` from now.
    fn rotation_target(
        &self,
        pass: &ProxyPass,
        usage: Option<&ProxyUsage>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let deadline = usage
            .map(|u| u.reset_at)
            .filter(|reset_at| *reset_at > now)
            .map_or(pass.not_after(), |reset_at| reset_at.min(pass.not_after()));

        let margin = chrono::Duration::from_std(self.config.rotation_margin)
            .unwrap_or(chrono::Duration::zero());
        (deadline - margin).max(now + self.rotation_floor())
    }

    /// Install `pass` as the live credential and schedule its rotation.
    fn install_pass(self: &Arc<Self>, session: &mut Session, pass: ProxyPass, now: DateTime<Utc>) {
        let target = self.rotation_target(&pass, session.usage.as_ref(), now);
        info!(
            pass = %pass.fingerprint(),
            expires_at = %pass.not_after(),
            rotate_at = %target,
            "proxy pass installed"
        );
        session.pass = Some(pass);
        self.schedule_rotation(session, target);
    }

    /// Enter Paused: drop the pass and schedule a resume attempt.
    fn pause(self: &Arc<Self>, session: &mut Session) {
        session.clear_connection();
        info!("quota exhausted, pausing proxy session");
        self.schedule_resume(session);
        self.set_state(session, ProxyState::Paused);
    }

    /// Arm the resume attempt at the quota reset of the last known usage,
    /// no sooner than `min_rotation_delay` from now. A reset time the
    /// service reports as already past would otherwise fire immediately.
    /// Without any usage snapshot there is no reset time; the periodic
    /// usage refresh moves the session on instead.
    fn schedule_resume(self: &Arc<Self>, session: &mut Session) {
        match session.usage.as_ref().map(|u| u.reset_at) {
            Some(reset_at) => {
                let target = reset_at.max(self.clock.now() + self.rotation_floor());
                info!(resume_at = %target, "resume attempt scheduled");
                self.schedule_rotation(session, target);
            }
            None => {
                session.cancel_scheduled();
                info!("no quota reset known, waiting for a usage refresh");
            }
        }
    }

    async fn start(self: &Arc<Self>) -> ProxyState {
        let (abort, generation) = {
            let mut session = self.session.lock().await;
            let state = session.state;
            match state {
                ProxyState::Active => return ProxyState::Active,
                ProxyState::Activating => {
                    drop(session);
                    debug!("activation already in flight, waiting for it");
                    return self.wait_for_activation().await;
                }
                _ => {}
            }
            let abort = CancellationToken::new();
            session.activation = Some(abort.clone());
            session.cancel_scheduled();
            self.set_state(&mut session, ProxyState::Activating);
            (abort, session.generation)
        };

        let _op = self.operation.lock().await;
        let result = self.fetch_pass(FetchReason::Activation).await;
        self.settle_activation(result, &abort, generation).await
    }

    async fn wait_for_activation(&self) -> ProxyState {
        let mut rx = self.state_tx.subscribe();
        let settled = rx
            .wait_for(|state| *state != ProxyState::Activating)
            .await
            .map(|state| *state);
        match settled {
            Ok(state) => state,
            Err(_) => *self.state_tx.borrow(),
        }
    }

    async fn settle_activation(
        self: &Arc<Self>,
        result: Result<PassResponse>,
        abort: &CancellationToken,
        generation: u64,
    ) -> ProxyState {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            debug!("activation resolved after reset, discarding");
            return session.state;
        }
        session.activation = None;
        let aborted = abort.is_cancelled();

        let response = match result {
            Ok(response) => response,
            Err(e) if aborted => {
                debug!(error = %e, "abandoned activation failed");
                self.set_state(&mut session, ProxyState::NotReady);
                return session.state;
            }
            Err(e) => {
                warn!(error = %e, "activation failed");
                self.set_state(&mut session, ProxyState::Error);
                return session.state;
            }
        };

        let usage = response.usage.clone();
        let state = self.apply_activation(&mut session, response, aborted);
        drop(session);
        self.persist_usage(usage, generation).await;
        state
    }

    fn apply_activation(
        self: &Arc<Self>,
        session: &mut Session,
        response: PassResponse,
        aborted: bool,
    ) -> ProxyState {
        if let Some(usage) = response.usage.clone() {
            self.record_usage(session, usage);
        }

        if quota_exceeded(&response) {
            self.pause(session);
            return session.state;
        }

        if aborted {
            info!("activation abandoned by stop");
            self.set_state(session, ProxyState::NotReady);
            return session.state;
        }

        let now = self.clock.now();
        let status = classify_pass_status(response.status);
        match response.pass {
            Some(pass) if status == PassStatus::Issued && pass.is_valid(now) => {
                let key = Uuid::new_v4();
                session.isolation_key = Some(key);
                session.activated_at = Some(now);
                self.install_pass(session, pass, now);
                info!(isolation_key = %key, "proxy session active");
                self.set_state(session, ProxyState::Active);
            }
            pass => {
                warn!(
                    status = response.status,
                    outcome = status.label(),
                    error = response.error.as_deref().unwrap_or(""),
                    pass_present = pass.is_some(),
                    "proxy pass issuance failed"
                );
                self.set_state(session, ProxyState::Error);
            }
        }
        session.state
    }

    async fn stop(&self) -> ProxyState {
        let mut session = self.session.lock().await;
        match session.state {
            ProxyState::Activating => {
                if let Some(abort) = session.activation.as_ref().filter(|t| !t.is_cancelled()) {
                    info!("stop requested during activation, abandoning it");
                    abort.cancel();
                }
            }
            ProxyState::Active => {
                session.cancel_scheduled();
                session.clear_connection();
                self.set_state(&mut session, ProxyState::Ready);
            }
            ProxyState::Paused => {
                session.cancel_scheduled();
                self.set_state(&mut session, ProxyState::NotReady);
            }
            state => debug!(state = state.label(), "stop: nothing to do"),
        }
        session.state
    }

    async fn rotate_proxy_pass(self: &Arc<Self>) -> Option<ProxyPass> {
        let _op = self.operation.lock().await;
        let (prior, generation) = {
            let session = self.session.lock().await;
            match session.state {
                ProxyState::Active | ProxyState::Paused => (session.state, session.generation),
                state => {
                    debug!(state = state.label(), "rotation skipped");
                    return None;
                }
            }
        };

        let result = self.fetch_pass(FetchReason::Rotation).await;

        let mut session = self.session.lock().await;
        if session.generation != generation {
            debug!("rotation resolved after reset, discarding");
            return None;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if session.state == prior {
                    warn!(error = %e, "rotation failed");
                    session.cancel_scheduled();
                    session.clear_connection();
                    self.set_state(&mut session, ProxyState::Error);
                }
                return None;
            }
        };

        let usage = response.usage.clone();
        let pass = self.apply_rotation(&mut session, prior, response);
        drop(session);
        self.persist_usage(usage, generation).await;
        pass
    }

    fn apply_rotation(
        self: &Arc<Self>,
        session: &mut Session,
        prior: ProxyState,
        response: PassResponse,
    ) -> Option<ProxyPass> {
        if let Some(usage) = response.usage.clone() {
            self.record_usage(session, usage);
        }

        if session.state != prior {
            debug!(
                from = prior.label(),
                to = session.state.label(),
                "state changed during rotation, pass not installed"
            );
            return response.pass;
        }

        if quota_exceeded(&response) {
            self.pause(session);
            return response.pass;
        }

        let now = self.clock.now();
        let status = classify_pass_status(response.status);
        match response.pass {
            Some(pass) if status == PassStatus::Issued && pass.is_valid(now) => {
                self.install_pass(session, pass.clone(), now);
                if prior == ProxyState::Paused {
                    let key = Uuid::new_v4();
                    session.isolation_key = Some(key);
                    session.activated_at = Some(now);
                    info!(isolation_key = %key, "proxy session resumed");
                    self.set_state(session, ProxyState::Active);
                }
                Some(pass)
            }
            Some(pass) => {
                warn!(
                    pass = %pass.fingerprint(),
                    not_before = %pass.not_before(),
                    not_after = %pass.not_after(),
                    "rotated pass is not valid now"
                );
                session.cancel_scheduled();
                session.clear_connection();
                self.set_state(session, ProxyState::Error);
                Some(pass)
            }
            None => {
                warn!(
                    status = response.status,
                    outcome = status.label(),
                    error = response.error.as_deref().unwrap_or(""),
                    "rotation issuance failed"
                );
                session.cancel_scheduled();
                session.clear_connection();
                self.set_state(session, ProxyState::Error);
                None
            }
        }
    }

    async fn refresh_usage(self: &Arc<Self>) -> ProxyState {
        let _op = self.operation.lock().await;
        let generation = self.session.lock().await.generation;

        let result = self.fetch_usage().await;

        let mut session = self.session.lock().await;
        if session.generation != generation {
            debug!("usage refresh resolved after reset, discarding");
            return session.state;
        }

        let usage = match result {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "usage refresh failed, state unchanged");
                return session.state;
            }
        };
        let exhausted = usage.exhausted();
        self.record_usage(&mut session, usage.clone());

        match (session.state, exhausted) {
            (ProxyState::Active, true) => self.pause(&mut session),
            (ProxyState::Paused, true) => self.schedule_resume(&mut session),
            (ProxyState::Paused | ProxyState::NotReady, false) => {
                session.cancel_scheduled();
                self.set_state(&mut session, ProxyState::Ready);
            }
            _ => {}
        }
        let state = session.state;
        drop(session);
        self.persist_usage(Some(usage), generation).await;
        state
    }

    async fn reset(&self, clear_usage: bool) {
        {
            let mut session = self.session.lock().await;
            session.generation += 1;
            if let Some(abort) = session.activation.take() {
                abort.cancel();
            }
            session.cancel_scheduled();
            session.clear_connection();
            if clear_usage {
                session.usage = None;
            }
            info!(clear_usage, "proxy session reset");
            self.set_state(&mut session, ProxyState::NotReady);
        }

        if clear_usage {
            let _persist = self.persist.lock().await;
            if let Err(e) = self.cache.clear().await {
                warn!(error = %e, "failed to clear usage cache");
            }
        }
    }
}

/// A 429 or a zero-remaining snapshot both mean the quota is spent.
fn quota_exceeded(response: &PassResponse) -> bool {
    classify_pass_status(response.status) == PassStatus::QuotaExceeded
        || response.usage.as_ref().is_some_and(ProxyUsage::exhausted)
}
