//! The lifecycle supervisor.
//!
//! `ensure_running()` is level-triggered and idempotent: whatever the
//! current state, it either observes `Ready` or drives exactly one start
//! attempt that every concurrent caller shares.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sandgate_core::BackendConfig;
use sandgate_sync::SyncEngine;

use crate::error::LifecycleError;
use crate::probe::{HealthTracker, HttpProbe, ProbeResult, ReadinessProbe};
use crate::process::{CommandLauncher, ComputeProcess, Launcher};

/// Lifecycle state of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeState {
    Absent,
    Starting,
    Ready,
    Crashed,
}

/// Timing knobs for starting and watching the backend.
#[derive(Debug, Clone)]
pub struct StartPolicy {
    pub start_timeout: Duration,
    pub probe_initial: Duration,
    pub probe_max: Duration,
    pub max_probe_attempts: u32,
    pub health_interval: Duration,
    pub unhealthy_threshold: u32,
}

impl StartPolicy {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            start_timeout: config.start_timeout,
            probe_initial: config.probe_initial,
            probe_max: config.probe_max,
            max_probe_attempts: config.max_probe_attempts,
            health_interval: config.health_interval,
            unhealthy_threshold: config.unhealthy_threshold,
        }
    }
}

type Outcome = Option<Result<(), LifecycleError>>;

struct Inner {
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    sync: Option<Arc<SyncEngine>>,
    policy: StartPolicy,
    state: watch::Sender<ComputeState>,
    /// Present while a start attempt is in flight.
    attempt: Mutex<Option<watch::Receiver<Outcome>>>,
    process: tokio::sync::Mutex<Option<Box<dyn ComputeProcess>>>,
}

/// Owns the backend process. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
        sync: Option<Arc<SyncEngine>>,
        policy: StartPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ComputeState::Absent);
        Self {
            inner: Arc::new(Inner {
                launcher,
                probe,
                sync,
                policy,
                state,
                attempt: Mutex::new(None),
                process: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Supervisor for the configured command, probing its readiness path.
    pub fn from_config(config: &BackendConfig, sync: Option<Arc<SyncEngine>>) -> Self {
        let probe = HttpProbe::new(
            config.address(),
            config.readiness_path.clone(),
            config.probe_timeout,
        );
        Self::new(
            Arc::new(CommandLauncher::from_config(config)),
            Arc::new(probe),
            sync,
            StartPolicy::from_config(config),
        )
    }

    pub fn state(&self) -> ComputeState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ComputeState> {
        self.inner.state.subscribe()
    }

    /// Make sure the backend is `Ready`, starting it if needed.
    ///
    /// Concurrent callers share one start attempt and observe the same
    /// result. Dropping the returned future does not cancel the attempt.
    pub async fn ensure_running(&self) -> Result<(), LifecycleError> {
        if self.state() == ComputeState::Ready && self.inner.check_alive().await {
            return Ok(());
        }

        let mut outcome = {
            let mut attempt = self.inner.attempt.lock().expect("attempt lock");
            match attempt.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    if self.state() == ComputeState::Ready {
                        return Ok(());
                    }
                    let (tx, rx) = watch::channel(None);
                    *attempt = Some(rx.clone());
                    self.inner.set_state(ComputeState::Starting);

                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        let result = inner.start().await;
                        inner.finish(&result).await;
                        inner.attempt.lock().expect("attempt lock").take();
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|r| r.clone())
            .map_err(|_| LifecycleError::StartFailed("start attempt aborted".into()))?;
        result.unwrap_or_else(|| Err(LifecycleError::StartFailed("start attempt aborted".into())))
    }

    /// Probe liveness while `Ready` until `shutdown` fires.
    ///
    /// After `unhealthy_threshold` consecutive failures, or when the
    /// process has exited, the backend is terminated and the state drops
    /// to `Absent`; the next request starts a fresh one.
    pub async fn run_watchdog(&self, mut shutdown: watch::Receiver<bool>) {
        let policy = &self.inner.policy;
        let mut tracker = HealthTracker::new(policy.unhealthy_threshold, policy.health_interval);
        info!(
            interval_secs = policy.health_interval.as_secs(),
            threshold = policy.unhealthy_threshold,
            "watchdog started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tracker.next_interval()) => {
                    self.watch_once(&mut tracker).await;
                }
                _ = shutdown.changed() => {
                    info!("watchdog shutting down");
                    break;
                }
            }
        }
    }

    async fn watch_once(&self, tracker: &mut HealthTracker) {
        if self.state() != ComputeState::Ready {
            tracker.reset();
            return;
        }
        if !self.inner.check_alive().await {
            tracker.reset();
            return;
        }

        tracker.record(self.inner.probe.probe().await);
        if tracker.needs_replacement() {
            warn!(
                failures = tracker.consecutive_failures(),
                "backend unresponsive, discarding it"
            );
            self.inner.stop_process().await;
            self.inner.set_state(ComputeState::Absent);
            tracker.reset();
        }
    }

    /// Terminate the backend and move to `Absent`.
    pub async fn shutdown(&self) {
        self.inner.stop_process().await;
        self.inner.set_state(ComputeState::Absent);
        info!("backend stopped");
    }
}

impl Inner {
    fn set_state(&self, next: ComputeState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = ?prev, to = ?next, "compute state changed");
        }
    }

    /// One start attempt: restore, launch, wait for readiness.
    async fn start(&self) -> Result<(), LifecycleError> {
        let started = Instant::now();

        // Affected entries stay unreconciled and are not backed up.
        if let Some(sync) = &self.sync {
            match tokio::time::timeout(self.policy.start_timeout, sync.restore()).await {
                Ok(report) if report.is_clean() => {}
                Ok(report) => warn!(
                    failed = report.failures.len(),
                    "restore incomplete, starting on local state"
                ),
                Err(_) => warn!(
                    timeout_secs = self.policy.start_timeout.as_secs(),
                    "restore timed out, starting on local state"
                ),
            }
        }

        self.stop_process().await;

        let process = self.launcher.launch().await.map_err(|e| {
            error!(error = %e, "failed to launch backend");
            LifecycleError::StartFailed(e.to_string())
        })?;
        *self.process.lock().await = Some(process);

        self.wait_ready().await?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "backend ready");
        Ok(())
    }

    async fn wait_ready(&self) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + self.policy.start_timeout;
        let mut delay = self.policy.probe_initial;

        for attempt in 1..=self.policy.max_probe_attempts {
            if let Some(status) = self.exit_status().await {
                error!(%status, "backend exited during startup");
                return Err(LifecycleError::ProcessCrashed(status));
            }

            match self.probe.probe().await {
                ProbeResult::Healthy => return Ok(()),
                result => debug!(attempt, ?result, "backend not ready yet"),
            }

            let now = Instant::now();
            if now >= deadline || attempt == self.policy.max_probe_attempts {
                break;
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.policy.probe_max);
        }

        warn!(
            timeout_secs = self.policy.start_timeout.as_secs(),
            attempts = self.policy.max_probe_attempts,
            "backend did not become ready"
        );
        Err(LifecycleError::StartTimeout)
    }

    async fn finish(&self, result: &Result<(), LifecycleError>) {
        match result {
            Ok(()) => self.set_state(ComputeState::Ready),
            Err(e) => {
                error!(error = %e, "start attempt failed");
                self.stop_process().await;
                self.set_state(ComputeState::Crashed);
                self.set_state(ComputeState::Absent);
            }
        }
    }

    /// `false` if the bound process has exited.
    ///
    /// Only a `Ready` backend is demoted to `Absent`; a concurrent start
    /// attempt owns the state otherwise.
    async fn check_alive(&self) -> bool {
        {
            let mut guard = self.process.lock().await;
            let status = match guard.as_mut() {
                Some(process) => match process.try_exited() {
                    None => return true,
                    Some(status) => status,
                },
                None => "no process".to_string(),
            };
            warn!(%status, "backend exited");
            guard.take();
        }

        let demoted = self.state.send_if_modified(|state| {
            let ready = *state == ComputeState::Ready;
            if ready {
                *state = ComputeState::Absent;
            }
            ready
        });
        if demoted {
            info!(from = ?ComputeState::Ready, to = ?ComputeState::Absent, "compute state changed");
        }
        false
    }

    async fn exit_status(&self) -> Option<String> {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => process.try_exited(),
            None => Some("no process".into()),
        }
    }

    async fn stop_process(&self) {
        let leftover = self.process.lock().await.take();
        if let Some(mut process) = leftover {
            debug!(pid = process.id(), "terminating backend process");
            process.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use sandgate_sync::{ManifestEntry, MemoryStore, ObjectStore, StoreError, SyncManifest};

    #[derive(Default)]
    struct FakeProcess {
        exited: Arc<AtomicBool>,
        terminated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ComputeProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_exited(&mut self) -> Option<String> {
            self.exited
                .load(Ordering::SeqCst)
                .then(|| "exit status: 1".to_string())
        }

        async fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            self.exited.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launches: AtomicUsize,
        fail: AtomicBool,
        /// Exit flag of the most recent process.
        exited: Mutex<Arc<AtomicBool>>,
        terminated: Arc<AtomicUsize>,
        /// Run before each launch; used to observe ordering.
        on_launch: Mutex<Option<Box<dyn Fn() + Send>>>,
    }

    impl FakeLauncher {
        fn kill_current(&self) {
            self.exited.lock().unwrap().store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self) -> std::io::Result<Box<dyn ComputeProcess>> {
            if let Some(hook) = self.on_launch.lock().unwrap().as_ref() {
                hook();
            }
            if self.fail.load(Ordering::SeqCst) {
                self.launches.fetch_add(1, Ordering::SeqCst);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such binary",
                ));
            }
            let exited = Arc::new(AtomicBool::new(false));
            *self.exited.lock().unwrap() = exited.clone();
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeProcess {
                exited,
                terminated: self.terminated.clone(),
            }))
        }
    }

    /// Ready after `not_ready_for` probes, or never if `healthy` is off.
    struct FakeProbe {
        probes: AtomicUsize,
        not_ready_for: usize,
        healthy: AtomicBool,
    }

    impl FakeProbe {
        fn ready_after(n: usize) -> Self {
            Self {
                probes: AtomicUsize::new(0),
                not_ready_for: n,
                healthy: AtomicBool::new(true),
            }
        }

        fn never() -> Self {
            let probe = Self::ready_after(0);
            probe.healthy.store(false, Ordering::SeqCst);
            probe
        }
    }

    #[async_trait]
    impl ReadinessProbe for FakeProbe {
        async fn probe(&self) -> ProbeResult {
            let n = self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) && n >= self.not_ready_for {
                ProbeResult::Healthy
            } else {
                ProbeResult::Failed
            }
        }
    }

    fn policy() -> StartPolicy {
        StartPolicy {
            start_timeout: Duration::from_secs(5),
            probe_initial: Duration::from_millis(5),
            probe_max: Duration::from_millis(20),
            max_probe_attempts: 10,
            health_interval: Duration::from_millis(10),
            unhealthy_threshold: 2,
        }
    }

    fn supervisor(
        launcher: Arc<FakeLauncher>,
        probe: Arc<FakeProbe>,
        sync: Option<Arc<SyncEngine>>,
    ) -> Supervisor {
        Supervisor::new(launcher, probe, sync, policy())
    }

    #[tokio::test]
    async fn cold_start_reaches_ready() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(2)), None);

        assert_eq!(sup.state(), ComputeState::Absent);
        sup.ensure_running().await.unwrap();
        assert_eq!(sup.state(), ComputeState::Ready);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        // Idempotent while ready.
        sup.ensure_running().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_launch() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(3)), None);

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let sup = sup.clone();
                tokio::spawn(async move { sup.ensure_running().await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state(), ComputeState::Ready);
    }

    #[tokio::test]
    async fn readiness_timeout_is_not_sticky() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(FakeProbe::never());
        let sup = supervisor(launcher.clone(), probe.clone(), None);

        let err = sup.ensure_running().await.unwrap_err();
        assert_eq!(err, LifecycleError::StartTimeout);
        assert_eq!(sup.state(), ComputeState::Absent);
        assert_eq!(probe.probes.load(Ordering::SeqCst), 10);
        // The failed process is not left running.
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);

        probe.healthy.store(true, Ordering::SeqCst);
        sup.ensure_running().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_waiters_see_the_same_failure() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail.store(true, Ordering::SeqCst);
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(0)), None);

        let (a, b) = tokio::join!(sup.ensure_running(), sup.ensure_running());
        assert!(matches!(a, Err(LifecycleError::StartFailed(_))));
        assert_eq!(a, b);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exit_during_startup_is_a_crash() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(FakeProbe::never());
        let sup = supervisor(launcher.clone(), probe, None);

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure_running().await })
        };
        while launcher.launches.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        launcher.kill_current();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::ProcessCrashed(_)));
        assert_eq!(sup.state(), ComputeState::Absent);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_start() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(3)), None);

        let _ = tokio::time::timeout(Duration::from_millis(1), sup.ensure_running()).await;

        let mut states = sup.subscribe();
        states
            .wait_for(|s| *s == ComputeState::Ready)
            .await
            .unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn external_exit_is_detected_and_restarted() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(0)), None);
        sup.ensure_running().await.unwrap();

        launcher.kill_current();
        sup.ensure_running().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(sup.state(), ComputeState::Ready);
    }

    #[tokio::test]
    async fn restore_runs_before_launch() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("cfg/settings.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .put(
                "cfg/.sandgate-marker",
                Bytes::from_static(br#"{"version":7,"digest":"x","files":1}"#),
            )
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("cfg");
        let manifest = SyncManifest::new(vec![ManifestEntry::new("cfg", &local, "cfg")]);
        let engine = Arc::new(SyncEngine::new(store, manifest));

        let seen_at_launch = Arc::new(AtomicBool::new(false));
        let launcher = Arc::new(FakeLauncher::default());
        {
            let seen = seen_at_launch.clone();
            let path = local.join("settings.json");
            *launcher.on_launch.lock().unwrap() =
                Some(Box::new(move || seen.store(path.exists(), Ordering::SeqCst)));
        }

        let sup = supervisor(launcher, Arc::new(FakeProbe::ready_after(0)), Some(engine.clone()));
        sup.ensure_running().await.unwrap();

        assert!(seen_at_launch.load(Ordering::SeqCst));
        assert!(engine.is_reconciled());
    }

    /// Every call stalls forever.
    struct StalledStore;

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
            std::future::pending().await
        }

        async fn put(&self, _key: &str, _body: Bytes) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_restore_does_not_wedge_start() {
        let dir = tempfile::tempdir().unwrap();
        let manifest =
            SyncManifest::new(vec![ManifestEntry::new("cfg", dir.path().join("cfg"), "cfg")]);
        let engine = Arc::new(SyncEngine::new(Arc::new(StalledStore), manifest));

        let launcher = Arc::new(FakeLauncher::default());
        let sup = Supervisor::new(
            launcher.clone(),
            Arc::new(FakeProbe::ready_after(0)),
            Some(engine.clone()),
            StartPolicy {
                start_timeout: Duration::from_millis(100),
                ..policy()
            },
        );

        tokio::time::timeout(Duration::from_secs(3), sup.ensure_running())
            .await
            .expect("start attempt finished")
            .unwrap();
        assert_eq!(sup.state(), ComputeState::Ready);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        // Started on local state; the entry must not be backed up blind.
        assert!(!engine.is_reconciled());
    }

    #[tokio::test]
    async fn liveness_check_leaves_a_starting_attempt_alone() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher, Arc::new(FakeProbe::ready_after(0)), None);

        sup.inner.set_state(ComputeState::Starting);
        assert!(!sup.inner.check_alive().await);
        assert_eq!(sup.state(), ComputeState::Starting);
    }

    #[tokio::test]
    async fn liveness_check_demotes_exited_ready_backend() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(0)), None);
        sup.ensure_running().await.unwrap();

        launcher.kill_current();
        assert!(!sup.inner.check_alive().await);
        assert_eq!(sup.state(), ComputeState::Absent);
    }

    #[tokio::test]
    async fn watchdog_discards_unresponsive_backend() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(FakeProbe::ready_after(0));
        let sup = supervisor(launcher.clone(), probe.clone(), None);
        sup.ensure_running().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let watchdog = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run_watchdog(rx).await })
        };

        probe.healthy.store(false, Ordering::SeqCst);
        let mut states = sup.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ComputeState::Absent),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        watchdog.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_terminates_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(launcher.clone(), Arc::new(FakeProbe::ready_after(0)), None);
        sup.ensure_running().await.unwrap();

        sup.shutdown().await;
        assert_eq!(sup.state(), ComputeState::Absent);
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
    }
}
