mod host;
mod probe;

pub use host::validate_host;
pub use probe::{IcmpProber, ProbeError, ProbeOutcome, Prober};

use crate::model::{
    CycleOutcome, MonitorConfig, MonitorEvent, RunState, Sample, StartError, Statistics,
};
use crate::stats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum MonitorControl {
    Start {
        host: String,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    Stop,
    Reset,
}

/// Handle to the sampler task. Cheap to clone; the task exits once every
/// handle is dropped.
#[derive(Clone)]
pub struct Monitor {
    ctrl_tx: mpsc::Sender<MonitorControl>,
    filter: Arc<AtomicU64>,
}

impl Monitor {
    /// Spawn the sampler task with the real ICMP prober.
    pub fn spawn(cfg: MonitorConfig) -> (Monitor, mpsc::Receiver<MonitorEvent>) {
        Self::spawn_with(cfg, Arc::new(IcmpProber::new()))
    }

    pub fn spawn_with(
        cfg: MonitorConfig,
        prober: Arc<dyn Prober>,
    ) -> (Monitor, mpsc::Receiver<MonitorEvent>) {
        let (event_tx, event_rx) = mpsc::channel::<MonitorEvent>(256);
        let (ctrl_tx, ctrl_rx) = mpsc::channel::<MonitorControl>(32);
        let filter = Arc::new(AtomicU64::new(cfg.filter_threshold));
        let engine = SamplerEngine::new(cfg, prober, Arc::clone(&filter));
        tokio::spawn(engine.run(event_tx, ctrl_rx));
        (Self { ctrl_tx, filter }, event_rx)
    }

    /// Validate, probe and begin sampling `host`. Returns once the polling
    /// loop is running or the start attempt failed. A `start` while already
    /// running is accepted and ignored.
    pub async fn start(&self, host: &str) -> Result<(), StartError> {
        let (reply, rx) = oneshot::channel();
        let msg = MonitorControl::Start {
            host: host.to_owned(),
            reply,
        };
        if self.ctrl_tx.send(msg).await.is_err() {
            return Err(StartError::EngineGone);
        }
        rx.await.unwrap_or(Err(StartError::EngineGone))
    }

    /// Request a cooperative halt, honored at the next cycle boundary. An
    /// in-flight probe or sleep is never interrupted.
    pub async fn stop(&self) {
        self.ctrl_tx.send(MonitorControl::Stop).await.ok();
    }

    /// Clear the accumulated history and loss counter. The current run state
    /// is preserved.
    pub async fn reset(&self) {
        self.ctrl_tx.send(MonitorControl::Reset).await.ok();
    }

    pub fn set_filter(&self, threshold_ms: u64) {
        self.filter.store(threshold_ms, Ordering::Relaxed);
    }

    /// Parse a user-supplied threshold, falling back to 0 (no filter) on
    /// unparsable input. May be called at any time, including mid-run.
    pub fn set_filter_threshold(&self, raw: &str) {
        self.set_filter(stats::parse_filter_threshold(raw));
    }
}

enum LoopSignal {
    Continue,
    Halt,
}

/// The sampler state machine. Owns the history and run state exclusively;
/// the foreground only ever sees snapshots published through events.
struct SamplerEngine {
    cfg: MonitorConfig,
    prober: Arc<dyn Prober>,
    filter: Arc<AtomicU64>,
    history: Vec<Sample>,
    lost: u64,
    state: RunState,
    last_host: Option<String>,
}

impl SamplerEngine {
    fn new(cfg: MonitorConfig, prober: Arc<dyn Prober>, filter: Arc<AtomicU64>) -> Self {
        Self {
            cfg,
            prober,
            filter,
            history: Vec::new(),
            lost: 0,
            state: RunState::Idle,
            last_host: None,
        }
    }

    async fn run(
        mut self,
        event_tx: mpsc::Sender<MonitorEvent>,
        mut ctrl_rx: mpsc::Receiver<MonitorControl>,
    ) {
        while let Some(msg) = ctrl_rx.recv().await {
            match msg {
                MonitorControl::Start { host, reply } => {
                    let res = self.begin(&host, &event_tx).await;
                    let accepted = res.is_ok();
                    reply.send(res).ok();
                    if accepted {
                        self.poll_loop(&host, &mut ctrl_rx, &event_tx).await;
                    }
                }
                MonitorControl::Stop => {
                    if self.state != RunState::Stopped {
                        self.transition(RunState::Stopped, &event_tx).await;
                    }
                }
                MonitorControl::Reset => {
                    self.clear(&event_tx).await;
                }
            }
        }
    }

    /// Validate, probe with the bounded retry budget, reset history on a
    /// host change, then enter `Running`.
    async fn begin(
        &mut self,
        host: &str,
        event_tx: &mpsc::Sender<MonitorEvent>,
    ) -> Result<(), StartError> {
        self.transition(RunState::Probing, event_tx).await;

        if !host::validate_host(host) {
            self.transition(RunState::HostError, event_tx).await;
            return Err(StartError::Host(host.to_owned()));
        }

        let attempts = self.cfg.retry_count + 1;
        let mut reachable = false;
        for attempt in 0..attempts {
            match self.prober.probe(host, self.cfg.probe_timeout).await {
                Ok(ProbeOutcome::Reply(_)) => {
                    reachable = true;
                    break;
                }
                Ok(ProbeOutcome::Timeout) | Err(_) => {
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.cfg.retry_delay).await;
                    }
                }
            }
        }
        if !reachable {
            self.transition(RunState::PingError, event_tx).await;
            return Err(StartError::Ping { attempts });
        }

        // A host change invalidates the accumulated history; the same host
        // keeps sampling into it across stop/start.
        if self.last_host.as_deref() != Some(host) {
            self.clear(event_tx).await;
            self.last_host = Some(host.to_owned());
        }

        self.transition(RunState::Running, event_tx).await;
        Ok(())
    }

    async fn poll_loop(
        &mut self,
        host: &str,
        ctrl_rx: &mut mpsc::Receiver<MonitorControl>,
        event_tx: &mpsc::Sender<MonitorEvent>,
    ) {
        loop {
            let (outcome, at) = match self.prober.probe(host, self.cfg.probe_timeout).await {
                Ok(ProbeOutcome::Reply(rtt)) => {
                    let latency_ms = rtt.as_millis() as u64;
                    let sample = Sample {
                        at: Instant::now(),
                        latency_ms,
                    };
                    self.history.push(sample);
                    (CycleOutcome::Reply { rtt_ms: latency_ms }, sample.at)
                }
                Ok(ProbeOutcome::Timeout) => {
                    self.lost += 1;
                    (CycleOutcome::Lost, Instant::now())
                }
                Err(_) => {
                    // Unrecoverable mid-run failure: surface it as a state,
                    // keep the history, and return to the control loop so a
                    // later start can re-arm.
                    self.transition(RunState::PingError, event_tx).await;
                    return;
                }
            };

            // Sample append and statistics recompute publish as one message;
            // the foreground never sees a torn update.
            let stats = self.current_stats();
            event_tx
                .send(MonitorEvent::CycleCompleted { outcome, at, stats })
                .await
                .ok();

            tokio::time::sleep(self.cfg.poll_interval).await;

            if let LoopSignal::Halt = self.drain_control(ctrl_rx, event_tx).await {
                return;
            }
        }
    }

    fn current_stats(&self) -> Option<Statistics> {
        let latencies: Vec<u64> = self.history.iter().map(|s| s.latency_ms).collect();
        stats::aggregate(&latencies, self.filter.load(Ordering::Relaxed), self.lost)
    }

    /// Handle control messages queued up during the cycle. Runs at the cycle
    /// boundary only, so a stop never interrupts an in-flight probe.
    async fn drain_control(
        &mut self,
        ctrl_rx: &mut mpsc::Receiver<MonitorControl>,
        event_tx: &mpsc::Sender<MonitorEvent>,
    ) -> LoopSignal {
        loop {
            match ctrl_rx.try_recv() {
                Ok(MonitorControl::Stop) => {
                    self.transition(RunState::Stopped, event_tx).await;
                    return LoopSignal::Halt;
                }
                Ok(MonitorControl::Reset) => {
                    self.clear(event_tx).await;
                }
                Ok(MonitorControl::Start { reply, .. }) => {
                    // Already running: no-op.
                    reply.send(Ok(())).ok();
                }
                Err(TryRecvError::Empty) => return LoopSignal::Continue,
                Err(TryRecvError::Disconnected) => {
                    // Every handle was dropped, so unlike the other
                    // transitions this one records the stop without
                    // publishing a StateChanged.
                    self.state = RunState::Stopped;
                    return LoopSignal::Halt;
                }
            }
        }
    }

    async fn transition(&mut self, next: RunState, event_tx: &mpsc::Sender<MonitorEvent>) {
        self.state = next;
        event_tx.send(MonitorEvent::StateChanged(next)).await.ok();
    }

    async fn clear(&mut self, event_tx: &mpsc::Sender<MonitorEvent>) {
        self.history.clear();
        self.lost = 0;
        event_tx.send(MonitorEvent::HistoryCleared).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Feeds pre-scripted outcomes to the engine and parks when the script
    /// runs dry, mirroring a probe that never completes until the test
    /// supplies the next reply.
    #[derive(Default)]
    struct ScriptedProber {
        script: Mutex<VecDeque<Result<ProbeOutcome, ProbeError>>>,
        wakeup: Notify,
        calls: AtomicU32,
    }

    impl ScriptedProber {
        fn new(script: Vec<Result<ProbeOutcome, ProbeError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                wakeup: Notify::new(),
                calls: AtomicU32::new(0),
            })
        }

        fn push(&self, entries: Vec<Result<ProbeOutcome, ProbeError>>) {
            self.script.lock().unwrap().extend(entries);
            self.wakeup.notify_one();
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _host: &str, _timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
            loop {
                if let Some(r) = self.script.lock().unwrap().pop_front() {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    return r;
                }
                self.wakeup.notified().await;
            }
        }
    }

    fn reply(ms: u64) -> Result<ProbeOutcome, ProbeError> {
        Ok(ProbeOutcome::Reply(Duration::from_millis(ms)))
    }

    fn timeout() -> Result<ProbeOutcome, ProbeError> {
        Ok(ProbeOutcome::Timeout)
    }

    fn broken() -> Result<ProbeOutcome, ProbeError> {
        Err(ProbeError::Icmp("socket closed".into()))
    }

    fn fast_cfg() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(5),
            retry_count: 3,
            retry_delay: Duration::from_millis(5),
            filter_threshold: 0,
        }
    }

    async fn next_cycle(
        rx: &mut mpsc::Receiver<MonitorEvent>,
    ) -> (CycleOutcome, Option<Statistics>) {
        loop {
            match rx.recv().await.expect("event channel closed") {
                MonitorEvent::CycleCompleted { outcome, stats, .. } => return (outcome, stats),
                _ => {}
            }
        }
    }

    async fn next_state(rx: &mut mpsc::Receiver<MonitorEvent>) -> RunState {
        loop {
            match rx.recv().await.expect("event channel closed") {
                MonitorEvent::StateChanged(s) => return s,
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_host_fails_fast_without_probing() {
        let prober = ScriptedProber::new(vec![]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());

        let err = monitor.start("not a host").await.unwrap_err();
        assert_eq!(err, StartError::Host("not a host".into()));
        assert_eq!(prober.calls(), 0);
        assert_eq!(next_state(&mut events).await, RunState::Probing);
        assert_eq!(next_state(&mut events).await, RunState::HostError);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_host_exhausts_the_retry_budget() {
        let prober = ScriptedProber::new(vec![timeout(), timeout(), timeout(), timeout()]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());

        let err = monitor.start("203.0.113.1").await.unwrap_err();
        assert_eq!(err, StartError::Ping { attempts: 4 });
        assert_eq!(prober.calls(), 4);
        assert_eq!(next_state(&mut events).await, RunState::Probing);
        assert_eq!(next_state(&mut events).await, RunState::PingError);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_count_as_failed_attempts_while_probing() {
        let prober = ScriptedProber::new(vec![broken(), timeout(), reply(9)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());

        monitor.start("example.com").await.unwrap();
        assert_eq!(prober.calls(), 3);
        assert_eq!(next_state(&mut events).await, RunState::Probing);
        assert_eq!(next_state(&mut events).await, RunState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn successes_and_losses_accumulate_independently() {
        let prober = ScriptedProber::new(vec![
            reply(5), // connectivity probe, not a sample
            reply(10),
            timeout(),
            reply(20),
            timeout(),
            reply(30),
            reply(40),
        ]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober);
        monitor.start("example.com").await.unwrap();

        let (outcome, stats) = next_cycle(&mut events).await;
        assert_eq!(outcome, CycleOutcome::Reply { rtt_ms: 10 });
        assert!(stats.is_none(), "one sample is not enough to report");

        let (outcome, stats) = next_cycle(&mut events).await;
        assert_eq!(outcome, CycleOutcome::Lost);
        assert!(stats.is_none());

        let (outcome, stats) = next_cycle(&mut events).await;
        assert_eq!(outcome, CycleOutcome::Reply { rtt_ms: 20 });
        let stats = stats.unwrap();
        assert_eq!(stats.summary.count, 2);
        assert_eq!(stats.lost, 1);

        let (_, stats) = next_cycle(&mut events).await;
        let stats = stats.unwrap();
        assert_eq!(stats.summary.count, 2);
        assert_eq!(stats.lost, 2);

        let (_, stats) = next_cycle(&mut events).await;
        let stats = stats.unwrap();
        assert_eq!(stats.summary.count, 3);
        assert_eq!(stats.summary.min, 10);
        assert_eq!(stats.summary.max, 30);
        assert_eq!(stats.summary.median, 20.0);
        assert_eq!(stats.summary.average, 20.0);

        let (_, stats) = next_cycle(&mut events).await;
        let stats = stats.unwrap();
        assert_eq!(stats.summary.count, 4);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.summary.median, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_honored_before_the_next_probe() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), reply(12)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());
        monitor.start("example.com").await.unwrap();

        next_cycle(&mut events).await;
        next_cycle(&mut events).await;
        monitor.stop().await;

        assert_eq!(next_state(&mut events).await, RunState::Stopped);
        assert_eq!(prober.calls(), 3, "no probe scheduled after the stop");
    }

    #[tokio::test(start_paused = true)]
    async fn same_host_keeps_history_but_a_new_host_clears_it() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), reply(20)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());
        monitor.start("example.com").await.unwrap();
        next_cycle(&mut events).await;
        let (_, stats) = next_cycle(&mut events).await;
        assert_eq!(stats.unwrap().summary.count, 2);
        monitor.stop().await;
        assert_eq!(next_state(&mut events).await, RunState::Stopped);

        // Same host again: the history carries over.
        prober.push(vec![reply(5), reply(30)]);
        monitor.start("example.com").await.unwrap();
        assert_eq!(next_state(&mut events).await, RunState::Probing);
        assert_eq!(next_state(&mut events).await, RunState::Running);
        let (_, stats) = next_cycle(&mut events).await;
        assert_eq!(stats.unwrap().summary.count, 3);
        monitor.stop().await;
        assert_eq!(next_state(&mut events).await, RunState::Stopped);

        // Different host: history resets before the run begins.
        prober.push(vec![reply(5), reply(7)]);
        monitor.start("other.example.com").await.unwrap();
        let mut saw_clear = false;
        let stats = loop {
            match events.recv().await.expect("event channel closed") {
                MonitorEvent::HistoryCleared => saw_clear = true,
                MonitorEvent::CycleCompleted { stats, .. } => break stats,
                MonitorEvent::StateChanged(_) => {}
            }
        };
        assert!(saw_clear, "host change must clear the history");
        assert!(stats.is_none(), "first sample after the reset");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_history_and_loss_but_keeps_the_state() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), timeout(), reply(20)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());
        monitor.start("example.com").await.unwrap();
        next_cycle(&mut events).await;
        next_cycle(&mut events).await;
        let (_, stats) = next_cycle(&mut events).await;
        let stats = stats.unwrap();
        assert_eq!(stats.summary.count, 2);
        assert_eq!(stats.lost, 1);

        monitor.reset().await;
        prober.push(vec![reply(30), reply(40)]);

        let mut saw_clear = false;
        let stats = loop {
            match events.recv().await.expect("event channel closed") {
                MonitorEvent::HistoryCleared => saw_clear = true,
                MonitorEvent::CycleCompleted { stats, .. } => break stats,
                MonitorEvent::StateChanged(s) => {
                    panic!("reset must not change the run state, got {s:?}")
                }
            }
        };
        assert!(saw_clear);
        assert!(stats.is_none(), "history restarted from zero samples");

        let (_, stats) = next_cycle(&mut events).await;
        let stats = stats.unwrap();
        assert_eq!(stats.summary.count, 2);
        assert_eq!(stats.lost, 0, "loss counter was zeroed too");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_while_stopped_clears_counters() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), reply(20)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());
        monitor.start("example.com").await.unwrap();
        next_cycle(&mut events).await;
        next_cycle(&mut events).await;
        monitor.stop().await;
        assert_eq!(next_state(&mut events).await, RunState::Stopped);

        monitor.reset().await;

        // Restarting the same host begins from an empty history.
        prober.push(vec![reply(5), reply(30)]);
        monitor.start("example.com").await.unwrap();
        let (_, stats) = next_cycle(&mut events).await;
        assert!(stats.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_running_is_a_no_op() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());
        monitor.start("example.com").await.unwrap();
        next_cycle(&mut events).await;

        // Even naming a different host must not re-probe or reset anything.
        let (res, _) = tokio::join!(monitor.start("other.example.com"), async {
            prober.push(vec![reply(20)]);
        });
        assert_eq!(res, Ok(()));

        let stats = loop {
            match events.recv().await.expect("event channel closed") {
                MonitorEvent::CycleCompleted { stats, .. } => break stats,
                ev => panic!("unexpected event during a running start: {ev:?}"),
            }
        };
        assert_eq!(stats.unwrap().summary.count, 2, "history kept growing");
    }

    #[tokio::test(start_paused = true)]
    async fn mid_run_probe_error_parks_in_ping_error() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), broken()]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober.clone());
        monitor.start("example.com").await.unwrap();
        next_cycle(&mut events).await;

        assert_eq!(next_state(&mut events).await, RunState::PingError);

        // The task survives and a new start re-arms it; history is intact.
        prober.push(vec![reply(5), reply(20)]);
        monitor.start("example.com").await.unwrap();
        let (_, stats) = next_cycle(&mut events).await;
        assert_eq!(stats.unwrap().summary.count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_timestamps_come_from_the_samples_themselves() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), reply(20), reply(30)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober);
        monitor.start("example.com").await.unwrap();

        let mut stamps = Vec::new();
        while stamps.len() < 3 {
            if let MonitorEvent::CycleCompleted { at, .. } =
                events.recv().await.expect("event channel closed")
            {
                stamps.push(at);
            }
        }
        // Consecutive cycles are separated by at least the poll interval.
        assert!(stamps[1] - stamps[0] >= fast_cfg().poll_interval);
        assert!(stamps[2] - stamps[1] >= fast_cfg().poll_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_shuts_the_engine_down() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober);
        monitor.start("example.com").await.unwrap();
        next_cycle(&mut events).await;

        drop(monitor);

        // The engine halts quietly: no Stopped event, the channel just
        // closes once the task exits.
        while let Some(ev) = events.recv().await {
            assert!(
                !matches!(ev, MonitorEvent::StateChanged(_)),
                "halt on disconnect must not publish a state change: {ev:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn filter_threshold_applies_from_the_next_recompute() {
        let prober = ScriptedProber::new(vec![reply(5), reply(10), reply(20), reply(30)]);
        let (monitor, mut events) = Monitor::spawn_with(fast_cfg(), prober);
        monitor.set_filter_threshold("15");
        monitor.start("example.com").await.unwrap();

        next_cycle(&mut events).await;
        let (_, stats) = next_cycle(&mut events).await;
        let f = stats.unwrap().filtered.expect("threshold is active");
        assert_eq!(f.count, 1);

        monitor.set_filter_threshold("oops"); // falls back to "no filter"
        let (_, stats) = next_cycle(&mut events).await;
        assert!(stats.unwrap().filtered.is_none());
    }
}
