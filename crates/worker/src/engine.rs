//! Engine lifecycle: bounded queue, fixed worker pool and recurring schedules.
//!
//! ```text
//! Listener ──send──▶ [ bounded queue (capacity N) ] ──recv──▶ worker × N ──▶ Router ──▶ handler
//!                                                                                  │
//!                                                                       Ok ──▶ ack │ Err ──▶ drop
//! ```
//!
//! `Created → Running → Stopping → Stopped`. `run` subscribes the listener and
//! spawns the workers and schedules; `stop` cancels schedules, closes the
//! listener, closes the queue and waits for the workers to drain it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use incentive_core::{Clock, LocalClock};

use crate::config::EngineConfig;
use crate::error::{EngineError, HandlerError};
use crate::handler::{JobHandler, SharedHandler};
use crate::job::{Job, JobContext};
use crate::listener::{JobSink, Listener, StopFn};
use crate::middleware::{Middleware, Pipeline};
use crate::router::{Router, RouterBuilder};
use crate::schedule::Schedule;
use crate::stats::{EngineStats, StatsSnapshot};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Setup phase. Routes, middleware and schedules can only be added here; the
/// builder is consumed by [`EngineBuilder::build`].
pub struct EngineBuilder {
    config: EngineConfig,
    listener: Option<Arc<dyn Listener>>,
    routes: RouterBuilder,
    pipeline: Pipeline,
    schedules: Vec<Schedule>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            listener: None,
            routes: RouterBuilder::new(),
            pipeline: Pipeline::new(),
            schedules: Vec::new(),
            clock: Arc::new(LocalClock),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn route(mut self, topic: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.routes.register(topic, handler);
        self
    }

    pub fn route_shared(mut self, topic: impl Into<String>, handler: SharedHandler) -> Self {
        self.routes.register_shared(topic, handler);
        self
    }

    /// Append a middleware. The first one added is the outermost.
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.pipeline.push(middleware);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedules.push(schedule);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        if self.config.mode.runs_consumers() && self.listener.is_none() {
            return Err(EngineError::InvalidConfig(format!(
                "mode '{}' runs consumers but no listener was configured",
                self.config.mode
            )));
        }

        let router = self.routes.freeze().with_pipeline(&self.pipeline);
        let (state, _) = watch::channel(EngineState::Created);

        Ok(Engine {
            inner: Arc::new(Inner {
                config: self.config,
                listener: self.listener,
                router,
                schedules: Mutex::new(self.schedules),
                clock: self.clock,
                stats: Arc::new(EngineStats::default()),
                state,
                shutdown: CancellationToken::new(),
                queue_closed: CancellationToken::new(),
                tasks: Mutex::new(Tasks::default()),
                stop_once: Arc::new(StopOnce::default()),
            }),
        })
    }
}

/// A running (or runnable) engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    listener: Option<Arc<dyn Listener>>,
    router: Router,
    schedules: Mutex<Vec<Schedule>>,
    clock: Arc<dyn Clock>,
    stats: Arc<EngineStats>,
    state: watch::Sender<EngineState>,
    /// Cancelled when stopping begins. Seen by schedules and handlers.
    shutdown: CancellationToken,
    /// Cancelled once the listener is closed; workers then drain and exit.
    queue_closed: CancellationToken,
    tasks: Mutex<Tasks>,
    stop_once: Arc<StopOnce>,
}

#[derive(Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    schedules: Vec<JoinHandle<()>>,
}

/// Runs the listener's stop callback once, when the last worker exits.
#[derive(Default)]
struct StopOnce {
    remaining: AtomicUsize,
    stop: Mutex<Option<StopFn>>,
}

impl StopOnce {
    fn arm(&self, stop: StopFn, workers: usize) {
        self.remaining.store(workers, Ordering::SeqCst);
        *lock(&self.stop) = Some(stop);
    }

    fn worker_exited(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let stop = lock(&self.stop).take();
        if let Some(stop) = stop {
            stop();
            debug!("listener stop callback invoked");
        }
    }
}

/// Receiving half of the queue, shared by all workers.
#[derive(Clone)]
struct JobQueue {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    closed: CancellationToken,
}

impl JobQueue {
    /// Next job, or `None` once the queue is closed and drained.
    async fn next(&self) -> Option<Job> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            job = rx.recv() => job,
            _ = self.closed.cancelled() => {
                rx.close();
                rx.recv().await
            }
        }
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.inner.router.topics()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Resolves once the engine reaches [`EngineState::Stopped`].
    pub async fn stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == EngineState::Stopped).await;
    }

    /// Start consumers and schedules according to the configured mode.
    ///
    /// Returns once everything is spawned. A listener that fails to subscribe
    /// aborts startup and leaves the engine stopped. A `stop` that lands while
    /// the listener is still subscribing wins: nothing is spawned and `run`
    /// returns [`EngineError::NotRunning`].
    pub async fn run(&self) -> Result<(), EngineError> {
        let started = self.inner.state.send_if_modified(|s| {
            if *s == EngineState::Created {
                *s = EngineState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(EngineError::AlreadyStarted);
        }

        let mode = self.inner.config.mode;
        info!(
            mode = %mode,
            workers = self.inner.config.capacity(),
            topics = ?self.inner.router.topics(),
            "engine starting"
        );

        if mode.runs_consumers() {
            match self.start_consumers().await {
                Ok(()) => {}
                Err(EngineError::NotRunning) => {
                    info!("engine stopped during startup");
                    return Err(EngineError::NotRunning);
                }
                Err(e) => {
                    error!(error = %e, "engine startup failed");
                    self.inner.state.send_replace(EngineState::Stopped);
                    return Err(e);
                }
            }
        }

        if mode.runs_schedules() {
            self.start_schedules()?;
        }

        info!("engine running");
        Ok(())
    }

    fn is_running(&self) -> bool {
        *self.inner.state.borrow() == EngineState::Running
    }

    async fn start_consumers(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let listener = inner.listener.clone().ok_or_else(|| {
            EngineError::InvalidConfig("consumers require a listener".to_string())
        })?;

        let capacity = inner.config.capacity();
        let (tx, rx) = mpsc::channel(capacity);

        let stop = listener
            .listen(inner.router.topics(), JobSink::new(tx))
            .await
            .map_err(EngineError::Startup)?;

        // `stop` flips the state before it takes the task list, so a Running
        // state seen under this lock means the workers spawned here get joined.
        let mut tasks = lock(&inner.tasks);
        if !self.is_running() {
            stop();
            return Err(EngineError::NotRunning);
        }
        inner.stop_once.arm(stop, capacity);

        let queue = JobQueue {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closed: inner.queue_closed.clone(),
        };

        for worker_id in 0..capacity {
            let worker = Worker {
                ctx: JobContext::new(worker_id, inner.shutdown.clone()),
                queue: queue.clone(),
                router: inner.router.clone(),
                stats: inner.stats.clone(),
                stop_once: inner.stop_once.clone(),
            };
            tasks.workers.push(tokio::spawn(worker.run()));
        }

        Ok(())
    }

    fn start_schedules(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let schedules = std::mem::take(&mut *lock(&inner.schedules));

        let mut tasks = lock(&inner.tasks);
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        for schedule in schedules {
            let handle = tokio::spawn(schedule.run(
                inner.clock.clone(),
                inner.shutdown.clone(),
                inner.stats.clone(),
            ));
            tasks.schedules.push(handle);
        }

        Ok(())
    }

    /// Stop schedules, close the listener, close the queue and wait for the
    /// workers to drain it.
    ///
    /// Calling `stop` again is a no-op; a call that overlaps a running stop
    /// waits for it to finish. Only the first caller sees a listener close
    /// failure, returned as [`EngineError::Shutdown`] after the rest of the
    /// shutdown has completed.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut previous = EngineState::Created;
        let stopping = self.inner.state.send_if_modified(|s| {
            previous = *s;
            if *s == EngineState::Running {
                *s = EngineState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return match previous {
                EngineState::Created => Err(EngineError::NotRunning),
                EngineState::Stopping => {
                    self.stopped().await;
                    Ok(())
                }
                _ => Ok(()),
            };
        }

        info!("engine stopping");
        let inner = &self.inner;
        inner.shutdown.cancel();

        let closed = match &inner.listener {
            Some(listener) if inner.config.mode.runs_consumers() => listener.close().await,
            _ => Ok(()),
        };
        if let Err(e) = &closed {
            error!(error = %e, "listener close failed");
        }

        inner.queue_closed.cancel();

        let (workers, schedules) = {
            let mut tasks = lock(&inner.tasks);
            (
                std::mem::take(&mut tasks.workers),
                std::mem::take(&mut tasks.schedules),
            )
        };
        self.join_all(workers, "worker").await;
        self.join_all(schedules, "schedule").await;

        // Workers that were aborted never reached their exit path.
        inner.stop_once.fire();

        inner.state.send_replace(EngineState::Stopped);
        info!(stats = ?inner.stats.snapshot(), "engine stopped");

        closed.map_err(EngineError::Shutdown)
    }

    /// `run`, wait for `shutdown`, then `stop`.
    pub async fn serve<F>(&self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        self.run().await?;
        shutdown.await;
        info!("shutdown requested");
        self.stop().await
    }

    async fn join_all(&self, handles: Vec<JoinHandle<()>>, kind: &'static str) {
        let deadline = self.inner.config.drain_timeout.map(|t| Instant::now() + t);

        for mut handle in handles {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(kind, "task still running at drain deadline; aborting");
                        handle.abort();
                        continue;
                    }
                },
                None => handle.await,
            };

            if let Err(e) = joined {
                if e.is_panic() {
                    error!(kind, error = %e, "task panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .field("router", &self.inner.router)
            .finish()
    }
}

struct Worker {
    ctx: JobContext,
    queue: JobQueue,
    router: Router,
    stats: Arc<EngineStats>,
    stop_once: Arc<StopOnce>,
}

impl Worker {
    async fn run(self) {
        let worker_id = self.ctx.worker_id();
        debug!(worker_id, "worker started");

        while let Some(job) = self.queue.next().await {
            self.stats.record_received();
            self.dispatch(job).await;
        }

        self.stop_once.worker_exited();
        debug!(worker_id, "worker exited");
    }

    async fn dispatch(&self, job: Job) {
        let worker_id = self.ctx.worker_id();

        let Some(handler) = self.router.resolve(job.topic()) else {
            debug!(worker_id, topic = job.topic(), "no handler for topic; job dropped");
            self.stats.record_unrouted();
            return;
        };

        let outcome = AssertUnwindSafe(handler.handle(&self.ctx, &job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

        if let Err(e) = outcome {
            warn!(
                worker_id,
                topic = job.topic(),
                error = %e,
                "handler failed; job dropped without ack"
            );
            self.stats.record_failed();
            return;
        }

        self.stats.record_succeeded();

        let topic = job.topic().to_string();
        if let Err(e) = job.ack().await {
            error!(worker_id, topic = %topic, error = %e, "ack failed");
            self.stats.record_ack_failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::EngineMode;
    use crate::error::{ListenerError, ScheduleError};
    use crate::handler::handler_fn;
    use crate::in_memory::InMemoryBroker;
    use crate::schedule::action_fn;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn config(capacity: usize) -> EngineConfig {
        EngineConfig::default().with_queue_capacity(capacity)
    }

    struct RefusingListener;

    #[async_trait]
    impl Listener for RefusingListener {
        async fn listen(&self, _: Vec<String>, _: JobSink) -> Result<StopFn, ListenerError> {
            Err(ListenerError::Subscribe("no such group".into()))
        }

        async fn close(&self) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    #[test]
    fn consumers_need_a_listener() {
        assert!(matches!(
            Engine::builder(config(2)).build(),
            Err(EngineError::InvalidConfig(_))
        ));

        let engine = Engine::builder(config(2).with_mode(EngineMode::SchedulersOnly)).build();
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::builder(config(2))
            .with_listener(broker.clone())
            .build()
            .unwrap();

        assert_eq!(engine.state(), EngineState::Created);
        assert!(matches!(engine.stop().await, Err(EngineError::NotRunning)));

        engine.run().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(matches!(engine.run().await, Err(EngineError::AlreadyStarted)));

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.stopped().await;

        // second stop is a no-op
        engine.stop().await.unwrap();
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn startup_failure_is_fatal() {
        let engine = Engine::builder(config(2))
            .with_listener(Arc::new(RefusingListener))
            .route("trips", handler_fn(|_, _| Ok(())))
            .build()
            .unwrap();

        assert!(matches!(
            engine.run().await,
            Err(EngineError::Startup(ListenerError::Subscribe(_)))
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn subscribes_registered_topics() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::builder(config(1))
            .with_listener(broker.clone())
            .route("trips", handler_fn(|_, _| Ok(())))
            .route("payouts", handler_fn(|_, _| Ok(())))
            .build()
            .unwrap();

        engine.run().await.unwrap();
        assert_eq!(broker.subscriptions(), vec!["payouts", "trips"]);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn acks_only_successful_jobs() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::builder(config(3))
            .with_listener(broker.clone())
            .route("ok", handler_fn(|_, _| Ok(())))
            .route("bad", handler_fn(|_, _| Err(HandlerError::failed("rejected"))))
            .build()
            .unwrap();
        engine.run().await.unwrap();

        let ok = broker.publish("ok", b"1".to_vec());
        let bad = broker.publish("bad", b"2".to_vec());
        let unknown = broker.publish("nobody", b"3".to_vec());

        wait_until(|| engine.stats().received == 3).await;
        wait_until(|| broker.acked().len() == 1).await;
        engine.stop().await.unwrap();

        assert_eq!(broker.acked(), vec![ok]);
        assert!(!broker.is_acked(bad));
        assert!(!broker.is_acked(unknown));

        let stats = engine.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unrouted, 1);
    }

    #[tokio::test]
    async fn panicking_handler_keeps_the_worker_alive() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::builder(config(1))
            .with_listener(broker.clone())
            .route(
                "trips",
                handler_fn(|_, job| {
                    if job.payload() == b"boom" {
                        panic!("bad payload");
                    }
                    Ok(())
                }),
            )
            .build()
            .unwrap();
        engine.run().await.unwrap();

        let bad = broker.publish("trips", b"boom".to_vec());
        let good = broker.publish("trips", b"ok".to_vec());

        wait_until(|| broker.is_acked(good)).await;
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop().await.unwrap();

        assert!(!broker.is_acked(bad));
        let stats = engine.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(broker.stop_calls(), 1);
    }

    #[tokio::test]
    async fn ack_failures_are_counted_not_retried() {
        let broker = Arc::new(InMemoryBroker::new().with_failing_acks());
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let engine = Engine::builder(config(1))
            .with_listener(broker.clone())
            .route(
                "trips",
                handler_fn(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .build()
            .unwrap();
        engine.run().await.unwrap();

        broker.publish("trips", Vec::new());
        wait_until(|| engine.stats().ack_failed == 1).await;
        engine.stop().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(broker.acked().is_empty());
    }

    #[tokio::test]
    async fn stop_callback_runs_once_for_the_pool() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::builder(config(4))
            .with_listener(broker.clone())
            .build()
            .unwrap();

        engine.run().await.unwrap();
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();

        assert_eq!(broker.stop_calls(), 1);
    }

    #[tokio::test]
    async fn close_failure_still_drains_and_stops() {
        let broker = Arc::new(InMemoryBroker::new().with_failing_close());
        let engine = Engine::builder(config(2))
            .with_listener(broker.clone())
            .build()
            .unwrap();

        engine.run().await.unwrap();
        assert!(matches!(
            engine.stop().await,
            Err(EngineError::Shutdown(ListenerError::Close(_)))
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(broker.stop_calls(), 1);
    }

    #[tokio::test]
    async fn queued_jobs_are_drained_on_stop() {
        let broker = Arc::new(InMemoryBroker::new());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let handled = Arc::new(AtomicU64::new(0));

        struct Gated {
            gate: Arc<tokio::sync::Semaphore>,
            handled: Arc<AtomicU64>,
        }

        #[async_trait]
        impl JobHandler for Gated {
            async fn handle(&self, _: &JobContext, _: &Job) -> Result<(), HandlerError> {
                let permit = self.gate.acquire().await.map_err(anyhow::Error::from)?;
                permit.forget();
                self.handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let engine = Engine::builder(config(2))
            .with_listener(broker.clone())
            .route(
                "trips",
                Gated {
                    gate: gate.clone(),
                    handled: handled.clone(),
                },
            )
            .build()
            .unwrap();
        engine.run().await.unwrap();

        for i in 0..4u8 {
            broker.publish("trips", vec![i]);
        }

        // two workers busy, two jobs buffered
        wait_until(|| engine.stats().received == 2).await;

        let stopper = engine.clone();
        let stopping = tokio::spawn(async move { stopper.stop().await });
        wait_until(|| engine.state() == EngineState::Stopping).await;

        gate.add_permits(4);
        stopping.await.unwrap().unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 4);
        assert_eq!(broker.acked().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_is_aborted_after_drain_timeout() {
        let broker = Arc::new(InMemoryBroker::new());

        struct Hang;

        #[async_trait]
        impl JobHandler for Hang {
            async fn handle(&self, _: &JobContext, _: &Job) -> Result<(), HandlerError> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let engine = Engine::builder(
            config(1).with_drain_timeout(Some(Duration::from_secs(5))),
        )
        .with_listener(broker.clone())
        .route("trips", Hang)
        .build()
        .unwrap();
        engine.run().await.unwrap();

        let id = broker.publish("trips", Vec::new());
        while engine.stats().received == 0 {
            tokio::task::yield_now().await;
        }

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!broker.is_acked(id));
        assert_eq!(broker.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedulers_only_runs_schedules() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let now = chrono::NaiveDate::from_ymd_opt(2023, 9, 14)
            .unwrap()
            .and_hms_opt(2, 59, 0)
            .unwrap();

        let schedule = Schedule::from_clock(
            "rollover",
            "3:00AM",
            Duration::from_secs(30),
            action_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), ScheduleError>(())
                }
            }),
        )
        .unwrap();

        let engine = Engine::builder(config(1).with_mode(EngineMode::SchedulersOnly))
            .with_clock(Arc::new(incentive_core::FixedClock::new(now)))
            .with_schedule(schedule)
            .build()
            .unwrap();
        engine.run().await.unwrap();

        // reset at +60s, runs at +90s and +120s
        tokio::time::sleep(Duration::from_secs(125)).await;
        engine.stop().await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().schedule_runs, 2);
    }

    #[tokio::test]
    async fn overlapping_stop_waits_for_the_drain() {
        let broker = Arc::new(InMemoryBroker::new());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let held = gate.clone();

        struct Blocked(Arc<tokio::sync::Semaphore>);

        #[async_trait]
        impl JobHandler for Blocked {
            async fn handle(&self, _: &JobContext, _: &Job) -> Result<(), HandlerError> {
                let _permit = self.0.acquire().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
        }

        let engine = Engine::builder(config(1))
            .with_listener(broker.clone())
            .route("trips", Blocked(held))
            .build()
            .unwrap();
        engine.run().await.unwrap();

        broker.publish("trips", Vec::new());
        wait_until(|| engine.stats().received == 1).await;

        let first = engine.clone();
        let first = tokio::spawn(async move { first.stop().await });
        wait_until(|| engine.state() == EngineState::Stopping).await;

        let second = engine.clone();
        let mut second = tokio::spawn(async move { second.stop().await });
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut second)
                .await
                .is_err(),
            "second stop returned while the first was still draining"
        );

        gate.add_permits(1);
        second.await.unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        first.await.unwrap().unwrap();
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn stop_during_subscribe_spawns_nothing() {
        struct SlowListener {
            gate: Arc<tokio::sync::Semaphore>,
            stops: Arc<AtomicU64>,
        }

        #[async_trait]
        impl Listener for SlowListener {
            async fn listen(&self, _: Vec<String>, _: JobSink) -> Result<StopFn, ListenerError> {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| ListenerError::Subscribe(e.to_string()))?;
                permit.forget();
                let stops = self.stops.clone();
                Ok(Box::new(move || {
                    stops.fetch_add(1, Ordering::SeqCst);
                }))
            }

            async fn close(&self) -> Result<(), ListenerError> {
                Ok(())
            }
        }

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let stops = Arc::new(AtomicU64::new(0));
        let engine = Engine::builder(config(2))
            .with_listener(Arc::new(SlowListener {
                gate: gate.clone(),
                stops: stops.clone(),
            }))
            .route("trips", handler_fn(|_, _| Ok(())))
            .build()
            .unwrap();

        let runner = engine.clone();
        let running = tokio::spawn(async move { runner.run().await });
        wait_until(|| engine.state() == EngineState::Running).await;

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        gate.add_permits(1);
        assert!(matches!(
            running.await.unwrap(),
            Err(EngineError::NotRunning)
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_only_ignores_schedules() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let now = chrono::NaiveDate::from_ymd_opt(2023, 9, 14)
            .unwrap()
            .and_hms_opt(2, 59, 0)
            .unwrap();

        let schedule = Schedule::from_clock(
            "rollover",
            "3:00AM",
            Duration::from_secs(30),
            action_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), ScheduleError>(())
                }
            }),
        )
        .unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::builder(config(1).with_mode(EngineMode::ConsumersOnly))
            .with_listener(broker.clone())
            .with_clock(Arc::new(incentive_core::FixedClock::new(now)))
            .with_schedule(schedule)
            .build()
            .unwrap();
        engine.run().await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        engine.stop().await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(engine.stats().schedule_runs, 0);
        assert_eq!(broker.subscriptions(), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signals_schedules_then_closes_listener_then_queue() {
        #[derive(Default)]
        struct Observed {
            schedule_shutdown: Mutex<Option<CancellationToken>>,
            sink: Mutex<Option<JobSink>>,
            at_close: Mutex<Option<(bool, bool)>>,
        }

        struct OrderListener(Arc<Observed>);

        #[async_trait]
        impl Listener for OrderListener {
            async fn listen(&self, _: Vec<String>, sink: JobSink) -> Result<StopFn, ListenerError> {
                *lock(&self.0.sink) = Some(sink);
                Ok(Box::new(|| {}))
            }

            async fn close(&self) -> Result<(), ListenerError> {
                let schedules_signalled = lock(&self.0.schedule_shutdown)
                    .as_ref()
                    .is_some_and(|t| t.is_cancelled());
                let queue_closed = lock(&self.0.sink).as_ref().is_some_and(|s| s.is_closed());
                *lock(&self.0.at_close) = Some((schedules_signalled, queue_closed));
                Ok(())
            }
        }

        let observed = Arc::new(Observed::default());
        let seen = observed.clone();
        let now = chrono::NaiveDate::from_ymd_opt(2023, 9, 14)
            .unwrap()
            .and_hms_opt(2, 59, 0)
            .unwrap();
        let schedule = Schedule::from_clock(
            "rollover",
            "3:00AM",
            Duration::from_secs(30),
            action_fn(move |ctx| {
                let seen = seen.clone();
                async move {
                    *lock(&seen.schedule_shutdown) = Some(ctx.shutdown);
                    Ok::<(), ScheduleError>(())
                }
            }),
        )
        .unwrap();

        let engine = Engine::builder(config(2))
            .with_listener(Arc::new(OrderListener(observed.clone())))
            .with_clock(Arc::new(incentive_core::FixedClock::new(now)))
            .with_schedule(schedule)
            .build()
            .unwrap();
        engine.run().await.unwrap();

        // first run at +90s
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(engine.stats().schedule_runs, 1);

        engine.stop().await.unwrap();

        assert_eq!(*lock(&observed.at_close), Some((true, false)));
        assert!(lock(&observed.sink).as_ref().is_some_and(|s| s.is_closed()));
    }
}
