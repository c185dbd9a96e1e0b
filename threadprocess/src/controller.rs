use crate::{
    channel::Channel,
    config::{Config, Isolation},
    error::{Error, Result},
    message::{Parameters, Reply, Request, Response, QUIT},
    process,
    state::{Lifecycle, MasterState, WorkerState},
    worker::{Workable, Worker},
    CorrelationId, Pid,
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle, time::Instant};

// Completes once the worker has finished: the blocking task running the
// control loop, or the task collecting a child process' replies.
type WorkerHandle = JoinHandle<()>;

/// Caller side handle of a single supervised worker.
///
/// Requests go out through [`Controller::submit`] and never wait on the
/// worker. Responses come back through [`Controller::await_response`],
/// either in FIFO order or picked out by correlation id while leaving every
/// other pending response in place.
#[derive(Debug)]
pub struct Controller {
    id: Pid,
    isolation: Isolation,

    // Sole producer of requests, sole consumer of replies.
    requests: Arc<Channel<Request>>,
    replies: Arc<Channel<Reply>>,

    // Shared with the worker thread, or mirrored from the reply stream when
    // the worker is a process.
    lifecycle: Arc<Lifecycle>,

    // What the caller has observed so far.
    master: watch::Sender<MasterState>,

    handle: Mutex<Option<WorkerHandle>>,
}

impl Controller {
    /// Start a fresh `W::default()` worker using `config.isolation`, and wait
    /// for its startup hook to report back.
    ///
    /// A failed startup still returns a controller unless
    /// `config.strict_startup` is set. Its [`Controller::state`] reports the
    /// failure and every [`Controller::submit`] is rejected.
    pub async fn start<W: Workable + Default>(config: Config) -> Result<Self> {
        config.validate()?;

        match config.isolation {
            Isolation::Thread => Self::start_thread(W::default(), config).await,
            Isolation::Process => Self::start_process::<W>(config).await,
        }
    }

    /// Start an already constructed worker. Only thread isolation can move a
    /// value into the worker, so anything else is an invalid configuration.
    pub async fn start_with<W: Workable>(worker: W, config: Config) -> Result<Self> {
        config.validate()?;

        if config.isolation != Isolation::Thread {
            return Err(Error::InvalidConfiguration(format!(
                "a constructed worker cannot cross into {} isolation, use `Controller::start`",
                config.isolation
            )));
        }

        Self::start_thread(worker, config).await
    }

    fn new(isolation: Isolation) -> Self {
        let (master, _) = watch::channel(MasterState::Running);

        Self {
            id: uuid::Uuid::new_v4(),
            isolation,
            requests: Arc::new(Channel::new()),
            replies: Arc::new(Channel::new()),
            lifecycle: Arc::new(Lifecycle::new()),
            master,
            handle: Mutex::new(None),
        }
    }

    async fn start_thread<W: Workable>(workable: W, config: Config) -> Result<Self> {
        let controller = Self::new(Isolation::Thread);
        controller.advance(WorkerState::Starting);

        let worker = Worker::new(
            controller.id,
            Isolation::Thread,
            workable,
            Arc::clone(&controller.requests),
            Arc::clone(&controller.replies),
            Arc::clone(&controller.lifecycle),
            config.loop_period,
        );

        let startup_args = config.startup_args;
        let handle = tokio::task::spawn_blocking(move || {
            worker.run(startup_args);
        });
        controller.set_handle(handle);

        controller.handshake(config.strict_startup).await
    }

    async fn start_process<W: Workable>(config: Config) -> Result<Self> {
        let controller = Self::new(Isolation::Process);
        controller.advance(WorkerState::Starting);

        let handle = process::spawn::<W>(
            &config,
            controller.id,
            Arc::clone(&controller.requests),
            Arc::clone(&controller.replies),
            Arc::clone(&controller.lifecycle),
        )
        .await
        .inspect_err(|e| {
            tracing::error!(kind = e.as_label(), "failed to spawn worker process: {e}");
        })?;
        controller.set_handle(handle);

        controller.handshake(config.strict_startup).await
    }

    // Block on exactly one lifecycle signal.
    #[tracing::instrument(skip_all, fields(worker_id = %self.id, isolation = %self.isolation))]
    async fn handshake(self, strict: bool) -> Result<Self> {
        let signal = self.replies.recv(None).await;

        let message = match signal {
            Ok(Reply::Started) => {
                tracing::info!("worker started");
                return Ok(self);
            }
            Ok(Reply::StartupError { message }) => message,
            Ok(Reply::Response(response)) => format!(
                "worker replied to {} before signalling startup",
                response.correlation_id
            ),
            Err(_) => "worker exited before signalling startup".to_string(),
        };

        tracing::error!("worker failed to start: {message}");

        if strict {
            self.join().await;
            return Err(Error::Startup { message });
        }

        Ok(self)
    }

    pub fn id(&self) -> Pid {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Worker lifecycle as last published. In process isolation only the
    /// transitions visible from the reply stream are tracked.
    pub fn state(&self) -> WorkerState {
        self.lifecycle.current()
    }

    pub fn master_state(&self) -> MasterState {
        *self.master.borrow()
    }

    /// Responses waiting to be picked up.
    pub fn pending_responses(&self) -> usize {
        self.replies.len()
    }

    /// Enqueue a request and return its correlation id right away.
    ///
    /// With `respond` unset the worker handles the request but never answers
    /// it. Submitting [`QUIT`] is equivalent to a non-blocking
    /// [`Controller::shutdown`].
    pub fn submit(
        &self,
        command: impl Into<String>,
        parameters: Parameters,
        respond: bool,
    ) -> Result<CorrelationId> {
        if self.master_state() != MasterState::Running {
            return Err(Error::ShuttingDown);
        }

        let state = self.state();
        if state.is_terminal() {
            return Err(Error::Unavailable(state));
        }

        let request = Request::new(command, parameters, respond);
        let correlation_id = request.correlation_id;
        let quit = request.is_quit();

        if self.requests.send(request).is_err() {
            return Err(Error::Unavailable(self.state()));
        }

        if quit {
            self.master.send_replace(MasterState::Quitting);
        }

        tracing::trace!(worker_id = %self.id, %correlation_id, "request submitted");

        Ok(correlation_id)
    }

    /// Wait for a response.
    ///
    /// Without `correlation_id` this is the next response in FIFO order.
    /// With one, the response channel is scanned for that id and every other
    /// response is left where it was. `timeout` bounds the wait and yields
    /// [`Error::Timeout`]; it does not cancel anything on the worker side.
    /// Once the worker has finished and nothing matching is left, a bounded
    /// wait reports [`Error::Timeout`] right away and an unbounded one
    /// [`Error::Closed`] instead of waiting forever.
    pub async fn await_response(
        &self,
        correlation_id: Option<CorrelationId>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        // A limit too far out to be represented waits without a deadline.
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));

        loop {
            let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));

            let received = match correlation_id {
                None => self.replies.recv(remaining).await,
                Some(id) => {
                    self.replies
                        .take_where(
                            |reply| matches!(reply, Reply::Response(r) if r.correlation_id == id),
                            remaining,
                        )
                        .await
                }
            };

            let reply = match (received, timeout) {
                (Ok(reply), _) => reply,
                // Report the caller's timeout, not whatever was left of it.
                (Err(_), Some(limit)) => return Err(Error::Timeout(limit)),
                (Err(_), None) => return Err(Error::Closed),
            };

            match reply {
                Reply::Response(response) => {
                    if response.is_quit() {
                        self.master.send_replace(MasterState::Finished);
                    }
                    return Ok(response);
                }
                signal => tracing::warn!("ignoring late lifecycle signal {signal:?}"),
            }
        }
    }

    /// Ask the worker to quit once everything queued before has been
    /// handled. With `blocking` set, wait for the quit acknowledgment and
    /// for the worker to finish.
    ///
    /// Responses still pending stay retrievable after shutdown.
    #[tracing::instrument(skip(self), fields(worker_id = %self.id))]
    pub async fn shutdown(&self, blocking: bool) -> Result<()> {
        let quit = match self.submit(QUIT, Parameters::new(), true) {
            Ok(id) => Some(id),
            Err(Error::ShuttingDown) => {
                tracing::debug!("quit already submitted");
                None
            }
            Err(Error::Unavailable(state)) => {
                tracing::debug!("worker already {state}");
                None
            }
            Err(e) => return Err(e),
        };

        if !blocking {
            return Ok(());
        }

        if let Some(id) = quit {
            match self.await_response(Some(id), None).await {
                // Closed: the acknowledgment went to another waiter, or the
                // worker finished without producing one.
                Ok(_) | Err(Error::Closed) => {}
                Err(e) => {
                    tracing::error!(kind = e.as_label(), "no quit acknowledgment: {e}");
                    return Err(e);
                }
            }
        }

        self.join().await;
        self.master.send_replace(MasterState::Finished);
        tracing::info!("worker shut down");

        Ok(())
    }

    async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("worker task failed: {e}");
            }
        }
    }

    fn set_handle(&self, handle: WorkerHandle) {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn advance(&self, next: WorkerState) {
        if let Err(e) = self.lifecycle.advance(next) {
            tracing::error!("{e}");
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Let a worker nobody shut down still run its cleanup.
        if self.master_state() == MasterState::Running && !self.state().is_terminal() {
            let _ = self.requests.send(Request::quit(false));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Echo {
        cleanups: Option<Arc<AtomicUsize>>,
    }

    impl Workable for Echo {
        type Error = String;

        fn handle(
            &mut self,
            command: &str,
            _correlation_id: CorrelationId,
            parameters: Parameters,
        ) -> std::result::Result<Value, String> {
            match command {
                "echo" => Ok(parameters.get("value").cloned().unwrap_or(Value::Null)),
                "noop" => Ok(Value::Null),
                "sleep" => {
                    let millis = parameters.get("millis").and_then(Value::as_u64).unwrap_or(0);
                    std::thread::sleep(Duration::from_millis(millis));
                    Ok(json!(millis))
                }
                "fail" => Err("requested failure".to_string()),
                other => Err(format!("unknown command `{other}`")),
            }
        }

        fn cleanup(&mut self) -> std::result::Result<(), String> {
            if let Some(counter) = &self.cleanups {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Broken;

    impl Workable for Broken {
        type Error = String;

        fn startup(&mut self, _args: &Parameters) -> std::result::Result<(), String> {
            Err("cannot open file".to_string())
        }

        fn handle(
            &mut self,
            _command: &str,
            _correlation_id: CorrelationId,
            _parameters: Parameters,
        ) -> std::result::Result<Value, String> {
            Ok(json!("unreachable"))
        }
    }

    fn config() -> Config {
        Config::default().with_loop_period(Duration::from_millis(1))
    }

    fn value(value: Value) -> Parameters {
        let mut parameters = Parameters::new();
        parameters.insert("value".to_string(), value);
        parameters
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    #[tokio::test]
    async fn echo_round_trip() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();
        assert!(!controller.state().is_terminal());

        let id = controller.submit("echo", value(json!(42)), true).unwrap();
        let response = controller.await_response(None, WAIT).await.unwrap();

        assert_eq!(response.command, "echo");
        assert_eq!(response.correlation_id, id);
        assert!(response.success);
        assert_eq!(response.result, Some(json!(42)));

        controller.shutdown(true).await.unwrap();
        assert_eq!(controller.state(), WorkerState::Finished);
        assert_eq!(controller.master_state(), MasterState::Finished);
    }

    #[tokio::test]
    async fn responses_keep_submission_order() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        let ids: Vec<_> = (0..10)
            .map(|i| controller.submit("echo", value(json!(i)), true).unwrap())
            .collect();

        for (i, id) in ids.into_iter().enumerate() {
            let response = controller.await_response(None, WAIT).await.unwrap();
            assert_eq!(response.correlation_id, id);
            assert_eq!(response.result, Some(json!(i)));
        }

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn retrieval_by_id_leaves_the_others() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        let first = controller.submit("echo", value(json!(1)), true).unwrap();
        let second = controller.submit("echo", value(json!(2)), true).unwrap();
        let third = controller.submit("echo", value(json!(3)), true).unwrap();

        // Wait until all three are queued so the scan has something to skip.
        let last = controller.await_response(Some(third), WAIT).await.unwrap();
        assert_eq!(last.result, Some(json!(3)));

        let picked = controller.await_response(Some(second), WAIT).await.unwrap();
        assert_eq!(picked.result, Some(json!(2)));

        let rest = controller.await_response(None, WAIT).await.unwrap();
        assert_eq!(rest.correlation_id, first);
        assert_eq!(controller.pending_responses(), 0);

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_never_answers() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        let silent = controller.submit("echo", value(json!("quiet")), false).unwrap();
        let loud = controller.submit("echo", value(json!("loud")), true).unwrap();

        let response = controller.await_response(None, WAIT).await.unwrap();
        assert_eq!(response.correlation_id, loud);

        let missing = controller
            .await_response(Some(silent), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(missing, Err(Error::Timeout(_))));

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_loop() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        controller.submit("fail", Parameters::new(), true).unwrap();
        controller.submit("echo", value(json!("after")), true).unwrap();

        let failed = controller.await_response(None, WAIT).await.unwrap();
        assert_eq!(failed.command, "fail");
        assert!(!failed.success);
        assert_eq!(failed.result, None);

        let next = controller.await_response(None, WAIT).await.unwrap();
        assert!(next.success);
        assert_eq!(next.result, Some(json!("after")));

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_behind_queued_work() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        for _ in 0..100 {
            controller.submit("noop", Parameters::new(), false).unwrap();
        }
        let done = controller.submit("echo", value(json!("done")), true).unwrap();

        controller.shutdown(true).await.unwrap();

        // The echo was answered before the quit and is still waiting for us.
        let response = controller.await_response(None, WAIT).await.unwrap();
        assert_eq!(response.correlation_id, done);
        assert_eq!(response.result, Some(json!("done")));

        assert!(matches!(controller.await_response(None, None).await, Err(Error::Closed)));
        assert!(matches!(
            controller.submit("echo", Parameters::new(), true),
            Err(Error::ShuttingDown)
        ));
    }

    fn dies_after_bootstrap(config: Config) -> Config {
        config.with_isolation(Isolation::Process).with_program(
            "sh",
            vec!["-c".to_string(), "read bootstrap; exit 3".to_string()],
        )
    }

    #[tokio::test]
    async fn process_exiting_before_signalling_never_starts() {
        let controller = Controller::start::<Echo>(dies_after_bootstrap(config()))
            .await
            .unwrap();
        assert_eq!(controller.state(), WorkerState::Finished);
        assert!(matches!(
            controller.submit("echo", Parameters::new(), true),
            Err(Error::Unavailable(WorkerState::Finished))
        ));

        let strict =
            Controller::start::<Echo>(dies_after_bootstrap(config()).with_strict_startup(true))
                .await;
        assert!(matches!(strict, Err(Error::Startup { message }) if message.contains("exited")));
    }

    #[tokio::test]
    async fn unrepresentable_timeout_waits_for_the_response() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        let mut parameters = Parameters::new();
        parameters.insert("millis".to_string(), json!(50));
        let id = controller.submit("sleep", parameters, true).unwrap();

        let response = controller
            .await_response(Some(id), Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(response.correlation_id, id);

        controller.submit("echo", value(json!("next")), true).unwrap();
        let next = controller
            .await_response(None, Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(next.result, Some(json!("next")));

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn slow_request_is_not_cancelled_by_a_timeout() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        let mut parameters = Parameters::new();
        parameters.insert("millis".to_string(), json!(100));
        let id = controller.submit("sleep", parameters, true).unwrap();

        let early = controller
            .await_response(Some(id), Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(early, Err(Error::Timeout(limit)) if limit == Duration::from_millis(10)));

        let late = controller.await_response(Some(id), WAIT).await.unwrap();
        assert_eq!(late.result, Some(json!(100)));

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn non_blocking_shutdown_then_ack() {
        let controller = Controller::start::<Echo>(config()).await.unwrap();

        controller.shutdown(false).await.unwrap();
        assert_eq!(controller.master_state(), MasterState::Quitting);

        let ack = controller.await_response(None, WAIT).await.unwrap();
        assert!(ack.is_quit());
        assert_eq!(controller.master_state(), MasterState::Finished);

        // A second, blocking shutdown only waits for the worker to finish.
        controller.shutdown(true).await.unwrap();
        assert_eq!(controller.state(), WorkerState::Finished);
    }

    #[tokio::test]
    async fn startup_failure_leaves_an_unusable_controller() {
        let controller = Controller::start::<Broken>(config()).await.unwrap();

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            controller.lifecycle.wait_for(|state| state == WorkerState::Finished),
        )
        .await
        .unwrap();
        assert_eq!(state, WorkerState::Finished);

        assert!(matches!(
            controller.submit("echo", value(json!(1)), true),
            Err(Error::Unavailable(WorkerState::Finished))
        ));

        let nothing = controller
            .await_response(None, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(nothing, Err(Error::Timeout(_))));

        controller.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn strict_startup_fails_the_constructor() {
        let result = Controller::start::<Broken>(config().with_strict_startup(true)).await;

        match result {
            Err(Error::Startup { message }) => assert_eq!(message, "cannot open file"),
            other => panic!("expected a startup error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_with_rejects_process_isolation() {
        let result = Controller::start_with(
            Echo::default(),
            config().with_isolation(Isolation::Process),
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn dropping_the_controller_still_cleans_up() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let worker = Echo {
            cleanups: Some(Arc::clone(&cleanups)),
        };

        let controller = Controller::start_with(worker, config()).await.unwrap();
        let lifecycle = Arc::clone(&controller.lifecycle);
        drop(controller);

        tokio::time::timeout(
            Duration::from_secs(5),
            lifecycle.wait_for(|state| state == WorkerState::Finished),
        )
        .await
        .unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_scans_do_not_lose_responses() {
        let controller = Arc::new(Controller::start::<Echo>(config()).await.unwrap());

        let ids: Vec<_> = (0..20)
            .map(|i| controller.submit("echo", value(json!(i)), true).unwrap())
            .collect();

        let waiters: Vec<_> = ids
            .iter()
            .rev()
            .map(|&id| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move { controller.await_response(Some(id), WAIT).await })
            })
            .collect();

        for (waiter, id) in waiters.into_iter().zip(ids.iter().rev()) {
            let response = waiter.await.unwrap().unwrap();
            assert_eq!(response.correlation_id, *id);
        }

        assert_eq!(controller.pending_responses(), 0);
        controller.shutdown(true).await.unwrap();
    }
}
