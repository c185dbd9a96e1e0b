use std::{
    any::Any,
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde_json::Value;

use crate::{
    channel::{error::TryRecvError, Channel},
    config::Isolation,
    message::{Parameters, Reply, Request, Response},
    state::{Lifecycle, WorkerState},
    CorrelationId, Pid,
};

/// The long-lived state living inside the worker's thread or process, and
/// the hooks the control loop drives it through.
///
/// Only [`Workable::handle`] is required. A failing (or panicking) hook never
/// takes the loop down: startup failures stop the worker before it serves a
/// single request, handler failures turn into `success = false` responses and
/// cleanup failures are logged.
///
/// A handler that never returns stalls the worker for good. Nothing preempts
/// it, and a quit queued behind it waits as well.
pub trait Workable: Send + 'static {
    type Error: Display;

    fn startup(&mut self, args: &Parameters) -> Result<(), Self::Error> {
        let _ = args;
        Ok(())
    }

    fn handle(
        &mut self,
        command: &str,
        correlation_id: CorrelationId,
        parameters: Parameters,
    ) -> Result<Value, Self::Error>;

    fn cleanup(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Runs at the start of every loop iteration.
    fn before_iteration(&mut self) {}

    /// Runs on iterations that found no request, before the loop sleeps.
    fn on_idle(&mut self) {}

    /// Runs at the end of every loop iteration except the one that quits.
    fn after_iteration(&mut self) {}
}

/// Where the worker pushes its replies: the shared response channel when
/// running as a thread, stdout when running as a child process.
pub trait Outbox: Send + Sync {
    fn reply(&self, reply: Reply);

    /// Nothing else will be replied after this.
    fn close(&self) {}
}

impl Outbox for Channel<Reply> {
    fn reply(&self, reply: Reply) {
        if self.send(reply).is_err() {
            tracing::warn!("response channel closed, dropping reply");
        }
    }

    fn close(&self) {
        Channel::close(self);
    }
}

impl<O: Outbox + ?Sized> Outbox for Arc<O> {
    fn reply(&self, reply: Reply) {
        (**self).reply(reply);
    }

    fn close(&self) {
        (**self).close();
    }
}

/// Drives one [`Workable`] from startup to cleanup.
pub struct Worker<W: Workable, O: Outbox> {
    pid: Pid,
    isolation: Isolation,
    workable: W,
    requests: Arc<Channel<Request>>,
    outbox: O,
    lifecycle: Arc<Lifecycle>,
    loop_period: Duration,
}

impl<W: Workable, O: Outbox> Worker<W, O> {
    pub fn new(
        pid: Pid,
        isolation: Isolation,
        workable: W,
        requests: Arc<Channel<Request>>,
        outbox: O,
        lifecycle: Arc<Lifecycle>,
        loop_period: Duration,
    ) -> Self {
        Self {
            pid,
            isolation,
            workable,
            requests,
            outbox,
            lifecycle,
            loop_period,
        }
    }

    /// Run the whole lifecycle on the calling thread. Returns `StartupError`
    /// when the startup hook failed and `Finished` otherwise.
    #[tracing::instrument(
        name = "worker",
        skip_all,
        fields(worker_id = %self.pid, isolation = %self.isolation)
    )]
    pub fn run(mut self, startup_args: Parameters) -> WorkerState {
        // Lifecycle signals are published after the state so that whoever
        // reads the signal also observes the state behind it.
        let (outcome, quit) = match self.guarded(|w| w.startup(&startup_args)) {
            Ok(()) => {
                self.advance(WorkerState::Started);
                self.outbox.reply(Reply::Started);
                tracing::debug!("worker started");

                (WorkerState::Finished, self.serve())
            }
            Err(message) => {
                tracing::error!("error in startup of worker: {message}");
                self.advance(WorkerState::StartupError);
                self.outbox.reply(Reply::StartupError { message });
                self.requests.close();

                (WorkerState::StartupError, None)
            }
        };

        if let Err(message) = self.guarded(W::cleanup) {
            tracing::error!("error in cleanup of worker: {message}");
        }

        if let Some(quit) = quit.filter(|quit| quit.respond) {
            self.outbox.reply(Reply::Response(Response::quit_ack(quit.correlation_id)));
        }

        self.advance(WorkerState::Finished);
        self.outbox.close();
        tracing::debug!("worker finished");

        outcome
    }

    // Returns the quit request that ended the loop, if any.
    fn serve(&mut self) -> Option<Request> {
        let mut pacer = Pacer::new(self.loop_period);

        loop {
            self.hook(W::before_iteration);

            match self.requests.try_recv() {
                Ok(request) if request.is_quit() => {
                    self.advance(WorkerState::Processing);
                    self.advance(WorkerState::Quitting);
                    self.stop_accepting();
                    return Some(request);
                }
                Ok(request) => {
                    self.advance(WorkerState::Processing);
                    self.dispatch(request);
                    pacer.mark();
                }
                Err(TryRecvError::Empty) => {
                    self.advance(WorkerState::Running);
                    self.hook(W::on_idle);
                    pacer.pace();
                }
                Err(TryRecvError::Closed) => {
                    tracing::debug!("request channel closed without a quit");
                    self.advance(WorkerState::Quitting);
                    return None;
                }
            }

            self.hook(W::after_iteration);
        }
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(command = %request.command, correlation_id = %request.correlation_id)
    )]
    fn dispatch(&mut self, request: Request) {
        let Request {
            command,
            correlation_id,
            respond,
            parameters,
        } = request;

        let response = match self.guarded(|w| w.handle(&command, correlation_id, parameters)) {
            Ok(result) => {
                tracing::trace!("request handled");
                Response::ok(command, correlation_id, result)
            }
            Err(message) => {
                tracing::error!("error handling request: {message}");
                Response::failed(command, correlation_id)
            }
        };

        if respond {
            self.outbox.reply(Reply::Response(response));
        }
    }

    // Requests queued behind the quit are never dequeued.
    fn stop_accepting(&self) {
        self.requests.close();

        let mut dropped = 0usize;
        while self.requests.try_recv().is_ok() {
            dropped += 1;
        }

        if dropped > 0 {
            tracing::warn!("dropped {dropped} request(s) queued after quit");
        }
    }

    fn advance(&self, next: WorkerState) {
        if let Err(e) = self.lifecycle.advance(next) {
            tracing::error!("{e}");
        }
    }

    fn guarded<R>(
        &mut self,
        hook: impl FnOnce(&mut W) -> Result<R, W::Error>,
    ) -> Result<R, String> {
        match panic::catch_unwind(AssertUnwindSafe(|| hook(&mut self.workable))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(panic_message(payload.as_ref())),
        }
    }

    fn hook(&mut self, hook: impl FnOnce(&mut W)) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(&mut self.workable))) {
            tracing::error!("iteration hook panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Keeps idle iterations close to the target loop period instead of
/// spinning on an empty request channel.
#[derive(Debug)]
struct Pacer {
    period: Duration,
    last: Instant,
}

impl Pacer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            last: Instant::now(),
        }
    }

    fn mark(&mut self) {
        self.last = Instant::now();
    }

    // Sleep whatever is left of the period since the previous iteration.
    fn pace(&mut self) {
        if let Some(remaining) = self.period.checked_sub(self.last.elapsed()) {
            thread::sleep(remaining);
        }
        self.mark();
    }
}
