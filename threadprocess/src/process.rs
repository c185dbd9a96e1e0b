//! Process isolation.
//!
//! The worker runs in a child process: by default the current executable
//! re-run with [`WORKER_ENV`] set to the worker's type name. Such a binary
//! has to call [`worker_main`] first thing in `main`:
//!
//! ```no_run
//! # use threadprocess::{CorrelationId, Parameters, Workable};
//! # #[derive(Default)]
//! # struct Echo;
//! # impl Workable for Echo {
//! #     type Error = String;
//! #     fn handle(&mut self, _: &str, _: CorrelationId, p: Parameters) -> Result<serde_json::Value, String> {
//! #         Ok(p.into())
//! #     }
//! # }
//! fn main() {
//!     if let Some(code) = threadprocess::worker_main::<Echo>() {
//!         std::process::exit(code);
//!     }
//!
//!     // parent logic, e.g. `Controller::start::<Echo>(config)`
//! }
//! ```
//!
//! Parent and child talk newline delimited JSON over the child's stdio. The
//! first line the parent writes is a [`Bootstrap`], every following one a
//! [`Request`]. The child answers with [`Reply`] lines. Stdout therefore
//! belongs to the protocol inside the child; log to stderr instead. Lines the
//! parent cannot decode are logged and skipped.

use std::{
    any::type_name,
    env,
    io::{self, BufRead, Write},
    process::Stdio,
    sync::Arc,
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};

use crate::{
    channel::Channel,
    config::{Config, Isolation},
    error::{Error, Result},
    message::{Parameters, Reply, Request},
    state::{Lifecycle, WorkerState},
    worker::{Outbox, Workable, Worker},
    Pid,
};

/// Marks a child process as a worker. Holds the worker's type name.
pub const WORKER_ENV: &str = "THREADPROCESS_WORKER";

/// First line sent to a child process, carrying what a thread-isolated
/// worker would have received in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    pub worker_id: Pid,
    pub loop_period: Duration,
    pub startup_args: Parameters,
}

/// Spawn the worker process and the two tasks shuttling requests and replies
/// between the channels and its stdio. The returned handle completes once the
/// child has exited and `lifecycle` reached `Finished`.
pub(crate) async fn spawn<W: Workable>(
    config: &Config,
    worker_id: Pid,
    requests: Arc<Channel<Request>>,
    replies: Arc<Channel<Reply>>,
    lifecycle: Arc<Lifecycle>,
) -> Result<JoinHandle<()>> {
    let program = match &config.program {
        Some(program) => program.clone(),
        None => env::current_exe().map_err(Error::Spawn)?,
    };

    let mut child = Command::new(&program)
        .args(&config.args)
        .env(WORKER_ENV, type_name::<W>())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(Error::Spawn)?;

    tracing::debug!(
        "spawned worker process {pid:?} from {program}",
        pid = child.id(),
        program = program.display()
    );

    let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(Error::Spawn(io::Error::other("worker process stdio was not captured")));
    };

    let bootstrap = Bootstrap {
        worker_id,
        loop_period: config.loop_period,
        startup_args: config.startup_args.clone(),
    };
    write_line(&mut stdin, &bootstrap).await?;

    tokio::spawn(forward_requests(stdin, Arc::clone(&requests)));

    Ok(tokio::spawn(collect_replies(
        child, stdout, replies, requests, lifecycle,
    )))
}

async fn write_line<T: Serialize>(stdin: &mut ChildStdin, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    stdin.write_all(&line).await?;
    stdin.flush().await?;

    Ok(())
}

// Dropping stdin on the way out lets the child see EOF.
async fn forward_requests(mut stdin: ChildStdin, requests: Arc<Channel<Request>>) {
    while let Ok(request) = requests.recv(None).await {
        let quit = request.is_quit();

        if let Err(e) = write_line(&mut stdin, &request).await {
            tracing::error!("failed to forward request to worker process: {e}");
            requests.close();
            break;
        }

        if quit {
            requests.close();
            break;
        }
    }
}

async fn collect_replies(
    mut child: Child,
    stdout: ChildStdout,
    replies: Arc<Channel<Reply>>,
    requests: Arc<Channel<Request>>,
    lifecycle: Arc<Lifecycle>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<Reply>(&line) {
                Ok(reply) => {
                    mirror(&lifecycle, &reply);
                    if replies.send(reply).is_err() {
                        tracing::warn!("response channel closed, dropping reply");
                    }
                }
                Err(e) => tracing::warn!("skipping undecodable line from worker process: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::error!("failed to read from worker process: {e}");
                break;
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => tracing::debug!("worker process exited"),
        Ok(status) => tracing::warn!("worker process exited with {status}"),
        Err(e) => tracing::error!("failed to wait on worker process: {e}"),
    }

    requests.close();

    // A child that died before signalling never got to start.
    if lifecycle.current() == WorkerState::Starting {
        if let Err(e) = lifecycle.advance(WorkerState::StartupError) {
            tracing::error!("{e}");
        }
    }
    if let Err(e) = lifecycle.advance(WorkerState::Finished) {
        tracing::error!("{e}");
    }

    replies.close();
}

// The child's own state never crosses the boundary; the parent only learns
// what the reply stream tells it.
fn mirror(lifecycle: &Lifecycle, reply: &Reply) {
    let next = match reply {
        Reply::Started => WorkerState::Started,
        Reply::StartupError { .. } => WorkerState::StartupError,
        Reply::Response(response) if response.is_quit() => WorkerState::Quitting,
        Reply::Response(_) => return,
    };

    if let Err(e) = lifecycle.advance(next) {
        tracing::warn!("{e}");
    }
}

/// Child side entry point. Returns `None` when the current process is not a
/// worker for `W`, otherwise runs the worker to completion and returns the
/// exit code the process should use.
#[must_use]
pub fn worker_main<W: Workable + Default>() -> Option<i32> {
    match env::var(WORKER_ENV) {
        Ok(name) if name == type_name::<W>() => Some(run_child(W::default())),
        _ => None,
    }
}

fn run_child<W: Workable>(workable: W) -> i32 {
    let mut first = String::new();
    let bootstrap = match io::stdin().read_line(&mut first) {
        Ok(0) => {
            tracing::error!("worker process got no bootstrap line");
            return 2;
        }
        Ok(_) => match serde_json::from_str::<Bootstrap>(&first) {
            Ok(bootstrap) => bootstrap,
            Err(e) => {
                tracing::error!("invalid bootstrap line: {e}");
                return 2;
            }
        },
        Err(e) => {
            tracing::error!("failed to read bootstrap line: {e}");
            return 2;
        }
    };

    let requests = Arc::new(Channel::new());
    let lifecycle = Arc::new(Lifecycle::new());
    if let Err(e) = lifecycle.advance(WorkerState::Starting) {
        tracing::error!("{e}");
    }

    let feeder = Arc::clone(&requests);
    thread::spawn(move || read_requests(&feeder));

    let worker = Worker::new(
        bootstrap.worker_id,
        Isolation::Process,
        workable,
        requests,
        StdoutOutbox,
        lifecycle,
        bootstrap.loop_period,
    );

    match worker.run(bootstrap.startup_args) {
        WorkerState::StartupError => 1,
        _ => 0,
    }
}

// Stdin EOF means the parent is gone or done with us: queue a quiet quit so
// the worker still runs its cleanup.
fn read_requests(requests: &Channel<Request>) {
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("failed to read request: {e}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                if requests.send(request).is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("skipping undecodable request: {e}"),
        }
    }

    let _ = requests.send(Request::quit(false));
}

#[derive(Debug, Clone, Copy)]
struct StdoutOutbox;

impl Outbox for StdoutOutbox {
    fn reply(&self, reply: Reply) {
        let line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("failed to encode reply: {e}");
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
            tracing::error!("failed to write reply: {e}");
        }
    }
}
