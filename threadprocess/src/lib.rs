//! A supervised worker: one long-lived [`Workable`] running on its own
//! thread or in its own process, reachable only through a request channel
//! and a response channel.
//!
//! ```
//! use std::time::Duration;
//!
//! use serde_json::{json, Value};
//! use threadprocess::{Config, Controller, CorrelationId, Parameters, Workable};
//!
//! #[derive(Debug, Default)]
//! struct Echo;
//!
//! impl Workable for Echo {
//!     type Error = String;
//!
//!     fn handle(
//!         &mut self,
//!         command: &str,
//!         _correlation_id: CorrelationId,
//!         parameters: Parameters,
//!     ) -> Result<Value, String> {
//!         match command {
//!             "echo" => Ok(parameters.get("value").cloned().unwrap_or(Value::Null)),
//!             other => Err(format!("unknown command `{other}`")),
//!         }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> threadprocess::Result<()> {
//! let controller = Controller::start::<Echo>(Config::default()).await?;
//!
//! let mut parameters = Parameters::new();
//! parameters.insert("value".to_string(), json!(42));
//! let id = controller.submit("echo", parameters, true)?;
//!
//! let response = controller
//!     .await_response(Some(id), Some(Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(response.result, Some(json!(42)));
//!
//! controller.shutdown(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod process;
pub mod state;
pub mod worker;

pub use crate::{
    config::{Config, Isolation},
    controller::Controller,
    error::{Error, Result},
    message::{Parameters, Reply, Request, Response, QUIT},
    process::worker_main,
    state::{MasterState, WorkerState},
    worker::Workable,
};

// NOTE(jdb): Identifies a worker in logs and on the wire. Kept as an alias
// so a networked worker could later be addressed by something else.
pub type Pid = uuid::Uuid;

/// Links a [`Request`] to its [`Response`]. Unique across every request
/// submitted to one worker.
pub type CorrelationId = uuid::Uuid;
