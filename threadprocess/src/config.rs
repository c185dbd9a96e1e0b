//! Construction options for a [`Controller`](crate::Controller).
//!
//! ```
//! use std::time::Duration;
//! use threadprocess::{Config, Isolation};
//!
//! let config = Config::default()
//!     .with_isolation(Isolation::Process)
//!     .with_loop_period(Duration::from_millis(1))
//!     .with_startup_arg("filename", "output.txt");
//!
//! assert_eq!(config.isolation, Isolation::Process);
//! assert_eq!(config.startup_args["filename"], "output.txt");
//! ```

use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde_json::Value;

use crate::{error::Error, message::Parameters};

pub const ENV_ISOLATION: &str = "THREADPROCESS_ISOLATION";
pub const ENV_LOOP_PERIOD_MS: &str = "THREADPROCESS_LOOP_PERIOD_MS";

/// Where the worker control loop runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isolation {
    /// A dedicated thread sharing memory with the caller.
    #[default]
    Thread,
    /// A child process talking JSON lines over its stdio.
    Process,
}

impl FromStr for Isolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Isolation::Thread),
            "process" => Ok(Isolation::Process),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown isolation `{other}`, expected `thread` or `process`"
            ))),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Thread => f.write_str("thread"),
            Isolation::Process => f.write_str("process"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub isolation: Isolation,
    /// Target duration of one idle iteration of the worker loop. Bounds the
    /// latency between a submit and the worker picking the request up.
    pub loop_period: Duration,
    /// Forwarded verbatim to the worker's startup hook.
    pub startup_args: Parameters,
    /// Fail `start` with [`Error::Startup`] instead of handing back a
    /// controller whose worker never started.
    pub strict_startup: bool,
    /// Executable re-run as the worker in process isolation. Defaults to the
    /// current executable.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            isolation: Isolation::Thread,
            loop_period: Duration::from_millis(10),
            startup_args: Parameters::new(),
            strict_startup: false,
            program: None,
            args: Vec::new(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `THREADPROCESS_ISOLATION` and
    /// `THREADPROCESS_LOOP_PERIOD_MS` when they are set.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(isolation) = env::var(ENV_ISOLATION) {
            config.isolation = isolation.parse()?;
        }

        if let Ok(period) = env::var(ENV_LOOP_PERIOD_MS) {
            let millis: u64 = period.trim().parse().map_err(|_| {
                Error::InvalidConfiguration(format!(
                    "{ENV_LOOP_PERIOD_MS} must be a whole number of milliseconds, got `{period}`"
                ))
            })?;
            config.loop_period = Duration::from_millis(millis);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub fn with_loop_period(mut self, loop_period: Duration) -> Self {
        self.loop_period = loop_period;
        self
    }

    #[must_use]
    pub fn with_startup_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.startup_args.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_strict_startup(mut self, strict: bool) -> Self {
        self.strict_startup = strict;
        self
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = Some(program.into());
        self.args = args;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.loop_period.is_zero() {
            return Err(Error::InvalidConfiguration(
                "loop period must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn isolation_parses_case_insensitively() {
        assert_eq!("thread".parse::<Isolation>().unwrap(), Isolation::Thread);
        assert_eq!(" Process ".parse::<Isolation>().unwrap(), Isolation::Process);
    }

    #[test]
    fn unknown_isolation_is_invalid_configuration() {
        let err = "fiber".parse::<Isolation>().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(err.to_string().contains("fiber"));
    }

    // The only test touching these variables, so nothing races on them.
    #[test]
    fn from_env_overrides_and_rejects() {
        env::set_var(ENV_ISOLATION, "process");
        env::set_var(ENV_LOOP_PERIOD_MS, "25");
        let config = Config::from_env().unwrap();
        assert_eq!(config.isolation, Isolation::Process);
        assert_eq!(config.loop_period, Duration::from_millis(25));

        env::set_var(ENV_ISOLATION, "green-thread");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(err.to_string().contains("green-thread"));

        env::set_var(ENV_ISOLATION, "thread");
        env::set_var(ENV_LOOP_PERIOD_MS, "soon");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(err.to_string().contains(ENV_LOOP_PERIOD_MS));

        env::remove_var(ENV_ISOLATION);
        env::remove_var(ENV_LOOP_PERIOD_MS);
        let config = Config::from_env().unwrap();
        assert_eq!(config.isolation, Isolation::Thread);
        assert_eq!(config.loop_period, Duration::from_millis(10));
    }

    #[test]
    fn zero_loop_period_is_rejected() {
        let config = Config::default().with_loop_period(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
        assert!(Config::default().validate().is_ok());
    }
}
