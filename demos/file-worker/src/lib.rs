//! A worker owning one open file. The file is opened by the startup hook
//! from the `filename` and `mode` startup arguments and closed on cleanup;
//! nothing outside the worker ever touches it.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
};

use serde_json::{json, Value};
use threadprocess::{CorrelationId, Parameters, Workable};

#[derive(Debug, thiserror::Error)]
pub enum FileWorkerError {
    #[error("missing string startup argument or parameter `{0}`")]
    Missing(&'static str),
    #[error("unsupported file mode `{0}`, expected `r`, `w` or `a`")]
    Mode(String),
    #[error("no file is open")]
    NotOpen,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

type Handler = fn(&mut File, &Parameters) -> Result<Value, FileWorkerError>;

#[derive(Debug)]
pub struct FileWorker {
    file: Option<File>,
    handlers: HashMap<&'static str, Handler>,
}

impl Default for FileWorker {
    fn default() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("write_line", write_line);
        handlers.insert("write_line_backwards", write_line_backwards);
        handlers.insert("readlines", readlines);

        Self {
            file: None,
            handlers,
        }
    }
}

impl Workable for FileWorker {
    type Error = FileWorkerError;

    fn startup(&mut self, args: &Parameters) -> Result<(), Self::Error> {
        let filename = string(args, "filename")?;
        let mode = string(args, "mode")?;

        let file = match mode {
            "r" => OpenOptions::new().read(true).open(filename)?,
            "w" => OpenOptions::new().write(true).create(true).truncate(true).open(filename)?,
            "a" => OpenOptions::new().append(true).create(true).open(filename)?,
            other => return Err(FileWorkerError::Mode(other.to_string())),
        };

        tracing::debug!("opened {filename} with mode {mode}");
        self.file = Some(file);

        Ok(())
    }

    fn handle(
        &mut self,
        command: &str,
        _correlation_id: CorrelationId,
        parameters: Parameters,
    ) -> Result<Value, Self::Error> {
        let handler = self
            .handlers
            .get(command)
            .ok_or_else(|| FileWorkerError::UnknownCommand(command.to_string()))?;
        let file = self.file.as_mut().ok_or(FileWorkerError::NotOpen)?;

        handler(file, &parameters)
    }

    fn cleanup(&mut self) -> Result<(), Self::Error> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        Ok(())
    }
}

fn string<'a>(parameters: &'a Parameters, key: &'static str) -> Result<&'a str, FileWorkerError> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .ok_or(FileWorkerError::Missing(key))
}

fn write_line(file: &mut File, parameters: &Parameters) -> Result<Value, FileWorkerError> {
    let message = string(parameters, "message")?;
    writeln!(file, "{message}")?;

    Ok(json!(format!("Line written successfully {message}")))
}

fn write_line_backwards(file: &mut File, parameters: &Parameters) -> Result<Value, FileWorkerError> {
    let backwards: String = string(parameters, "message")?.chars().rev().collect();
    writeln!(file, "{backwards}")?;

    Ok(json!(format!("Line written backwards successfully {backwards}")))
}

// Lines from the current position to the end of the file.
fn readlines(file: &mut File, _parameters: &Parameters) -> Result<Value, FileWorkerError> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    Ok(json!(contents.lines().collect::<Vec<_>>()))
}
