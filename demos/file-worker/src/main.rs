use std::time::Duration;

use anyhow::Context;
use file_worker::FileWorker;
use serde_json::json;
use threadprocess::{Config, Controller, Isolation, Parameters};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    // Stdout carries the wire protocol when we are the worker process, so
    // logs go to stderr. Thread ids tell the writer's thread apart from the
    // caller's.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_ids(true))
        .with(EnvFilter::from_default_env())
        .init();

    if let Some(code) = threadprocess::worker_main::<FileWorker>() {
        std::process::exit(code);
    }

    let filename = std::env::args().nth(1).unwrap_or_else(|| "output.txt".to_string());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error building runtime")?
        .block_on(run(filename))
}

async fn run(filename: String) -> anyhow::Result<()> {
    tracing::info!("starting file-worker example...");

    let config = Config::from_env()?
        .with_startup_arg("filename", filename.clone())
        .with_loop_period(Duration::from_millis(1));

    let writer = Controller::start::<FileWorker>(config.clone().with_startup_arg("mode", "a"))
        .await
        .context("error starting writer")?;

    writer.submit("write_line", message("knock knock"), true)?;
    let response = writer.await_response(None, None).await?;
    println!("1st response: {} {} {}", response.command, response.correlation_id, response.success);

    writer.submit("write_line_backwards", message("who's there"), false)?;
    writer.shutdown(true).await?;

    let reader = Controller::start::<FileWorker>(
        config
            .with_isolation(Isolation::Process)
            .with_startup_arg("mode", "r"),
    )
    .await
    .context("error starting reader")?;

    let id = reader.submit("readlines", Parameters::new(), true)?;
    let response = reader.await_response(Some(id), None).await?;

    println!("2nd response:");
    for line in response.result.as_ref().and_then(|lines| lines.as_array()).into_iter().flatten() {
        println!("{}", line.as_str().unwrap_or_default());
    }

    reader.shutdown(true).await?;

    Ok(())
}

fn message(text: &str) -> Parameters {
    let mut parameters = Parameters::new();
    parameters.insert("message".to_string(), json!(text));
    parameters
}
