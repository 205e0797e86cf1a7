use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::error;
use tokio::signal::unix::{signal, SignalKind};

use stagehand::config::{BuildConfig, Cli};
use stagehand::errors::ExitOutcome;
use stagehand::logs::LogSink;
use stagehand::runner::BuildRunner;
use stagehand::upload::{self, HttpUploader};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = match BuildConfig::new(cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(ExitOutcome::UserError.code());
        }
    };

    // A restarted container on a host that already ran its build must not
    // run it again. Idle until the host is reclaimed.
    if cfg.completed_file.is_file() {
        loop {
            tokio::time::sleep(Duration::from_secs(9999)).await;
        }
    }

    let outcome = run(&cfg).await;
    if let Err(err) = std::fs::write(&cfg.completed_file, "finished!") {
        error!(
            "could not mark build completed at {}: {err}",
            cfg.completed_file.display()
        );
    }
    std::process::exit(outcome.code());
}

async fn run(cfg: &BuildConfig) -> ExitOutcome {
    let sink = match LogSink::open(&cfg.log_dir, cfg.max_log_size, cfg.cluster_name.clone()) {
        Ok(sink) => Arc::new(sink),
        Err(err) => {
            error!("fatal: {err}");
            return ExitOutcome::UnexpectedError;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("fatal: {err}");
            return ExitOutcome::UnexpectedError;
        }
    };

    let runner = BuildRunner::new(cfg.clone(), sink.clone());
    tokio::select! {
        outcome = runner.run() => outcome,
        _ = sigterm.recv() => {
            sink.public("Build canceled.");
            upload::deliver_logs(&HttpUploader::new(), cfg, &sink).await;
            ExitOutcome::Canceled
        }
    }
}
