//! `stepwise worker`: the retry poller as a foreground process.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use console::style;
use stepwise_core::engine::poller::RetryPoller;
use tokio_util::sync::CancellationToken;

use super::output;
use crate::state::AppState;

pub async fn run_worker(
    state: &AppState,
    interval_ms: Option<u64>,
    once: bool,
    json: bool,
) -> Result<()> {
    let mut config = state.config.poller.clone();
    if let Some(ms) = interval_ms {
        config.interval_ms = ms;
    }
    let poller = RetryPoller::new(Arc::clone(&state.manager), &config);

    if once {
        let report = poller.poll_once(Utc::now()).await?;
        if json {
            return output::print_json(&serde_json::json!({
                "due": report.due,
                "resumed": report.resumed,
                "errors": report.errors,
            }));
        }
        output::success(&format!(
            "Poller pass: {} due, {} resumed, {} errors",
            report.due, report.resumed, report.errors
        ));
        println!();
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    if !json {
        println!(
            "  {} Stepwise worker polling every {} ms",
            style("*").green().bold(),
            config.interval_ms
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    poller.run(cancel).await;

    if !json {
        println!("\n  Worker stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
