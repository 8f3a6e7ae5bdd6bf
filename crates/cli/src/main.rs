use std::process::ExitCode;

use sdpctl::error::{CANCELLED_MESSAGE, ErrorKind, kind_of, render_error};
use sdpctl::{prompt, telemetry};
use tokio::{signal, sync::watch};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut interrupts = 0u32;
        while signal::ctrl_c().await.is_ok() {
            interrupts += 1;
            // A blocked terminal read never observes the cancel channel.
            if interrupts > 1 || prompt::is_reading() {
                eprintln!("\nError: {CANCELLED_MESSAGE}");
                std::process::exit(2);
            }
            info!("interrupt received, stopping; press Ctrl-C again to exit immediately");
            let _ = cancel_tx.send(true);
        }
    });

    match sdpctl::run(cancel_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            debug!(error = ?err, "command failed");
            eprintln!("Error: {}", render_error(&err));
            exit_code(kind_of(&err))
        }
    }
}

fn exit_code(kind: ErrorKind) -> ExitCode {
    match kind {
        ErrorKind::Cancelled => ExitCode::from(2),
        ErrorKind::Auth => ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}
