use anyhow::Result;
use colored::Colorize;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use zbak::cli::{
    actions::{self, Action, send::SendOutcome},
    start,
};

/// Exit code for the planner's "nothing to do" verdict.
const NOOP_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let (action, globals) = start()?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, shutting down");
            signal_cancel.cancel();
        }
    });

    match action {
        Action::Send { .. } => match actions::send::handle(action, &globals, &cancel).await? {
            SendOutcome::NoOp => {
                println!("nothing to do");
                Ok(ExitCode::from(NOOP_EXIT))
            }
            SendOutcome::Completed(outcome) => {
                for (dest, err) in &outcome.failed {
                    eprintln!("{} {dest}: {err}", "incomplete:".yellow());
                }
                println!(
                    "{} volume(s) written to {} destination(s)",
                    outcome.job.volumes.len(),
                    outcome.written.len()
                );
                Ok(ExitCode::SUCCESS)
            }
        },

        Action::Receive { .. } => {
            actions::receive::handle(action, &globals, &cancel).await?;
            Ok(ExitCode::SUCCESS)
        }

        Action::List { .. } => {
            let mut stdout = std::io::stdout();
            actions::list::handle(action, &globals, &cancel, &mut stdout).await?;
            Ok(ExitCode::SUCCESS)
        }

        Action::Version { .. } => {
            let mut stdout = std::io::stdout();
            actions::version::handle(&action, &mut stdout)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
