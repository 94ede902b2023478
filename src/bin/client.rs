//! Console chat client.
//!
//! `client <ip> [port]`; lines starting with `/` are sent as commands
//! (`/help`, `/list`, `/msg <name> <text>`), `/quit` exits.

use clap::Parser;
use relay_chat::client::{
    display_name, input_loop, resolve, run_session, Client, ConsoleView,
};
use relay_chat::config::ClientArgs;
use std::io;
use std::process::ExitCode;
use std::thread;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = match ClientArgs::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    // Logs go to stderr so they do not interleave with the chat on stdout.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr = resolve(&args.ip, args.port())?;
    let mut client = Client::connect(addr, args.connect_timeout())?;
    let name = display_name(args.name.as_deref());
    info!(name = %name, "Logging in");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.spawn_receiver(tx.clone())?;
    thread::Builder::new()
        .name("input".to_string())
        .spawn(move || input_loop(io::stdin().lock(), tx))?;

    client.login(&name)?;

    let mut view = ConsoleView::new(io::stdout());
    run_session(&mut client, &mut rx, &mut view)?;
    Ok(())
}
