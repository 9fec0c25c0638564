//! Headless CLI for gantry (feature = "cli").

mod args;
mod runner;

pub use args::{Args, Command, CredentialCommand, WorkflowCommand};
pub use runner::{initialize, run, CliContext};

/// Load `.env` and install the tracing subscriber. Called once from the
/// binary before anything else.
pub fn bootstrap(verbose: bool) {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let directive = if verbose { "gantry=debug" } else { "gantry=info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap()),
        )
        .try_init();
}
