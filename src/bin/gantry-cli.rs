//! Gantry CLI - manage the workflow orchestrator's stores headlessly.
//!
//! The engine itself runs embedded in a host application that provides
//! the session runtime; this binary covers the management surface:
//! creating and inspecting workflows, driving the credential vault, and
//! reading event logs.
//!
//! # Usage
//!
//! ```bash
//! cargo build --features cli --bin gantry-cli
//!
//! # Create a workflow from a plan file
//! ./target/debug/gantry-cli workflow create plan.json
//!
//! # Watch its event log
//! ./target/debug/gantry-cli events <workflow-id>
//!
//! # Vault operations need GANTRY_MASTER_KEY
//! echo -n "$TOKEN" | gantry-cli credential create "github token"
//! ```

use anyhow::Result;
use clap::Parser;

use gantry::cli::{bootstrap, initialize, run, Args};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    bootstrap(args.verbose);

    let ctx = initialize(&args).await?;
    run(&ctx, &args).await
}
