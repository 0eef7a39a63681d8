//! # DevWorkspace Controller
//!
//! A Kubernetes controller that drives DevWorkspace resources from creation
//! to a running, verified development environment, and tears them down
//! safely when they are stopped or deleted.
//!
//! See the library crate for the reconciliation engine itself.

use anyhow::Result;
use devworkspace_controller::runtime::{initialize, run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(
        init.client,
        init.reconciler,
        init.server_state,
        init.config.controller,
    )
    .await
}
