//! # CRD Generator
//!
//! Generates the DevWorkspace CustomResourceDefinition YAML from the Rust
//! type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Print the CRD
//! cargo run --bin crdgen > config/crd/devworkspace.yaml
//!
//! # Write it to a file
//! cargo run --bin crdgen -- --output config/crd/devworkspace.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use devworkspace_controller::crd::DevWorkspace;
use kube::CustomResourceExt;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "crdgen", about = "Print the DevWorkspace CustomResourceDefinition")]
struct Args {
    /// Write the CRD to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let yaml = serde_yaml::to_string(&DevWorkspace::crd()).context("Failed to serialize CRD")?;

    match args.output {
        Some(path) => std::fs::write(&path, yaml)
            .with_context(|| format!("Failed to write CRD to {}", path.display()))?,
        None => print!("{yaml}"),
    }
    Ok(())
}
