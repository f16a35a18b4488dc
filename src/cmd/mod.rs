//! CLI subcommands

use clap::Subcommand;

pub mod controller;
pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervision daemon (default)
    Daemon,

    /// Run the fleet controller
    Controller,

    /// Print resolved configuration and environment checks
    Diagnostics,
}
