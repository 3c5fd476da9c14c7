//! unitctl - Drive systemd units over D-Bus
//!
//! Start, stop, restart, and watch units with job results awaited rather
//! than polled, and report how long a unit's main process has been up.

use clap::Parser;

mod commands;

use commands::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
