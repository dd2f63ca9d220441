// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: dsmd entrypoint wiring configuration and logging to the coordinator loop

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "dsmd", about = "Shared-page coherence coordinator")]
struct Args {
    /// TOML configuration file (only the [server] table is read).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let stop = AtomicBool::new(false);
    let result = dsmd::load_config(args.config.as_deref(), args.listen.as_deref()).and_then(|config| {
        dsmd::service_main_loop(config, dsmd::ReadyNotifier::new(|addr| println!("dsmd: ready on {addr}")), &stop)
    });
    if let Err(err) = result {
        eprintln!("dsmd: exited with error: {err}");
        std::process::exit(1);
    }
}
