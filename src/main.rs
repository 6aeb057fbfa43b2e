// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::process;

use clap::{Arg, ArgMatches, Command};
use thiserror::Error;
use vmm::config::GuestConfig;
use vmm::Monitor;
use vmon::{cli_print_error_chain, Guest};

#[derive(Error, Debug)]
enum Error {
    #[error("Failed to start the monitor")]
    StartMonitor(#[source] vmm::Error),
    #[error("Failed to serialize the capability report")]
    SerializeCapability(#[source] serde_json::Error),
    #[error("Failed to parse guest parameters")]
    ParsingGuest(#[source] vmm::config::Error),
    #[error("Failed to read guest image {1}")]
    ReadImage(#[source] std::io::Error, String),
    #[error("Failed to create the guest")]
    CreateGuest(#[source] vmon::Error),
    #[error("Guest failed")]
    RunGuest(#[source] vmon::Error),
}

fn create_app() -> Command {
    Command::new("vmon")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Drive a virtual machine through the machine-independent monitor.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("capability").about("Print the selected backend and monitor limits"),
        )
        .subcommand(
            Command::new("run")
                .about("Run a flat real-mode image until it halts")
                .arg(
                    Arg::new("guest")
                        .long("guest")
                        .help(GuestConfig::SYNTAX)
                        .num_args(1),
                )
                .arg(
                    Arg::new("image")
                        .long("image")
                        .help("Path to the flat binary loaded at the entry address")
                        .num_args(1)
                        .required(true),
                ),
        )
}

fn capability(monitor: &Monitor) -> Result<(), Error> {
    let report =
        serde_json::to_string_pretty(&monitor.capability()).map_err(Error::SerializeCapability)?;
    println!("{report}");
    Ok(())
}

fn run(monitor: &Monitor, matches: &ArgMatches) -> Result<(), Error> {
    let guest = matches
        .get_one::<String>("guest")
        .map(String::as_str)
        .unwrap_or_default();
    let image_path = matches.get_one::<String>("image").unwrap();

    let config = GuestConfig::parse(guest).map_err(Error::ParsingGuest)?;
    let image = std::fs::read(image_path).map_err(|e| Error::ReadImage(e, image_path.clone()))?;

    let guest = Guest::create(monitor, &config, &image).map_err(Error::CreateGuest)?;
    let exit = guest
        .run(&mut std::io::stdout().lock())
        .map_err(Error::RunGuest)?;
    log::info!("Guest stopped: {:?}", exit);
    Ok(())
}

fn start(matches: &ArgMatches) -> Result<(), Error> {
    let monitor = Monitor::new().map_err(Error::StartMonitor)?;
    match matches.subcommand() {
        Some(("capability", _)) => capability(&monitor),
        Some(("run", args)) => run(&monitor, args),
        _ => unreachable!("clap requires a known subcommand"),
    }
}

fn main() {
    env_logger::init();

    let matches = create_app().get_matches();
    if let Err(e) = start(&matches) {
        cli_print_error_chain(&e, "vmon");
        process::exit(1);
    }
}
