//! # Cgtether
//! The binary is launched by a higher-level host runtime. It creates and
//! configures the requested cgroups, forks and execs the target program
//! inside them, and then supervises: host hangup, delivered signals and
//! child exit all funnel through one event loop, and every exit path
//! ends in the same cleanup.

use std::env;
use std::process::exit;

use anyhow::Result;

use cgtether::cgroups::Manager;
use cgtether::cleanup::Cleaner;
use cgtether::logger;
use cgtether::opts::{self, Config, Parsed, USAGE};
use cgtether::process::launcher;
use cgtether::signal::SignalPipe;
use cgtether::supervisor::Supervisor;

fn main() {
    let args: Vec<String> = env::args().collect();
    let config = match opts::parse(&args) {
        Ok(Parsed::Run(config)) => config,
        Ok(Parsed::Help) => {
            print!("{}", USAGE);
            exit(0);
        }
        Err(err) => {
            eprintln!("cgtether: {:#}", err);
            print!("{}", USAGE);
            exit(libc::EXIT_FAILURE);
        }
    };

    if let Err(err) = logger::init() {
        eprintln!("log init failed: {:?}", err);
    }

    let cleaner = Cleaner::new(Manager::new(
        config.cgroup_path.as_deref(),
        &config.controllers,
    ));

    let code = match run(&config, &cleaner) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            libc::EXIT_FAILURE
        }
    };

    // process::exit skips destructors, so tear down explicitly first.
    cleaner.run();
    exit(code);
}

fn run(config: &Config, cleaner: &Cleaner) -> Result<i32> {
    cleaner.manager().create()?;
    cleaner.manager().apply()?;

    let signals = SignalPipe::install()?;
    let child = launcher::spawn(config, cleaner.manager())?;

    Supervisor::new(&signals, child, config.grace).run()
}
