use std::process::ExitCode;

use clap::Parser;

use dmesg_extract::cli::Cli;
use dmesg_extract::{orchestrator, version};

fn main() -> ExitCode {
    env_logger::init();

    print!("{}", version::version_text());

    let cli = Cli::parse();
    let args = match cli.classify() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match orchestrator::run(&args.system_map, &args.guest_access) {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
