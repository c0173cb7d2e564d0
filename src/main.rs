use clap::Parser;
use quantreplay::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
