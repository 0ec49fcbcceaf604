//! nixiectl - talk to your NixOS system in plain language.

use clap::Parser;
use nixiectl::{init_logging, run, Cli};

/// Exit code for failures outside the request pipeline (config, bad input)
const EXIT_HARD_FAILURE: i32 = 4;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nixiectl: {:#}", e);
            EXIT_HARD_FAILURE
        }
    };
    std::process::exit(code);
}
