//! Folder-as-a-service CLI

use clap::Parser;
use fas_cli::{output::print_error, run, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
