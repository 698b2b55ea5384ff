use anyhow::Result;
use clap::Parser;
use ctrlflow::cli::{run, Cli};
use ctrlflow::observability::init_tracing;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli)
}
