mod check_pubsub;
mod cluster_args;
mod fit_hlda;

use check_pubsub::*;
use clap::{Parser, Subcommand};
use fit_hlda::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LUPIN",
    long_about = "Hierarchical LDA by distributed, partially collapsed Gibbs sampling.\n\
		  Ranks run either as threads of one process (--local-ranks)\n\
		  or as separate processes over TCP (--rank, --peers)."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a topic tree",
        long_about = "Fit a hierarchical topic model in two stages: \n\
		      (1) Staged warm start, growing the tree a few ranks at a time\n\
		      (2) Steady-state Gibbs sweeps, each followed by a refresh\n\
		      Writes {out}.tree.tsv.\n"
    )]
    Fit(FitArgs),

    #[command(
        about = "Check publish/subscribe against all-reduce",
        long_about = "Every rank simulates its own documents and counts word\n\
		      occurrences across the cluster twice: by all-reduce and\n\
		      through two publish/subscribe channels. Fails on any mismatch."
    )]
    CheckPubsub(CheckPubsubArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.commands {
        Commands::Fit(args) => {
            fit_hlda(args)?;
        }
        Commands::CheckPubsub(args) => {
            check_pubsub(args)?;
        }
    }

    Ok(())
}
