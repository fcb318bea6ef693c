use crate::cluster_args::ClusterArgs;

use clap::Args;
use log::info;
use lupin::aggregation::{word_occurrences_allreduce, word_occurrences_pubsub};
use lupin::Corpus;

#[derive(Args, Debug)]
pub struct CheckPubsubArgs {
    #[arg(long, default_value_t = 1000, help = "Documents per rank")]
    num_docs: usize,

    #[arg(long, default_value_t = 1000.0, help = "Average document length")]
    doc_len: f32,

    #[arg(long, default_value_t = 10000, help = "Vocabulary size")]
    vocab_size: usize,

    #[arg(
        long,
        value_delimiter(','),
        default_values_t = vec![1, 2],
        help = "Channel ids to publish on (comma-separated)"
    )]
    channels: Vec<u32>,

    #[arg(long, default_value_t = 42, help = "Random seed; rank r uses seed + r")]
    seed: u64,

    #[command(flatten)]
    cluster: ClusterArgs,
}

pub fn check_pubsub(args: &CheckPubsubArgs) -> anyhow::Result<()> {
    let results = args.cluster.run(|ep| {
        let rank = ep.rank();
        let corpus = Corpus::generate(
            args.num_docs,
            args.doc_len,
            args.vocab_size,
            args.seed.wrapping_add(rank as u64),
        )?;

        let expected = word_occurrences_allreduce(&ep, &corpus.docs, corpus.vocab_size)?;
        let tallies = word_occurrences_pubsub(&ep, &args.channels, &corpus.docs, corpus.vocab_size)?;

        for (&id, tally) in args.channels.iter().zip(&tallies) {
            if let Some(v) = (0..expected.len()).find(|&v| expected[v] != tally[v]) {
                anyhow::bail!(
                    "rank {}: channel {} counted word {} {} times, all-reduce {}",
                    rank,
                    id,
                    v,
                    tally[v],
                    expected[v]
                );
            }
        }

        if rank == 0 {
            info!(
                "{} tokens agree on all-reduce and {} channel(s)",
                expected.iter().sum::<u64>(),
                tallies.len()
            );
        }
        Ok(())
    })?;

    for res in results {
        res?;
    }
    info!("publish/subscribe check passed");
    Ok(())
}
