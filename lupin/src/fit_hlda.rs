use crate::cluster_args::ClusterArgs;

use clap::{Args, ValueEnum};
use log::{error, info};
use lupin::{Aggregation, Corpus, Sampler, SamplerError, SamplerOptions};
use matrix_util::common_io::write_lines;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum AggregationArg {
    Allreduce,
    Pubsub,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(
        required_unless_present = "simulate",
        help = "Corpus file in LDA-C format",
        long_help = "Corpus file in LDA-C format, optionally gzipped.\n\
		     One document per line: `[M] [word]:[count] ...`"
    )]
    data_file: Option<Box<str>>,

    #[arg(
        long,
        help = "Vocabulary size",
        long_help = "Vocabulary size of the corpus file.\n\
		     Inferred from the largest word id if not given."
    )]
    vocab_size: Option<usize>,

    #[arg(
        long,
        default_value_t = false,
        help = "Simulate a corpus instead of reading one",
        long_help = "Simulate a corpus with planted themes instead of reading one.\n\
		     See --sim-docs, --sim-doc-len and --sim-vocab."
    )]
    simulate: bool,

    #[arg(long, default_value_t = 1000, help = "Number of simulated documents")]
    sim_docs: usize,

    #[arg(long, default_value_t = 100.0, help = "Average simulated document length")]
    sim_doc_len: f32,

    #[arg(long, default_value_t = 1000, help = "Simulated vocabulary size")]
    sim_vocab: usize,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.tree.tsv: one line per node with its level, parent,\n\
		       number of documents and top words\n"
    )]
    out: Box<str>,

    #[arg(long, short = 'L', default_value_t = 3, help = "Depth of the topic tree")]
    levels: usize,

    #[arg(
        long,
        value_delimiter(','),
        default_values_t = vec![1.0],
        help = "Document-level prior per level (comma-separated)",
        long_help = "Dirichlet prior on each document's level proportions.\n\
		     One value per level, or a single value for all levels."
    )]
    alpha: Vec<f32>,

    #[arg(
        long,
        value_delimiter(','),
        default_values_t = vec![1.0, 0.5, 0.25],
        help = "Topic-word prior per level (comma-separated)",
        long_help = "Dirichlet prior on each node's word distribution.\n\
		     One value per level, or a single value for all levels."
    )]
    beta: Vec<f32>,

    #[arg(
        long,
        value_delimiter(','),
        default_values_t = vec![1.0],
        help = "nCRP concentration per depth (comma-separated)",
        long_help = "Nested CRP concentration, one per parent depth (levels - 1 values),\n\
		     or a single value for all. Larger values open more branches."
    )]
    gamma: Vec<f32>,

    #[arg(long, short = 'i', default_value_t = 20, help = "Steady-state iterations")]
    iters: usize,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Warm-start minibatch size",
        long_help = "Documents per warm-start minibatch on each rank.\n\
		     0 samples all local documents in one minibatch."
    )]
    minibatch_size: usize,

    #[arg(
        long,
        default_value_t = 300,
        help = "Maximum number of tree nodes",
        long_help = "Maximum number of tree nodes.\n\
		     Every rank aborts together once the tree grows beyond it."
    )]
    topic_limit: usize,

    #[arg(
        long,
        default_value_t = 50,
        help = "Documents needed to instantiate a node",
        long_help = "A node holding at least this many documents gets a fixed\n\
		     word distribution between refreshes; smaller nodes stay collapsed."
    )]
    threshold: i64,

    #[arg(
        long,
        default_value_t = false,
        help = "Keep the tree fixed after warm start",
        long_help = "Keep the tree fixed after warm start.\n\
		     Steady-state sweeps then move documents between existing\n\
		     leaves and score every node with its current phi."
    )]
    no_new_topic: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Sample phi instead of the posterior mean"
    )]
    sample_phi: bool,

    #[arg(
        long,
        value_enum,
        default_value = "allreduce",
        help = "How counts are aggregated across ranks"
    )]
    aggregation: AggregationArg,

    #[arg(
        long,
        default_value_t = false,
        help = "Cross-check both aggregation paths at every refresh"
    )]
    check: bool,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(
        long,
        short = 't',
        default_value_t = 0,
        help = "Sampling threads per rank (0: all cores)"
    )]
    threads: usize,

    #[arg(long, default_value_t = 10, help = "Top words listed per node")]
    top_words: usize,

    #[command(flatten)]
    cluster: ClusterArgs,
}

impl FitArgs {
    fn sampler_options(&self) -> SamplerOptions {
        SamplerOptions {
            levels: self.levels,
            alpha: self.alpha.clone(),
            beta: self.beta.clone(),
            gamma: self.gamma.clone(),
            num_iters: self.iters,
            minibatch_size: self.minibatch_size,
            topic_limit: self.topic_limit,
            threshold: self.threshold,
            new_topic: !self.no_new_topic,
            sample_phi: self.sample_phi,
            aggregation: match self.aggregation {
                AggregationArg::Allreduce => Aggregation::AllReduce,
                AggregationArg::Pubsub => Aggregation::PubSub,
            },
            check: self.check,
            seed: self.seed,
            num_threads: self.threads,
        }
    }

    fn corpus(&self) -> anyhow::Result<Corpus> {
        match (&self.data_file, self.simulate) {
            (_, true) => Corpus::generate(self.sim_docs, self.sim_doc_len, self.sim_vocab, self.seed),
            (Some(file), false) => Corpus::read_ldac(file, self.vocab_size),
            (None, false) => anyhow::bail!("need a corpus file or --simulate"),
        }
    }
}

pub fn fit_hlda(args: &FitArgs) -> anyhow::Result<()> {
    let options = args.sampler_options().validate()?;
    let corpus = args.corpus()?;

    let results = args.cluster.run(|ep| {
        let rank = ep.rank();
        let shard = corpus.shard(rank, ep.size());
        let mut sampler = Sampler::new(ep, shard, options.clone())?;

        let report = sampler.initialize()?;
        info!(
            "rank {}: sampled in warm-start round {:?}, {} refreshes",
            rank,
            report.active_round,
            report.refreshes
        );

        sampler.iterate(options.num_iters)?;

        Ok((rank, sampler.tree_summary_lines(args.top_words)))
    })?;

    let mut first_err = None;
    for res in results {
        match res {
            Ok((0, lines)) => {
                let out_file = format!("{}.tree.tsv", args.out);
                write_lines(&lines, &out_file)?;
                info!("wrote {} nodes to {}", lines.len() - 1, out_file);
            }
            Ok(_) => {}
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_err {
        match err.downcast_ref::<SamplerError>() {
            Some(SamplerError::TopicLimitExceeded { .. }) => {
                error!("{}; raise --topic-limit or --threshold, or lower --gamma", err);
            }
            Some(SamplerError::InconsistentCounts { .. }) => {
                error!("{}; the aggregation paths disagree", err);
            }
            None => {}
        }
        return Err(err);
    }

    info!("done");
    Ok(())
}
