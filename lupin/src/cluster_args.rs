use clap::Args;
use cluster_util::local::run_local;
use cluster_util::tcp::connect_tcp_mesh;
use cluster_util::Endpoint;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[arg(
        long,
        default_value_t = 1,
        help = "Number of ranks simulated inside this process",
        long_help = "Number of ranks simulated inside this process.\n\
		     Each rank runs on its own thread and talks to the others\n\
		     over in-memory links. Ignored with --rank."
    )]
    pub local_ranks: usize,

    #[arg(
        long,
        requires = "peers",
        help = "Rank of this process in a TCP cluster",
        long_help = "Rank of this process in a TCP cluster.\n\
		     Start one process per entry of --peers, each with its own rank."
    )]
    pub rank: Option<usize>,

    #[arg(
        long,
        value_delimiter(','),
        help = "Addresses of every rank (comma-separated)",
        long_help = "Listening addresses of every rank, in rank order (comma-separated).\n\
		     Example: 10.0.0.1:7070,10.0.0.2:7070"
    )]
    pub peers: Option<Vec<String>>,
}

impl ClusterArgs {
    /// Run `job` on every rank this process hosts; results in rank order
    pub fn run<T, F>(&self, job: F) -> anyhow::Result<Vec<anyhow::Result<T>>>
    where
        T: Send,
        F: Fn(Arc<Endpoint>) -> anyhow::Result<T> + Sync,
    {
        match (self.rank, self.peers.as_deref()) {
            (Some(rank), Some(peers)) => {
                let ep = connect_tcp_mesh(rank, peers)?;
                Ok(vec![job(Arc::new(ep))])
            }
            _ => {
                anyhow::ensure!(self.local_ranks > 0, "need at least one rank");
                run_local(self.local_ranks, job)
            }
        }
    }
}
