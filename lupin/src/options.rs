use anyhow::{bail, ensure};

/// How the count table is aggregated across ranks at each refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// elementwise all-reduce over the dense table
    AllReduce,
    /// every rank publishes its non-zero entries on a channel
    PubSub,
}

/// Configuration of a sampling run
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    /// Depth of the topic tree (number of levels). Default: 3
    pub levels: usize,
    /// Per-level document-level Dirichlet prior. Default: [1.0]
    pub alpha: Vec<f32>,
    /// Per-level topic-word Dirichlet prior. Default: [1.0, 0.5, 0.25]
    pub beta: Vec<f32>,
    /// Per-level nCRP concentration, one per edge depth (`levels - 1`). Default: [1.0]
    pub gamma: Vec<f32>,
    /// Number of steady-state iterations after warm start. Default: 20
    pub num_iters: usize,
    /// Documents per warm-start minibatch; 0 means all local documents. Default: 1000
    pub minibatch_size: usize,
    /// Abort once the tree has more nodes than this. Default: 300
    pub topic_limit: usize,
    /// A node holding at least this many documents is instantiated. Default: 50
    pub threshold: i64,
    /// Let steady-state sweeps open new branches and score nodes past
    /// the instantiation boundary by their live counts. Warm start
    /// always may. Default: true
    pub new_topic: bool,
    /// Draw `phi` from its posterior instead of the plug-in mean. Default: false
    pub sample_phi: bool,
    /// Count aggregation path. Default: all-reduce
    pub aggregation: Aggregation,
    /// Run both aggregation paths and compare them at every refresh. Default: false
    pub check: bool,
    /// Random seed. Default: 42
    pub seed: u64,
    /// Maximum sampling threads per rank; 0 means all cores. Default: 0
    pub num_threads: usize,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        SamplerOptions {
            levels: 3,
            alpha: vec![1.0],
            beta: vec![1.0, 0.5, 0.25],
            gamma: vec![1.0],
            num_iters: 20,
            minibatch_size: 1000,
            topic_limit: 300,
            threshold: 50,
            new_topic: true,
            sample_phi: false,
            aggregation: Aggregation::AllReduce,
            check: false,
            seed: 42,
            num_threads: 0,
        }
    }
}

impl SamplerOptions {
    /// Check the options and broadcast single-valued hyperparameters
    /// to every level.
    pub fn validate(mut self) -> anyhow::Result<Self> {
        ensure!(self.levels >= 1, "need at least one level");
        let levels = self.levels;

        self.alpha = broadcast("alpha", self.alpha, levels)?;
        self.beta = broadcast("beta", self.beta, levels)?;
        self.gamma = broadcast("gamma", self.gamma, levels - 1)?;

        for (name, xx) in [("alpha", &self.alpha), ("beta", &self.beta), ("gamma", &self.gamma)] {
            if let Some(x) = xx.iter().find(|x| !(x.is_finite() && **x > 0.0)) {
                bail!("{} must be positive, got {}", name, x);
            }
        }
        ensure!(self.topic_limit >= 1, "topic limit must be positive");
        ensure!(self.threshold >= 0, "threshold cannot be negative");
        Ok(self)
    }

    /// Thread budget of one rank
    pub fn max_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            num_cpus::get().max(1)
        }
    }
}

fn broadcast(name: &str, xx: Vec<f32>, n: usize) -> anyhow::Result<Vec<f32>> {
    match xx.len() {
        len if len == n => Ok(xx),
        1 => Ok(vec![xx[0]; n]),
        len => bail!("{} has {} values; expected 1 or {}", name, len, n),
    }
}
