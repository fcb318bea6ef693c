use crate::sampler::Sampler;

impl Sampler {
    /// One tab-separated line per tree node, with a header:
    /// `level node parent num_docs instantiated top_words`, where
    /// `top_words` lists the `top_k` most probable word ids under `phi`.
    pub fn tree_summary_lines(&self, top_k: usize) -> Vec<Box<str>> {
        let generation = &self.generation;
        let mut lines: Vec<Box<str>> =
            vec!["level\tnode\tparent\tnum_docs\tinstantiated\ttop_words".into()];

        self.tree.with_nodes(|nodes| {
            for (l, level_nodes) in nodes.iter().enumerate() {
                for (k, node) in level_nodes.iter().enumerate() {
                    let top_words = match generation.phi.get(l) {
                        Some(phi) if k < phi.ncols() => {
                            let col = phi.column(k);
                            let mut order: Vec<usize> = (0..col.len()).collect();
                            order.sort_by(|&a, &b| col[b].total_cmp(&col[a]));
                            order
                                .into_iter()
                                .take(top_k)
                                .map(|v| v.to_string())
                                .collect::<Vec<_>>()
                                .join(",")
                        }
                        _ => String::new(),
                    };
                    lines.push(
                        format!(
                            "{}\t{}\t{}\t{}\t{}\t{}",
                            l,
                            k,
                            node.parent,
                            node.num_docs,
                            generation.is_instantiated(l, k),
                            top_words
                        )
                        .into_boxed_str(),
                    );
                }
            }
        });
        lines
    }
}
