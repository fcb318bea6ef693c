use anyhow::{anyhow, bail, ensure};
use log::info;
use matrix_util::common_io::read_parsed_lines;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, Uniform};
use rayon::prelude::*;

/// Number of themes planted by [`Corpus::generate`]
const NUM_SIM_THEMES: usize = 10;

/// A bag-of-words corpus: each document is a token sequence of
/// vocabulary indices in `[0, vocab_size)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    pub vocab_size: usize,
    pub docs: Vec<Vec<u32>>,
}

impl Corpus {
    pub fn new(vocab_size: usize, docs: Vec<Vec<u32>>) -> anyhow::Result<Self> {
        if let Some(w) = docs.iter().flatten().find(|&&w| w as usize >= vocab_size) {
            bail!("word {} is outside the vocabulary of {}", w, vocab_size);
        }
        Ok(Self { vocab_size, docs })
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    /// Total number of tokens
    pub fn num_tokens(&self) -> usize {
        self.docs.iter().map(|d| d.len()).sum()
    }

    /// Occurrences of each vocabulary word
    pub fn word_counts(&self) -> Vec<u64> {
        let mut cv = vec![0u64; self.vocab_size];
        for &w in self.docs.iter().flatten() {
            cv[w as usize] += 1;
        }
        cv
    }

    /// Simulate a corpus with a shallow planted hierarchy.
    ///
    /// ```text
    /// len(d) ~ Poisson(avg_len), at least 1
    /// t(d)   ~ Uniform{0 .. themes}
    /// w      ~ 1/2 Uniform(V) + 1/2 Uniform(block of theme t(d))
    /// ```
    ///
    /// * `num_docs` - number of documents
    /// * `avg_len` - average document length
    /// * `vocab_size` - vocabulary size
    /// * `seed` - random seed; document `j` draws from `seed + j`
    pub fn generate(
        num_docs: usize,
        avg_len: f32,
        vocab_size: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        ensure!(vocab_size > 0, "empty vocabulary");
        ensure!(avg_len > 0.0, "average document length must be positive");

        let rpois = Poisson::new(avg_len as f64)?;
        let themes = NUM_SIM_THEMES.min(vocab_size);
        let block = vocab_size / themes;
        let rtheme = Uniform::new(0, themes)?;
        let rword = Uniform::new(0, vocab_size as u32)?;

        let docs = (0..num_docs)
            .into_par_iter()
            .map(|j| {
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(j as u64));
                let len = (rpois.sample(&mut rng) as usize).max(1);
                let t = rtheme.sample(&mut rng);
                let lb = (t * block) as u32;
                (0..len)
                    .map(|_| {
                        if rng.random_bool(0.5) {
                            rword.sample(&mut rng)
                        } else {
                            lb + rng.random_range(0..block as u32)
                        }
                    })
                    .collect::<Vec<u32>>()
            })
            .collect::<Vec<_>>();

        let ret = Self { vocab_size, docs };
        info!(
            "simulated {} documents, {} tokens over {} words",
            ret.num_docs(),
            ret.num_tokens(),
            vocab_size
        );
        Ok(ret)
    }

    /// Read a corpus in LDA-C format, one document per line:
    ///
    /// ```text
    /// [M] [word]:[count] [word]:[count] ...
    /// ```
    ///
    /// * `input_file` - file name--either gzipped or not
    /// * `vocab_size` - vocabulary size; inferred from the largest word if `None`
    pub fn read_ldac(input_file: &str, vocab_size: Option<usize>) -> anyhow::Result<Self> {
        let docs = read_parsed_lines(input_file, parse_ldac_line)?;
        let max_word = docs.iter().flatten().max().map(|&w| w as usize + 1);
        let vocab_size = match (vocab_size, max_word) {
            (Some(v), _) => v,
            (None, Some(v)) => v,
            (None, None) => bail!("{} has no tokens", input_file),
        };
        let ret = Self::new(vocab_size, docs)?;
        info!(
            "read {} documents, {} tokens from {}",
            ret.num_docs(),
            ret.num_tokens(),
            input_file
        );
        Ok(ret)
    }

    /// Round-robin share of `rank` among `size` ranks
    pub fn shard(&self, rank: usize, size: usize) -> Corpus {
        let docs = self
            .docs
            .iter()
            .skip(rank)
            .step_by(size.max(1))
            .cloned()
            .collect();
        Corpus {
            vocab_size: self.vocab_size,
            docs,
        }
    }
}

fn parse_ldac_line(line: &str) -> anyhow::Result<Vec<u32>> {
    let mut words = line.split_whitespace();
    let num_terms: usize = words
        .next()
        .ok_or_else(|| anyhow!("empty document line"))?
        .parse()?;

    let mut ret = vec![];
    let mut seen = 0;
    for tok in words {
        let (w, n) = tok
            .split_once(':')
            .ok_or_else(|| anyhow!("expected word:count, got {:?}", tok))?;
        let w: u32 = w.parse()?;
        let n: usize = n.parse()?;
        ret.extend(std::iter::repeat_n(w, n));
        seen += 1;
    }
    ensure!(
        seen == num_terms,
        "line announces {} terms but lists {}",
        num_terms,
        seen
    );
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn generated_corpus_is_reproducible() -> anyhow::Result<()> {
        let a = Corpus::generate(50, 30.0, 200, 7)?;
        let b = Corpus::generate(50, 30.0, 200, 7)?;
        assert_eq!(a, b);
        assert_eq!(a.num_docs(), 50);
        assert!(a.docs.iter().all(|d| !d.is_empty()));
        assert!(a.docs.iter().flatten().all(|&w| w < 200));
        assert_eq!(a.word_counts().iter().sum::<u64>() as usize, a.num_tokens());
        Ok(())
    }

    #[test]
    fn shards_partition_the_documents() -> anyhow::Result<()> {
        let corpus = Corpus::generate(11, 5.0, 20, 1)?;
        let shards: Vec<_> = (0..3).map(|r| corpus.shard(r, 3)).collect();
        assert_eq!(shards.iter().map(|s| s.num_docs()).collect::<Vec<_>>(), vec![4, 4, 3]);
        assert_eq!(shards[1].docs[0], corpus.docs[1]);
        assert_eq!(shards[2].docs[1], corpus.docs[5]);
        Ok(())
    }

    #[test]
    fn ldac_lines_expand_counts() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "2 0:2 3:1")?;
        writeln!(file, "1 1:3")?;
        writeln!(file)?;
        let path = file.path().to_str().ok_or(anyhow!("path"))?.to_string();

        let corpus = Corpus::read_ldac(&path, None)?;
        assert_eq!(corpus.vocab_size, 4);
        assert_eq!(corpus.docs, vec![vec![0, 0, 3], vec![1, 1, 1]]);

        assert!(parse_ldac_line("3 0:1").is_err());
        assert!(Corpus::read_ldac(&path, Some(2)).is_err());
        Ok(())
    }
}
