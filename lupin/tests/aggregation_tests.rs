use cluster_util::local::run_local;
use lupin::aggregation::*;
use lupin::count_store::DenseCounts;
use lupin::Corpus;

#[test]
fn word_occurrences_agree_across_paths() -> anyhow::Result<()> {
    let results = run_local(2, |ep| {
        let corpus = Corpus::generate(1000, 1000.0, 10000, 7 + ep.rank() as u64)?;
        let expected = word_occurrences_allreduce(&ep, &corpus.docs, corpus.vocab_size)?;
        let tallies = word_occurrences_pubsub(&ep, &[1, 2], &corpus.docs, corpus.vocab_size)?;
        Ok((corpus.word_counts(), expected, tallies))
    })?;

    let mut local_sum = vec![0u64; 10000];
    let mut globals = vec![];
    for res in results {
        let (local, expected, tallies) = res?;
        for (x, y) in local_sum.iter_mut().zip(local) {
            *x += y;
        }
        assert_eq!(tallies.len(), 2);
        for tally in &tallies {
            assert_eq!(tally, &expected);
        }
        globals.push(expected);
    }

    for global in &globals {
        assert_eq!(global, &local_sum);
    }
    Ok(())
}

#[test]
fn count_tables_agree_across_paths() -> anyhow::Result<()> {
    let results = run_local(3, |ep| {
        let r = ep.rank();
        let mut local = DenseCounts::zeros(6, &[1, 2, 3]);
        local.add(0, 0, r, 1 + r as u64);
        local.add(2, 2, 5, 10);
        local.add(1, r % 2, 0, 4);

        let a = reduce_counts_allreduce(&ep, &local)?;
        let p = reduce_counts_pubsub(&ep, COUNT_CHANNEL, &local)?;
        compare_counts(&a, &p)?;
        Ok(a)
    })?;

    for res in results {
        let global = res?;
        assert_eq!(global.get(0, 0, 0), 1);
        assert_eq!(global.get(0, 0, 2), 3);
        assert_eq!(global.get(2, 2, 5), 30);
        assert_eq!(global.get(1, 0, 0), 8);
        assert_eq!(global.get(1, 1, 0), 4);
        assert_eq!(global.data().iter().sum::<u64>(), 6 + 30 + 12);
    }
    Ok(())
}

#[test]
fn a_disagreement_names_the_entry() {
    let a = DenseCounts::zeros(3, &[1, 2]);
    let mut b = a.clone();
    b.add(1, 1, 2, 5);
    let err = compare_counts(&a, &b).err();
    match err {
        Some(lupin::SamplerError::InconsistentCounts {
            level,
            topic,
            word,
            allreduce,
            pubsub,
        }) => {
            assert_eq!((level, topic, word), (1, 1, 2));
            assert_eq!((allreduce, pubsub), (0, 5));
        }
        other => panic!("unexpected {:?}", other),
    }
}
