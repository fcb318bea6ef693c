use cluster_util::local::run_local;
use cluster_util::ClusterSync;

#[test]
fn reductions_agree_on_every_rank() -> anyhow::Result<()> {
    let size = 5;
    let results = run_local(size, |ep| {
        let r = ep.rank() as u64;
        let mut v = vec![r, 1, r * r, 0];
        ep.all_reduce_sum(&mut v)?;
        ep.barrier()?;
        let m = ep.all_reduce_max(10 * r + 3)?;
        Ok((v, m))
    })?;

    for res in results {
        let (v, m) = res?;
        assert_eq!(v, vec![10, 5, 30, 0]);
        assert_eq!(m, 43);
    }
    Ok(())
}

#[test]
fn uneven_contributions_are_gathered_as_is() -> anyhow::Result<()> {
    let results = run_local(3, |ep| {
        let mine = vec![7u8; ep.rank() * 1000];
        ep.all_gather(&mine)
            .map(|g| g.iter().map(|x| x.len()).collect::<Vec<_>>())
            .map_err(anyhow::Error::from)
    })?;
    for res in results {
        assert_eq!(res?, vec![0, 1000, 2000]);
    }
    Ok(())
}

#[test]
fn mismatched_reduction_lengths_fail() -> anyhow::Result<()> {
    let results = run_local(2, |ep| {
        let mut v = vec![0u64; 1 + ep.rank()];
        Ok(ep.all_reduce_sum(&mut v).is_err())
    })?;
    for res in results {
        assert!(res?);
    }
    Ok(())
}

#[test]
fn a_departed_rank_breaks_the_collective() -> anyhow::Result<()> {
    let results = run_local(2, |ep| {
        if ep.rank() == 1 {
            return Ok(false);
        }
        Ok(ep.barrier().is_err())
    })?;
    let flags: Vec<bool> = results.into_iter().collect::<anyhow::Result<_>>()?;
    assert_eq!(flags, vec![true, false]);
    Ok(())
}
