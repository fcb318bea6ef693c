use crate::endpoint::{link_runtime, Endpoint};
use crate::link::Link;
use std::io;
use std::sync::Arc;
use std::thread;

/// Endpoints of a `size`-rank cluster fully connected by in-memory links
pub fn local_endpoints(size: usize) -> io::Result<Vec<Endpoint>> {
    let mut links: Vec<Vec<Option<Link>>> = (0..size)
        .map(|_| (0..size).map(|_| None).collect())
        .collect();

    for i in 0..size {
        for j in (i + 1)..size {
            let (a, b) = Link::memory_pair();
            links[i][j] = Some(a);
            links[j][i] = Some(b);
        }
    }

    links
        .into_iter()
        .enumerate()
        .map(|(rank, links)| Endpoint::new(rank, links, link_runtime(rank)?))
        .collect()
}

/// Run `job` once per rank of an in-memory cluster, each on its own
/// thread, and return the per-rank results in rank order.
///
/// A rank's endpoint is dropped when its job returns, which closes its
/// links; peers still blocked in a collective then fail instead of
/// hanging.
pub fn run_local<T, F>(size: usize, job: F) -> anyhow::Result<Vec<anyhow::Result<T>>>
where
    T: Send,
    F: Fn(Arc<Endpoint>) -> anyhow::Result<T> + Sync,
{
    let endpoints = local_endpoints(size)?;
    let job = &job;

    thread::scope(|s| {
        let mut handles = Vec::with_capacity(size);
        for ep in endpoints {
            let rank = ep.rank();
            let h = thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn_scoped(s, move || job(Arc::new(ep)))?;
            handles.push(h);
        }

        Ok(handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| match h.join() {
                Ok(ret) => ret,
                Err(_) => Err(anyhow::anyhow!("rank {} panicked", rank)),
            })
            .collect())
    })
}
