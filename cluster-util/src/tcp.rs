use crate::endpoint::{link_runtime, Endpoint};
use crate::frame::{read_frame, write_frame, Frame, FrameKind};
use crate::link::Link;
use anyhow::{anyhow, bail};
use log::{debug, info};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

const CONNECT_RETRIES: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Join a TCP mesh of `addrs.len()` processes as `rank`.
///
/// Every process listens on `addrs[rank]`, dials each lower rank
/// (retrying while the peer is not yet up), and accepts one connection
/// from each higher rank. A dialing process introduces itself with a
/// hello frame carrying its rank.
pub fn connect_tcp_mesh(rank: usize, addrs: &[String]) -> anyhow::Result<Endpoint> {
    let size = addrs.len();
    if rank >= size {
        bail!("rank {} is outside the {} listed peers", rank, size);
    }

    let runtime = link_runtime(rank)?;
    let links = runtime.block_on(mesh_links(rank, addrs))?;
    Ok(Endpoint::new(rank, links, runtime)?)
}

async fn mesh_links(rank: usize, addrs: &[String]) -> anyhow::Result<Vec<Option<Link>>> {
    let size = addrs.len();
    let listener = TcpListener::bind(&addrs[rank]).await?;
    info!("rank {} listening on {}", rank, addrs[rank]);

    let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
    let mut buf = Vec::new();

    for (j, addr) in addrs.iter().enumerate().take(rank) {
        let mut stream = dial(addr).await?;
        let hello = Frame::control(FrameKind::Hello, 0, rank as u64);
        write_frame(&hello, &mut buf, &mut stream).await?;
        debug!("rank {} connected to {} at {}", rank, j, addr);
        links[j] = Some(Link::tcp(stream)?);
    }

    let mut waiting = size - rank - 1;
    while waiting > 0 {
        let (mut stream, from) = listener.accept().await?;
        let hello = read_frame(&mut stream, &mut buf)
            .await?
            .ok_or_else(|| anyhow!("{} hung up before saying hello", from))?;

        if hello.kind != FrameKind::Hello {
            bail!("expected a hello from {}, got {:?}", from, hello.kind);
        }
        let j = hello.tag as usize;
        if j <= rank || j >= size {
            bail!("unexpected hello from rank {} at {}", j, from);
        }
        if links[j].is_some() {
            bail!("rank {} connected twice", j);
        }

        debug!("rank {} accepted {} from {}", rank, j, from);
        links[j] = Some(Link::tcp(stream)?);
        waiting -= 1;
    }

    Ok(links)
}

async fn dial(addr: &str) -> anyhow::Result<TcpStream> {
    let mut last_err = None;
    for _ in 0..CONNECT_RETRIES {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(e);
                sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    Err(anyhow!(
        "could not reach {}: {}",
        addr,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::ClusterSync;
    use std::thread;

    #[test]
    fn three_rank_mesh_over_loopback() -> anyhow::Result<()> {
        // grab free ports, then release them for the mesh to bind
        let addrs: Vec<String> = (0..3)
            .map(|_| {
                let l = std::net::TcpListener::bind("127.0.0.1:0")?;
                Ok(l.local_addr()?.to_string())
            })
            .collect::<anyhow::Result<_>>()?;

        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let addrs = addrs.clone();
                thread::spawn(move || -> anyhow::Result<u64> {
                    let ep = connect_tcp_mesh(rank, &addrs)?;
                    let mut x = [rank as u64 + 1];
                    ep.all_reduce_sum(&mut x)?;
                    ep.barrier()?;
                    Ok(x[0])
                })
            })
            .collect();

        for h in handles {
            let sum = h.join().map_err(|_| anyhow!("rank panicked"))??;
            assert_eq!(sum, 6);
        }
        Ok(())
    }
}
