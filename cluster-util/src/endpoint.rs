use crate::frame::{Frame, FrameKind};
use crate::link::{reader_loop, writer_loop, Link};
use crate::pubsub::ChannelRegistry;
use log::{debug, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// How long a closing endpoint waits for its queued frames to leave
const LINGER: Duration = Duration::from_secs(30);

/// Worker threads of the runtime that drives one endpoint's links
const LINK_THREADS: usize = 2;

/// The runtime driving the links of `rank`
pub fn link_runtime(rank: usize) -> io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(LINK_THREADS)
        .thread_name(format!("link-{}", rank))
        .enable_all()
        .build()
}

/// The message endpoint of one process (rank) in the cluster.
///
/// Holds one link per peer, each served by a writer task and a reader
/// task on the endpoint's own runtime. Outgoing frames are queued for
/// the writer. The reader drains incoming frames in order: collective
/// contributions are queued per peer for
/// [`ClusterSync`](crate::ClusterSync), pub/sub traffic is dispatched
/// to the registered channel.
///
/// The methods block; they are meant for plain threads, not for tasks
/// of another runtime.
pub struct Endpoint {
    rank: usize,
    size: usize,
    outbound: Vec<Option<mpsc::UnboundedSender<Frame>>>,
    collectives: Vec<Option<Mutex<mpsc::UnboundedReceiver<Frame>>>>,
    writers: Vec<JoinHandle<()>>,
    registry: Arc<ChannelRegistry>,
    next_tag: AtomicU64,
    runtime: Runtime,
}

impl Endpoint {
    /// Build the endpoint of `rank` from one link per peer.
    ///
    /// * `links` - `links[j]` connects to rank `j`; `links[rank]` must be `None`
    /// * `runtime` - drives the links; TCP links must have been opened on it
    pub fn new(rank: usize, links: Vec<Option<Link>>, runtime: Runtime) -> io::Result<Self> {
        let size = links.len();
        if rank >= size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {} out of cluster size {}", rank, size),
            ));
        }

        let registry = Arc::new(ChannelRegistry::default());
        let mut outbound = Vec::with_capacity(size);
        let mut collectives = Vec::with_capacity(size);
        let mut writers = Vec::with_capacity(size);

        for (peer, link) in links.into_iter().enumerate() {
            match (peer == rank, link) {
                (true, None) => {
                    outbound.push(None);
                    collectives.push(None);
                }
                (false, Some(Link { reader, writer })) => {
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    writers.push(runtime.spawn(writer_loop(writer, out_rx)));

                    let (coll_tx, coll_rx) = mpsc::unbounded_channel();
                    let registry = registry.clone();
                    runtime.spawn(async move {
                        let pumped = reader_loop(reader, |frame| match frame.kind {
                            FrameKind::Collective => coll_tx.send(frame).is_ok(),
                            FrameKind::Publish | FrameKind::Marker | FrameKind::Ack => {
                                registry.dispatch(peer, frame);
                                true
                            }
                            FrameKind::Hello => {
                                warn!("rank {}: stray hello from {}", rank, peer);
                                true
                            }
                        })
                        .await;

                        match pumped {
                            Ok(()) => debug!("rank {}: link from {} closed", rank, peer),
                            Err(e) => warn!("rank {}: link from {} failed: {}", rank, peer, e),
                        }
                        registry.peer_lost(peer);
                    });

                    outbound.push(Some(out_tx));
                    collectives.push(Some(Mutex::new(coll_rx)));
                }
                (true, Some(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "a rank cannot link to itself",
                    ))
                }
                (false, None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("rank {} has no link to {}", rank, peer),
                    ))
                }
            }
        }

        Ok(Self {
            rank,
            size,
            outbound,
            collectives,
            writers,
            registry,
            next_tag: AtomicU64::new(0),
            runtime,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue `frame` for `peer`; frames to one peer leave in order
    pub(crate) fn send(&self, peer: usize, frame: Frame) -> io::Result<()> {
        let tx = self
            .outbound
            .get(peer)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("no link to {}", peer))
            })?;
        tx.send(frame).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("link to rank {} is down", peer),
            )
        })
    }

    /// Next collective contribution from `peer`, in arrival order
    pub(crate) fn recv_collective(&self, peer: usize) -> io::Result<Frame> {
        let rx = self
            .collectives
            .get(peer)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("no link to {}", peer))
            })?;

        self.runtime
            .block_on(async { rx.lock().await.recv().await })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("rank {} left before the collective completed", peer),
                )
            })
    }

    /// Sequence number of the next collective; every rank issues
    /// collectives in the same order, so the numbers line up.
    pub(crate) fn next_collective_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&j| j != self.rank)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // closing the queues lets each writer flush and shut its side
        self.outbound.clear();
        let writers = std::mem::take(&mut self.writers);
        let rank = self.rank;
        self.runtime.block_on(async move {
            for w in writers {
                if tokio::time::timeout(LINGER, w).await.is_err() {
                    debug!("rank {}: gave up flushing a link", rank);
                }
            }
        });
    }
}
