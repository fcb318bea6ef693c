//! Decentralized publish/subscribe channels.
//!
//! A channel is opened collectively by every rank, each declaring
//! whether it publishes, subscribes, or both. There is no broker: a
//! publisher sends each message straight to every subscriber over the
//! point-to-point links, so delivery is FIFO per publisher/subscriber
//! pair and unordered across publishers.
//!
//! [`PubSub::barrier`] is the channel's quiescence point:
//!
//! 1. every publisher sends a marker to every subscriber;
//! 2. a subscriber that has seen the markers of all publishers has
//!    handled everything published before them, and acks each publisher;
//! 3. a publisher returns once all subscribers acked.
//!
//! There is no timeout; a stalled peer blocks the barrier.

use crate::collective::ClusterSync;
use crate::endpoint::Endpoint;
use crate::frame::{Frame, FrameKind};
use log::warn;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

/// Receives the messages of one channel, once per message, in
/// per-publisher order. A handler owns whatever state it accumulates.
pub trait MessageHandler: Send {
    fn on_message(&mut self, msg: &[u8]);
}

impl<F> MessageHandler for F
where
    F: FnMut(&[u8]) + Send,
{
    fn on_message(&mut self, msg: &[u8]) {
        self(msg)
    }
}

/// Type-erased receiving side of a channel, as seen by the link pumps
pub(crate) trait ChannelSink: Send + Sync {
    fn on_frame(&self, peer: usize, frame: Frame);
    fn on_peer_lost(&self, peer: usize);
}

/// Open channels of one endpoint, by id
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: RwLock<HashMap<u32, Arc<dyn ChannelSink>>>,
    lost: Mutex<HashSet<usize>>,
}

impl ChannelRegistry {
    fn register(&self, id: u32, sink: Arc<dyn ChannelSink>) -> io::Result<()> {
        let mut channels = self.channels.write();
        if channels.contains_key(&id) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("channel {} is already open", id),
            ));
        }
        channels.insert(id, sink);
        Ok(())
    }

    fn unregister(&self, id: u32) {
        self.channels.write().remove(&id);
    }

    fn lookup(&self, id: u32) -> Option<Arc<dyn ChannelSink>> {
        self.channels.read().get(&id).cloned()
    }

    pub(crate) fn dispatch(&self, peer: usize, frame: Frame) {
        match self.lookup(frame.channel) {
            Some(sink) => sink.on_frame(peer, frame),
            None => warn!(
                "dropping {:?} frame from {} for closed channel {}",
                frame.kind, peer, frame.channel
            ),
        }
    }

    pub(crate) fn peer_lost(&self, peer: usize) {
        self.lost.lock().insert(peer);
        let sinks: Vec<_> = self.channels.read().values().cloned().collect();
        for sink in sinks {
            sink.on_peer_lost(peer);
        }
    }

    fn lost_peers(&self) -> HashSet<usize> {
        self.lost.lock().clone()
    }
}

#[derive(Default)]
struct BarrierProgress {
    markers: HashMap<u64, usize>,
    acks: HashMap<u64, usize>,
    lost: HashSet<usize>,
}

struct ChannelState<H> {
    handler: Mutex<H>,
    progress: Mutex<BarrierProgress>,
    changed: Condvar,
}

impl<H: MessageHandler> ChannelState<H> {
    fn deliver(&self, msg: &[u8]) {
        self.handler.lock().on_message(msg);
    }

    fn bump(&self, epoch: u64, ack: bool) {
        {
            let mut p = self.progress.lock();
            let counter = if ack { &mut p.acks } else { &mut p.markers };
            *counter.entry(epoch).or_default() += 1;
        }
        self.changed.notify_all();
    }

    /// Block until `count(progress) >= need`; fails if one of `peers`
    /// is gone while the condition still does not hold.
    fn wait_for(
        &self,
        need: usize,
        peers: &[usize],
        count: impl Fn(&BarrierProgress) -> usize,
    ) -> io::Result<()> {
        let mut p = self.progress.lock();
        loop {
            if count(&p) >= need {
                return Ok(());
            }
            if let Some(gone) = peers.iter().find(|j| p.lost.contains(j)) {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("rank {} left during a channel barrier", gone),
                ));
            }
            self.changed.wait(&mut p);
        }
    }
}

impl<H: MessageHandler> ChannelSink for ChannelState<H> {
    fn on_frame(&self, peer: usize, frame: Frame) {
        match frame.kind {
            FrameKind::Publish => self.deliver(&frame.payload),
            FrameKind::Marker => self.bump(frame.tag, false),
            FrameKind::Ack => self.bump(frame.tag, true),
            other => warn!("unexpected {:?} frame from {} on a channel", other, peer),
        }
    }

    fn on_peer_lost(&self, peer: usize) {
        self.progress.lock().lost.insert(peer);
        self.changed.notify_all();
    }
}

/// One rank's handle on a publish/subscribe channel
pub struct PubSub<H: MessageHandler + 'static> {
    id: u32,
    endpoint: Arc<Endpoint>,
    state: Arc<ChannelState<H>>,
    publishers: Vec<usize>,
    subscribers: Vec<usize>,
    is_publisher: bool,
    is_subscriber: bool,
    epoch: u64,
}

impl<H: MessageHandler + 'static> PubSub<H> {
    /// Open channel `id`. Collective: every rank of the cluster calls
    /// this, in the same order relative to other collectives.
    ///
    /// * `id` - channel id, unique among the channels open at once
    /// * `is_publisher` - this rank may call [`PubSub::publish`]
    /// * `is_subscriber` - this rank's `handler` receives every message
    pub fn open(
        endpoint: &Arc<Endpoint>,
        id: u32,
        is_publisher: bool,
        is_subscriber: bool,
        handler: H,
    ) -> io::Result<Self> {
        let state = Arc::new(ChannelState {
            handler: Mutex::new(handler),
            progress: Mutex::new(BarrierProgress {
                lost: endpoint.registry().lost_peers(),
                ..Default::default()
            }),
            changed: Condvar::new(),
        });

        // register before announcing the roles, so that no peer can
        // publish to us before we are ready to handle it
        endpoint.registry().register(id, state.clone())?;

        let roles = [is_publisher as u8, is_subscriber as u8];
        let gathered = match endpoint.all_gather(&roles) {
            Ok(x) => x,
            Err(e) => {
                endpoint.registry().unregister(id);
                return Err(e);
            }
        };

        let mut publishers = vec![];
        let mut subscribers = vec![];
        for (r, roles) in gathered.iter().enumerate() {
            match roles.as_slice() {
                [p, s] => {
                    if *p != 0 {
                        publishers.push(r);
                    }
                    if *s != 0 {
                        subscribers.push(r);
                    }
                }
                _ => {
                    endpoint.registry().unregister(id);
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed roles from rank {} on channel {}", r, id),
                    ));
                }
            }
        }

        Ok(Self {
            id,
            endpoint: endpoint.clone(),
            state,
            publishers,
            subscribers,
            is_publisher,
            is_subscriber,
            epoch: 0,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn publishers(&self) -> &[usize] {
        &self.publishers
    }

    pub fn subscribers(&self) -> &[usize] {
        &self.subscribers
    }

    /// Send `msg` to every subscriber of the channel. A subscribing
    /// publisher handles its own message before this returns.
    pub fn publish(&self, msg: &[u8]) -> io::Result<()> {
        if !self.is_publisher {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("rank {} is not a publisher on channel {}", self.endpoint.rank(), self.id),
            ));
        }

        let me = self.endpoint.rank();
        let mut frame = None;
        for &s in &self.subscribers {
            if s == me {
                self.state.deliver(msg);
            } else {
                let frame =
                    frame.get_or_insert_with(|| Frame::new(FrameKind::Publish, self.id, 0, msg.to_vec()));
                self.endpoint.send(s, frame.clone())?;
            }
        }
        Ok(())
    }

    /// Block until every message published on this channel before the
    /// barrier, by any rank, has been handled by every subscriber.
    /// Collective over the ranks taking part in the channel.
    pub fn barrier(&mut self) -> io::Result<()> {
        self.epoch += 1;
        let epoch = self.epoch;
        let me = self.endpoint.rank();

        if self.is_publisher {
            let marker = Frame::control(FrameKind::Marker, self.id, epoch);
            for &s in &self.subscribers {
                if s == me {
                    self.state.bump(epoch, false);
                } else {
                    self.endpoint.send(s, marker.clone())?;
                }
            }
        }

        if self.is_subscriber {
            self.state
                .wait_for(self.publishers.len(), &self.publishers, |p| {
                    p.markers.get(&epoch).copied().unwrap_or(0)
                })?;

            let ack = Frame::control(FrameKind::Ack, self.id, epoch);
            for &p in &self.publishers {
                if p == me {
                    self.state.bump(epoch, true);
                } else {
                    self.endpoint.send(p, ack.clone())?;
                }
            }
        }

        if self.is_publisher {
            self.state
                .wait_for(self.subscribers.len(), &self.subscribers, |p| {
                    p.acks.get(&epoch).copied().unwrap_or(0)
                })?;
        }

        let mut p = self.state.progress.lock();
        p.markers.remove(&epoch);
        p.acks.remove(&epoch);
        Ok(())
    }

    /// Exclusive access to the handler and its accumulated state.
    /// Messages arriving meanwhile wait for the guard to drop.
    pub fn handler(&self) -> MutexGuard<'_, H> {
        self.state.handler.lock()
    }
}

impl<H: MessageHandler + 'static> Drop for PubSub<H> {
    fn drop(&mut self) {
        self.endpoint.registry().unregister(self.id);
    }
}
