//! In-process mesh transport.
//!
//! [`create_mesh`] wires up `size` connected [`MeshTransport`] endpoints
//! over standard channels, one MPSC receive queue per rank plus a sender
//! matrix. Each endpoint is meant to be moved to its own thread, but a
//! group can equally be driven from a single thread by interleaving calls,
//! which is how the deterministic unit tests below run.
//!
//! Data packets keep per-(source, tag) FIFO order. The nonblocking barrier
//! and all-reduce are built from control packets travelling through the
//! same channels on the caller's control tag: every rank reports to rank 0,
//! which releases the group once all contributions for a given round have
//! arrived. Rounds are keyed by tag and a per-kind counter, so consecutive
//! collectives and distinct tags never mix.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{ProbeInfo, Transport, WireType};
use crate::{Peid, Tag};

enum Packet<B> {
    Data { tag: Tag, payload: Vec<B> },
    BarrierArrive { tag: Tag, round: u64 },
    BarrierRelease { tag: Tag, round: u64 },
    ReducePart { tag: Tag, round: u64, part: [u64; 2] },
    ReduceResult { tag: Tag, round: u64, total: [u64; 2] },
}

struct Wire<B> {
    from: Peid,
    packet: Packet<B>,
}

/// In-flight mesh send. Channel sends hand the buffer off immediately, so
/// the request is born completed.
#[derive(Debug)]
pub struct MeshSendRequest {
    _private: (),
}

/// In-flight mesh receive.
#[derive(Debug)]
pub struct MeshRecvRequest<B> {
    data: Option<Vec<B>>,
    source: Peid,
    tag: Tag,
    buf: Option<Vec<B>>,
}

/// In-flight mesh barrier or all-reduce.
#[derive(Debug)]
pub enum MeshCollectiveRequest {
    Barrier { tag: Tag, round: u64 },
    Reduce { tag: Tag, round: u64 },
}

/// One endpoint of an in-process rank group.
pub struct MeshTransport<B> {
    rank: Peid,
    size: Peid,
    rx: mpsc::Receiver<Wire<B>>,
    txs: Vec<mpsc::Sender<Wire<B>>>,
    /// Per-source arrival queues for data packets.
    inbox: Vec<VecDeque<(Tag, Vec<B>)>>,
    next_barrier_round: u64,
    next_reduce_round: u64,
    /// Coordinator state, only populated on rank 0.
    barrier_arrivals: HashMap<(Tag, u64), Peid>,
    reduce_parts: HashMap<(Tag, u64), ([u64; 2], Peid)>,
    /// Completed rounds this rank has been notified of.
    barrier_done: HashMap<(Tag, u64), ()>,
    reduce_done: HashMap<(Tag, u64), [u64; 2]>,
    data_sends: Vec<u64>,
}

/// Creates a connected group of `size` mesh endpoints.
///
/// Element `i` of the returned vector is the endpoint for rank `i`.
/// Endpoints may send to themselves.
///
/// # Panics
/// Panics if `size` is 0.
pub fn create_mesh<B: WireType>(size: usize) -> Vec<MeshTransport<B>> {
    assert!(size > 0, "a mesh needs at least one rank");

    let mut receivers = Vec::with_capacity(size);
    let mut senders = Vec::with_capacity(size);
    for _ in 0..size {
        let (tx, rx) = mpsc::channel();
        receivers.push(rx);
        senders.push(tx);
    }

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, rx)| MeshTransport {
            rank: rank as Peid,
            size: size as Peid,
            rx,
            txs: senders.clone(),
            inbox: (0..size).map(|_| VecDeque::new()).collect(),
            next_barrier_round: 0,
            next_reduce_round: 0,
            barrier_arrivals: HashMap::new(),
            reduce_parts: HashMap::new(),
            barrier_done: HashMap::new(),
            reduce_done: HashMap::new(),
            data_sends: vec![0; size],
        })
        .collect()
}

impl<B: WireType> MeshTransport<B> {
    /// Number of data payloads sent to each rank so far. Control traffic is
    /// not counted.
    pub fn data_sends_by_peer(&self) -> &[u64] {
        &self.data_sends
    }

    fn disconnected(peer: Peid) -> Error {
        Error::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("rank {peer} has disconnected"),
        ))
    }

    fn send_wire(&self, dest: Peid, packet: Packet<B>) -> Result<()> {
        self.txs[dest as usize]
            .send(Wire {
                from: self.rank,
                packet,
            })
            .map_err(|_| Self::disconnected(dest))
    }

    /// Drains the receive channel, sorting packets into the data inboxes
    /// and the collective round state.
    fn pump(&mut self) -> Result<()> {
        while let Ok(wire) = self.rx.try_recv() {
            self.route(wire)?;
        }
        Ok(())
    }

    fn route(&mut self, wire: Wire<B>) -> Result<()> {
        match wire.packet {
            Packet::Data { tag, payload } => {
                self.inbox[wire.from as usize].push_back((tag, payload));
            }
            Packet::BarrierArrive { tag, round } => {
                let arrived = self.barrier_arrivals.entry((tag, round)).or_insert(0);
                *arrived += 1;
                if *arrived == self.size {
                    self.barrier_arrivals.remove(&(tag, round));
                    for dest in 0..self.size {
                        self.send_wire(dest, Packet::BarrierRelease { tag, round })?;
                    }
                }
            }
            Packet::BarrierRelease { tag, round } => {
                self.barrier_done.insert((tag, round), ());
            }
            Packet::ReducePart { tag, round, part } => {
                let (total, arrived) = match self.reduce_parts.entry((tag, round)) {
                    Entry::Occupied(e) => {
                        let (total, arrived) = e.into_mut();
                        total[0] += part[0];
                        total[1] += part[1];
                        *arrived += 1;
                        (*total, *arrived)
                    }
                    Entry::Vacant(e) => {
                        e.insert((part, 1));
                        (part, 1)
                    }
                };
                if arrived == self.size {
                    self.reduce_parts.remove(&(tag, round));
                    for dest in 0..self.size {
                        self.send_wire(dest, Packet::ReduceResult { tag, round, total })?;
                    }
                }
            }
            Packet::ReduceResult { tag, round, total } => {
                self.reduce_done.insert((tag, round), total);
            }
        }
        Ok(())
    }

    /// Removes the first pending message from `source` carrying `tag`.
    fn claim(&mut self, source: Peid, tag: Tag) -> Option<Vec<B>> {
        let queue = &mut self.inbox[source as usize];
        let pos = queue.iter().position(|(t, _)| *t == tag)?;
        queue.remove(pos).map(|(_, payload)| payload)
    }
}

impl<B: WireType> Transport<B> for MeshTransport<B> {
    type SendRequest = MeshSendRequest;
    type RecvRequest = MeshRecvRequest<B>;
    type CollectiveRequest = MeshCollectiveRequest;

    fn rank(&self) -> Peid {
        self.rank
    }

    fn size(&self) -> Peid {
        self.size
    }

    fn isend(&mut self, buf: Vec<B>, dest: Peid, tag: Tag) -> Result<MeshSendRequest> {
        self.send_wire(dest, Packet::Data { tag, payload: buf })?;
        self.data_sends[dest as usize] += 1;
        Ok(MeshSendRequest { _private: () })
    }

    fn iprobe(&mut self, tag: Tag) -> Result<Option<ProbeInfo>> {
        self.pump()?;
        for source in 0..self.size {
            if let Some((_, payload)) = self.inbox[source as usize]
                .iter()
                .find(|(t, _)| *t == tag)
            {
                return Ok(Some(ProbeInfo {
                    source,
                    tag,
                    len: payload.len(),
                }));
            }
        }
        Ok(None)
    }

    fn irecv(&mut self, buf: Vec<B>, source: Peid, tag: Tag) -> Result<MeshRecvRequest<B>> {
        self.pump()?;
        // Claim eagerly so a later probe cannot report the same message.
        let data = self.claim(source, tag);
        Ok(MeshRecvRequest {
            data,
            source,
            tag,
            buf: Some(buf),
        })
    }

    fn test_send(&mut self, _req: &mut MeshSendRequest) -> Result<bool> {
        Ok(true)
    }

    fn test_recv(&mut self, req: &mut MeshRecvRequest<B>) -> Result<Option<Vec<B>>> {
        if req.data.is_none() {
            self.pump()?;
            req.data = self.claim(req.source, req.tag);
        }
        let Some(payload) = req.data.take() else {
            return Ok(None);
        };
        let Some(mut buf) = req.buf.take() else {
            return Ok(None);
        };
        let filled = payload.len().min(buf.len());
        buf[..filled].copy_from_slice(&payload[..filled]);
        buf.truncate(filled);
        Ok(Some(buf))
    }

    fn ibarrier(&mut self, tag: Tag) -> Result<MeshCollectiveRequest> {
        let round = self.next_barrier_round;
        self.next_barrier_round += 1;
        self.send_wire(0, Packet::BarrierArrive { tag, round })?;
        Ok(MeshCollectiveRequest::Barrier { tag, round })
    }

    fn iallreduce_sum(
        &mut self,
        contribution: [u64; 2],
        tag: Tag,
    ) -> Result<MeshCollectiveRequest> {
        let round = self.next_reduce_round;
        self.next_reduce_round += 1;
        self.send_wire(
            0,
            Packet::ReducePart {
                tag,
                round,
                part: contribution,
            },
        )?;
        Ok(MeshCollectiveRequest::Reduce { tag, round })
    }

    fn test_collective(&mut self, req: &mut MeshCollectiveRequest) -> Result<Option<[u64; 2]>> {
        self.pump()?;
        match req {
            MeshCollectiveRequest::Barrier { tag, round } => {
                Ok(self.barrier_done.remove(&(*tag, *round)).map(|()| [0, 0]))
            }
            MeshCollectiveRequest::Reduce { tag, round } => {
                Ok(self.reduce_done.remove(&(*tag, *round)))
            }
        }
    }
}
