//! Source-routed indirection.
//!
//! An [`IndirectionAdapter`] sits on top of a buffered queue whose codec
//! puts the receiver on the wire, and rewrites every post so the transport
//! only ever targets the next relay rank. Arriving envelopes whose embedded
//! receiver is elsewhere are posted onward; the rest go to the user
//! handler. Which relay a message takes is the [`IndirectionScheme`]'s
//! decision, so the adapter itself is topology-agnostic.

use crate::aggregation::{BufferCleaner, EnvelopeMerger, EnvelopeSplitter, WireMessage};
use crate::buffered::BufferedQueue;
use crate::error::{Error, Result};
use crate::transport::{Transport, WireType};
use crate::{Envelope, Peid};

/// Chooses relay ranks for two-sided routing.
pub trait IndirectionScheme {
    /// The rank the current holder should forward to next.
    fn next_hop(&self, sender: Peid, receiver: Peid) -> Peid;

    /// Whether an envelope addressed to `receiver` needs another hop from
    /// here.
    fn should_redirect(&self, sender: Peid, receiver: Peid) -> bool;
}

/// Sends every message straight to its receiver.
#[derive(Debug, Clone, Copy)]
pub struct NoopScheme {
    rank: Peid,
}

impl NoopScheme {
    pub fn new(rank: Peid) -> Self {
        Self { rank }
    }
}

impl IndirectionScheme for NoopScheme {
    fn next_hop(&self, _sender: Peid, receiver: Peid) -> Peid {
        receiver
    }

    fn should_redirect(&self, _sender: Peid, receiver: Peid) -> bool {
        receiver != self.rank
    }
}

/// Routes across a `side x side` arrangement of the rank group: the first
/// hop stays in the sender's row and lands in the receiver's column, the
/// second walks the column. Every message takes at most two hops, and each
/// rank talks to at most `2 * side` peers.
#[derive(Debug, Clone, Copy)]
pub struct GridScheme {
    rank: Peid,
    size: Peid,
    side: Peid,
}

impl GridScheme {
    pub fn new(rank: Peid, size: Peid) -> Self {
        assert!(size > 0, "a grid needs at least one rank");
        let side = (size as f64).sqrt().ceil() as Peid;
        Self { rank, size, side }
    }

    fn row(&self, rank: Peid) -> Peid {
        rank / self.side
    }

    fn col(&self, rank: Peid) -> Peid {
        rank % self.side
    }
}

impl IndirectionScheme for GridScheme {
    fn next_hop(&self, sender: Peid, receiver: Peid) -> Peid {
        if self.col(sender) == self.col(receiver) {
            return receiver;
        }
        let relay = self.row(sender) * self.side + self.col(receiver);
        // the bottom row of a non-square group may be short
        if relay >= self.size {
            receiver
        } else {
            relay
        }
    }

    fn should_redirect(&self, _sender: Peid, receiver: Peid) -> bool {
        receiver != self.rank
    }
}

/// A buffered queue whose codec carries the receiver on the wire, as the
/// adapter requires.
pub type RoutedQueue<B, T, M, Cl> =
    BufferedQueue<B, T, EnvelopeMerger, EnvelopeSplitter<M>, Cl>;

/// Relays messages through intermediate ranks so each source only talks to
/// the peers its scheme selects.
pub struct IndirectionAdapter<B, T, M, S, Cl>
where
    B: WireType,
    T: Transport<B>,
{
    queue: RoutedQueue<B, T, M, Cl>,
    scheme: S,
}

impl<B, T, M, S, Cl> IndirectionAdapter<B, T, M, S, Cl>
where
    B: WireType,
    T: Transport<B>,
    M: WireMessage<B>,
    S: IndirectionScheme,
    Cl: BufferCleaner<B>,
{
    /// Wraps `queue` with relay routing.
    ///
    /// # Panics
    /// Panics if the queue's envelope format leaves the receiver off the
    /// wire, which would make routing impossible.
    pub fn new(queue: RoutedQueue<B, T, M, Cl>, scheme: S) -> Self {
        assert!(
            queue.merger().format().receiver && queue.splitter().format().receiver,
            "indirection requires the receiver field in the envelope format"
        );
        Self { queue, scheme }
    }

    pub fn rank(&self) -> Peid {
        self.queue.rank()
    }

    pub fn size(&self) -> Peid {
        self.queue.size()
    }

    pub fn transport(&self) -> &T {
        self.queue.transport()
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn synchronous_mode(&mut self) {
        self.queue.synchronous_mode();
    }

    pub fn local_sent(&self) -> u64 {
        self.queue.local_sent()
    }

    pub fn local_received(&self) -> u64 {
        self.queue.local_received()
    }

    /// Posts `message` towards `receiver`, buffered for the scheme's next
    /// hop.
    pub fn post_message(&mut self, message: &[M], receiver: Peid) -> Result<()> {
        let hop = self.scheme.next_hop(self.queue.rank(), receiver);
        self.queue.post_message_via(message, hop, receiver)
    }

    /// Like [`post_message`](Self::post_message), with one pass of
    /// transport progress before returning.
    pub fn post_message_blocking(&mut self, message: &[M], receiver: Peid) -> Result<()> {
        self.post_message(message, receiver)?;
        self.queue.make_progress()
    }

    pub fn post_one(&mut self, message: M, receiver: Peid) -> Result<()> {
        self.post_message(std::slice::from_ref(&message), receiver)
    }

    pub fn flush_all(&mut self) -> Result<()> {
        self.queue.flush_all()
    }

    /// One pass of progress. Envelopes that still need a hop are posted
    /// onward; the rest reach `handler` with the receiver set to this rank.
    pub fn poll<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&mut RoutedQueue<B, T, M, Cl>, Envelope<'_, M>),
    {
        let scheme = &self.scheme;
        let mut relay_failure = None;
        self.queue.poll(&mut |q, env| {
            Self::route(scheme, q, env, &mut *handler, &mut relay_failure)
        })?;
        match relay_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Terminates the underlying queue. Relayed re-posts during the
    /// protocol count as new sends, so the caller loops exactly as with a
    /// plain queue.
    pub fn terminate<H>(&mut self, handler: &mut H) -> Result<bool>
    where
        H: FnMut(&mut RoutedQueue<B, T, M, Cl>, Envelope<'_, M>),
    {
        let scheme = &self.scheme;
        let mut relay_failure = None;
        let done = self.queue.terminate(&mut |q, env| {
            Self::route(scheme, q, env, &mut *handler, &mut relay_failure)
        })?;
        match relay_failure {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    fn route<H>(
        scheme: &S,
        q: &mut RoutedQueue<B, T, M, Cl>,
        env: Envelope<'_, M>,
        handler: &mut H,
        relay_failure: &mut Option<Error>,
    ) where
        H: FnMut(&mut RoutedQueue<B, T, M, Cl>, Envelope<'_, M>),
    {
        if scheme.should_redirect(env.sender, env.receiver) && env.receiver != q.rank() {
            let receiver = env.receiver;
            let hop = scheme.next_hop(q.rank(), receiver);
            if let Err(e) = q.post_message_via(&env.message, hop, receiver) {
                relay_failure.get_or_insert(e);
            }
        } else {
            handler(q, env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered::BufferedQueueBuilder;
    use crate::mesh::{create_mesh, MeshTransport};

    #[test]
    fn test_grid_hops_within_row_then_column() {
        let grid = GridScheme::new(0, 4);
        // different column: relay in own row
        assert_eq!(grid.next_hop(0, 3), 1);
        // relay shares the receiver's column: direct
        assert_eq!(grid.next_hop(1, 3), 3);
        // same column from the start: direct
        assert_eq!(grid.next_hop(0, 2), 2);
        assert_eq!(grid.next_hop(3, 0), 2);
        assert_eq!(grid.next_hop(2, 2), 2);
    }

    #[test]
    fn test_grid_short_bottom_row_falls_back_to_direct() {
        let grid = GridScheme::new(0, 3);
        // relay slot 3 does not exist in a 3-rank group
        assert_eq!(grid.next_hop(2, 1), 1);
        assert_eq!(grid.next_hop(1, 2), 0);
    }

    #[test]
    fn test_grid_every_route_reaches_in_two_hops() {
        for size in 1..=9 {
            for sender in 0..size {
                let scheme = GridScheme::new(sender, size);
                for receiver in 0..size {
                    let first = scheme.next_hop(sender, receiver);
                    let second = GridScheme::new(first, size).next_hop(first, receiver);
                    assert_eq!(second, receiver, "size {size}: {sender} -> {receiver}");
                }
            }
        }
    }

    #[test]
    fn test_noop_scheme_never_relays() {
        let scheme = NoopScheme::new(2);
        assert_eq!(scheme.next_hop(0, 1), 1);
        assert!(scheme.should_redirect(0, 1));
        assert!(!scheme.should_redirect(0, 2));
    }

    fn routed(
        transport: MeshTransport<i32>,
    ) -> RoutedQueue<i32, MeshTransport<i32>, i32, crate::aggregation::NoopCleaner<i32>> {
        BufferedQueueBuilder::new(transport)
            .with_merger(EnvelopeMerger::default())
            .with_splitter(EnvelopeSplitter::<i32>::default())
            .build()
    }

    #[test]
    fn test_message_relays_through_intermediate_rank() {
        let size = 4;
        let mut adapters: Vec<_> = create_mesh::<i32>(size)
            .into_iter()
            .enumerate()
            .map(|(rank, t)| {
                IndirectionAdapter::new(routed(t), GridScheme::new(rank as Peid, size as Peid))
            })
            .collect();

        adapters[0].post_message(&[42], 3).unwrap();
        adapters[0].flush_all().unwrap();
        // first hop went to the relay in rank 0's row
        assert_eq!(adapters[0].transport().data_sends_by_peer(), &[0, 1, 0, 0]);

        let mut misdelivered = false;
        adapters[1].poll(&mut |_q, _env| misdelivered = true).unwrap();
        assert!(!misdelivered);
        adapters[1].flush_all().unwrap();

        let mut delivered = Vec::new();
        adapters[3]
            .poll(&mut |_q, env| delivered.push((env.receiver, env.message.to_vec())))
            .unwrap();
        assert_eq!(delivered, vec![(3, vec![42])]);
    }

    #[test]
    #[should_panic(expected = "receiver field")]
    fn test_adapter_rejects_codec_without_receiver() {
        use crate::aggregation::EnvelopeFormat;
        let format = EnvelopeFormat {
            size: true,
            sender: false,
            receiver: false,
            tag: false,
            fixed_message_len: None,
        };
        let mut mesh = create_mesh::<i32>(1);
        let queue = BufferedQueueBuilder::new(mesh.pop().unwrap())
            .with_merger(EnvelopeMerger::new(format))
            .with_splitter(EnvelopeSplitter::<i32>::new(format))
            .build();
        let _ = IndirectionAdapter::new(queue, NoopScheme::new(0));
    }
}
