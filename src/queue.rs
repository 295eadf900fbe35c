//! Raw asynchronous message queue.
//!
//! [`MessageQueue`] posts whole payloads to peer ranks and delivers whole
//! payloads from them, driven entirely by cooperative polling from a single
//! thread. Outstanding send and receive handles live in slab slots and are
//! reaped in whatever order the transport completes them. Incoming messages
//! are discovered by probing, sized from the probe, received into a fresh
//! buffer and staged until the next [`poll`](MessageQueue::poll) or
//! [`terminate`](MessageQueue::terminate) dispatches them, which is also
//! what makes it safe for a handler to post new messages through the `&mut`
//! queue reference it is handed.

use std::borrow::Cow;
use std::collections::VecDeque;

use slab::Slab;

use crate::error::{Error, Result};
use crate::termination;
use crate::transport::{Transport, WireType};
use crate::{Envelope, Peid, Tag};

/// Construction-time queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Tag used for data messages.
    pub message_tag: Tag,
    /// Tag the termination waves travel on; must differ from
    /// `message_tag` so user data can never collide with the waves.
    pub control_tag: Tag,
    /// Maximum payload length accepted by a single post, in buffer
    /// elements.
    pub max_payload_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_tag: 0,
            control_tag: Tag::MAX,
            max_payload_len: usize::MAX,
        }
    }
}

struct SendSlot<R> {
    request: R,
}

struct RecvSlot<R> {
    request: R,
    source: Peid,
    tag: Tag,
}

/// A transport buffer that completed its receive and awaits dispatch.
pub(crate) struct ReceivedBuffer<B> {
    pub(crate) data: Vec<B>,
    pub(crate) source: Peid,
    pub(crate) tag: Tag,
}

/// Polling message queue over a private transport.
pub struct MessageQueue<B: WireType, T: Transport<B>> {
    transport: T,
    config: QueueConfig,
    send_slots: Slab<SendSlot<T::SendRequest>>,
    recv_slots: Slab<RecvSlot<T::RecvRequest>>,
    ready: VecDeque<ReceivedBuffer<B>>,
    sent: u64,
    received: u64,
    synchronous: bool,
    sealed: bool,
}

impl<B: WireType, T: Transport<B>> MessageQueue<B, T> {
    /// Creates a queue with default settings over a transport the queue
    /// takes sole ownership of.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, QueueConfig::default())
    }

    pub fn with_config(transport: T, config: QueueConfig) -> Self {
        assert!(
            config.message_tag != config.control_tag,
            "the control tag must be distinct from the message tag"
        );
        tracing::debug!(
            rank = transport.rank(),
            size = transport.size(),
            "message queue ready"
        );
        Self {
            transport,
            config,
            send_slots: Slab::new(),
            recv_slots: Slab::new(),
            ready: VecDeque::new(),
            sent: 0,
            received: 0,
            synchronous: false,
            sealed: false,
        }
    }

    pub fn rank(&self) -> Peid {
        self.transport.rank()
    }

    pub fn size(&self) -> Peid {
        self.transport.size()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Messages posted by this rank so far.
    pub fn local_sent(&self) -> u64 {
        self.sent
    }

    /// Messages delivered to this rank so far.
    pub fn local_received(&self) -> u64 {
        self.received
    }

    /// Makes every later post poll its own send request to completion
    /// before returning.
    pub fn synchronous_mode(&mut self) {
        self.synchronous = true;
    }

    /// Posts a copy of `payload` for delivery to `receiver` on the data
    /// tag.
    pub fn post_message(&mut self, payload: &[B], receiver: Peid) -> Result<()> {
        let tag = self.config.message_tag;
        self.post_vec(payload.to_vec(), receiver, tag)
    }

    /// Posts a copy of `payload` with an explicit transport tag. Only
    /// messages on the configured data tag are picked up by `poll`.
    pub fn post_message_tagged(&mut self, payload: &[B], receiver: Peid, tag: Tag) -> Result<()> {
        self.post_vec(payload.to_vec(), receiver, tag)
    }

    /// Hands an owned buffer to the transport. This is the single send
    /// path: validation, the sent counter and synchronous-mode draining
    /// all live here.
    pub(crate) fn post_vec(&mut self, buf: Vec<B>, receiver: Peid, tag: Tag) -> Result<()> {
        if self.sealed {
            return Err(Error::QueueTerminating);
        }
        if receiver < 0 || receiver >= self.size() {
            return Err(Error::InvalidReceiver {
                receiver,
                comm_size: self.size(),
            });
        }
        if buf.len() > self.config.max_payload_len {
            return Err(Error::BufferOverflow {
                message_len: buf.len(),
                max_len: self.config.max_payload_len,
            });
        }
        let request = self.transport.isend(buf, receiver, tag)?;
        let key = self.send_slots.insert(SendSlot { request });
        self.sent += 1;
        if self.synchronous {
            while self.send_slots.contains(key) {
                self.progress()?;
            }
        }
        Ok(())
    }

    /// One pass of transport progress: reap finished sends, turn probes
    /// into receives, stage finished receives.
    pub(crate) fn progress(&mut self) -> Result<()> {
        let mut finished_sends = Vec::new();
        for (key, slot) in self.send_slots.iter_mut() {
            if self.transport.test_send(&mut slot.request)? {
                finished_sends.push(key);
            }
        }
        for key in finished_sends {
            self.send_slots.remove(key);
        }

        while let Some(info) = self.transport.iprobe(self.config.message_tag)? {
            let buf = vec![B::default(); info.len];
            let request = self.transport.irecv(buf, info.source, info.tag)?;
            self.recv_slots.insert(RecvSlot {
                request,
                source: info.source,
                tag: info.tag,
            });
        }

        let mut finished_recvs = Vec::new();
        for (key, slot) in self.recv_slots.iter_mut() {
            if let Some(data) = self.transport.test_recv(&mut slot.request)? {
                finished_recvs.push((key, data));
            }
        }
        for (key, data) in finished_recvs {
            let slot = self.recv_slots.remove(key);
            self.received += 1;
            self.ready.push_back(ReceivedBuffer {
                data,
                source: slot.source,
                tag: slot.tag,
            });
        }
        Ok(())
    }

    pub(crate) fn take_ready(&mut self) -> Option<ReceivedBuffer<B>> {
        self.ready.pop_front()
    }

    fn dispatch<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&mut Self, Envelope<'_, B>),
    {
        let my_rank = self.rank();
        while let Some(buffer) = self.ready.pop_front() {
            let envelope = Envelope {
                message: Cow::Borrowed(buffer.data.as_slice()),
                sender: buffer.source,
                receiver: my_rank,
                tag: buffer.tag,
            };
            handler(&mut *self, envelope);
        }
        Ok(())
    }

    /// Makes one pass of transport progress and delivers every staged
    /// message to `handler`. Handlers may post new messages through the
    /// queue reference they receive.
    pub fn poll<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&mut Self, Envelope<'_, B>),
    {
        self.progress()?;
        self.dispatch(handler)
    }

    /// Drives the termination protocol: drain locally, synchronize on a
    /// barrier, compare the global sent and received counts, and prove that
    /// no send slipped in after the snapshot. Returns `true` once global
    /// quiescence is certain; the caller loops on `false`.
    ///
    /// After a successful return the queue accepts no further sends.
    pub fn terminate<H>(&mut self, handler: &mut H) -> Result<bool>
    where
        H: FnMut(&mut Self, Envelope<'_, B>),
    {
        if self.sealed {
            return Ok(true);
        }
        let clean = termination::detect(self, |q| {
            q.progress()?;
            q.dispatch(&mut *handler)
        })?;
        if clean {
            self.sealed = true;
            self.final_drain(handler)?;
            tracing::debug!(
                rank = self.rank(),
                sent = self.sent,
                received = self.received,
                "queue terminated"
            );
        }
        Ok(clean)
    }

    /// Reaps the remaining request slots after the counters proved global
    /// quiescence.
    fn final_drain<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&mut Self, Envelope<'_, B>),
    {
        while !self.transport_idle() {
            self.progress()?;
            self.dispatch(handler)?;
        }
        Ok(())
    }

    pub(crate) fn transport_idle(&self) -> bool {
        self.send_slots.is_empty() && self.recv_slots.is_empty() && self.ready.is_empty()
    }

    /// Nothing pending locally: no live request slots, no staged buffers,
    /// and no probe-visible message.
    pub(crate) fn is_quiet(&mut self) -> Result<bool> {
        Ok(self.transport_idle() && self.transport.iprobe(self.config.message_tag)?.is_none())
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub(crate) fn message_tag(&self) -> Tag {
        self.config.message_tag
    }

    pub(crate) fn counters(&self) -> [u64; 2] {
        [self.sent, self.received]
    }

    pub(crate) fn begin_barrier(&mut self) -> Result<T::CollectiveRequest> {
        self.transport.ibarrier(self.config.control_tag)
    }

    pub(crate) fn begin_allreduce(&mut self, c: [u64; 2]) -> Result<T::CollectiveRequest> {
        self.transport.iallreduce_sum(c, self.config.control_tag)
    }

    pub(crate) fn poll_collective(
        &mut self,
        req: &mut T::CollectiveRequest,
    ) -> Result<Option<[u64; 2]>> {
        self.transport.test_collective(req)
    }
}

impl<B: WireType, T: Transport<B>> termination::RawQueueAccess<B, T> for MessageQueue<B, T> {
    fn raw(&mut self) -> &mut MessageQueue<B, T> {
        self
    }
}
