//! Buffered message queue.
//!
//! Wraps the raw queue with one accumulation buffer per destination rank. A
//! posted message is encoded into its destination's buffer by the
//! configured [`Merger`]; buffers are handed to the transport as single
//! sends when they outgrow the local threshold, when the running total
//! outgrows the global threshold, on an explicit flush, and when
//! termination begins. On the receive side the configured [`Splitter`]
//! unpacks each transport buffer back into logical envelopes.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::aggregation::{
    noop_cleaner, AppendMerger, BufferCleaner, Merger, NoSplitter, NoopCleaner, Splitter,
};
use crate::error::{Error, Result};
use crate::queue::{MessageQueue, QueueConfig};
use crate::termination;
use crate::transport::{Transport, WireType};
use crate::{Envelope, Peid, Tag};

/// Default per-destination flush threshold, in buffer elements.
pub const DEFAULT_LOCAL_THRESHOLD: usize = 16 * 1024;

/// Builder for [`BufferedQueue`].
///
/// Starts from raw concatenation with whole-buffer delivery and no cleaner;
/// `with_merger`/`with_splitter`/`with_cleaner` swap in other codecs.
pub struct BufferedQueueBuilder<B: WireType, T: Transport<B>, Mg, Sp, Cl> {
    transport: T,
    config: QueueConfig,
    merger: Mg,
    splitter: Sp,
    cleaner: Cl,
    local_threshold: usize,
    global_threshold: usize,
    max_message_len: usize,
    _marker: PhantomData<B>,
}

impl<B: WireType, T: Transport<B>>
    BufferedQueueBuilder<B, T, AppendMerger, NoSplitter, NoopCleaner<B>>
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: QueueConfig::default(),
            merger: AppendMerger,
            splitter: NoSplitter,
            cleaner: noop_cleaner::<B> as NoopCleaner<B>,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            global_threshold: usize::MAX,
            max_message_len: usize::MAX,
            _marker: PhantomData,
        }
    }
}

impl<B: WireType, T: Transport<B>, Mg, Sp, Cl> BufferedQueueBuilder<B, T, Mg, Sp, Cl> {
    pub fn with_merger<Mg2>(self, merger: Mg2) -> BufferedQueueBuilder<B, T, Mg2, Sp, Cl> {
        BufferedQueueBuilder {
            transport: self.transport,
            config: self.config,
            merger,
            splitter: self.splitter,
            cleaner: self.cleaner,
            local_threshold: self.local_threshold,
            global_threshold: self.global_threshold,
            max_message_len: self.max_message_len,
            _marker: PhantomData,
        }
    }

    pub fn with_splitter<Sp2>(self, splitter: Sp2) -> BufferedQueueBuilder<B, T, Mg, Sp2, Cl> {
        BufferedQueueBuilder {
            transport: self.transport,
            config: self.config,
            merger: self.merger,
            splitter,
            cleaner: self.cleaner,
            local_threshold: self.local_threshold,
            global_threshold: self.global_threshold,
            max_message_len: self.max_message_len,
            _marker: PhantomData,
        }
    }

    pub fn with_cleaner<Cl2>(self, cleaner: Cl2) -> BufferedQueueBuilder<B, T, Mg, Sp, Cl2> {
        BufferedQueueBuilder {
            transport: self.transport,
            config: self.config,
            merger: self.merger,
            splitter: self.splitter,
            cleaner,
            local_threshold: self.local_threshold,
            global_threshold: self.global_threshold,
            max_message_len: self.max_message_len,
            _marker: PhantomData,
        }
    }

    /// Per-destination buffer length that triggers a flush.
    pub fn with_local_threshold(mut self, elements: usize) -> Self {
        self.local_threshold = elements;
        self
    }

    /// Total buffered length that evicts the largest buffer.
    pub fn with_global_threshold(mut self, elements: usize) -> Self {
        self.global_threshold = elements;
        self
    }

    /// Largest encoded size accepted for a single message.
    pub fn with_max_message_len(mut self, elements: usize) -> Self {
        self.max_message_len = elements;
        self
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> BufferedQueue<B, T, Mg, Sp, Cl>
    where
        Sp: Splitter<B> + Clone,
        Mg: Merger<Sp::Message, B>,
        Cl: BufferCleaner<B>,
    {
        BufferedQueue {
            queue: MessageQueue::with_config(self.transport, self.config),
            merger: self.merger,
            splitter: self.splitter,
            cleaner: self.cleaner,
            buffers: BTreeMap::new(),
            total_buffered: 0,
            local_threshold: self.local_threshold,
            global_threshold: self.global_threshold,
            max_message_len: self.max_message_len,
        }
    }
}

/// Message queue with per-destination aggregation buffers.
pub struct BufferedQueue<B: WireType, T: Transport<B>, Mg, Sp, Cl> {
    queue: MessageQueue<B, T>,
    merger: Mg,
    splitter: Sp,
    cleaner: Cl,
    buffers: BTreeMap<Peid, Vec<B>>,
    total_buffered: usize,
    local_threshold: usize,
    global_threshold: usize,
    max_message_len: usize,
}

impl<B, T, Mg, Sp, Cl> BufferedQueue<B, T, Mg, Sp, Cl>
where
    B: WireType,
    T: Transport<B>,
    Sp: Splitter<B> + Clone,
    Mg: Merger<Sp::Message, B>,
    Cl: BufferCleaner<B>,
{
    pub fn rank(&self) -> Peid {
        self.queue.rank()
    }

    pub fn size(&self) -> Peid {
        self.queue.size()
    }

    pub fn transport(&self) -> &T {
        self.queue.transport()
    }

    pub fn merger(&self) -> &Mg {
        &self.merger
    }

    pub fn splitter(&self) -> &Sp {
        &self.splitter
    }

    /// Transport-level messages posted by this rank (one per flushed
    /// buffer).
    pub fn local_sent(&self) -> u64 {
        self.queue.local_sent()
    }

    /// Transport-level messages delivered to this rank.
    pub fn local_received(&self) -> u64 {
        self.queue.local_received()
    }

    /// Elements currently waiting in accumulation buffers.
    pub fn buffered_elements(&self) -> usize {
        self.total_buffered
    }

    pub fn synchronous_mode(&mut self) {
        self.queue.synchronous_mode();
    }

    /// Merges `message` into the buffer for `receiver`, flushing as the
    /// thresholds dictate.
    pub fn post_message(&mut self, message: &[Sp::Message], receiver: Peid) -> Result<()> {
        self.post_internal(message, receiver, receiver, 0)
    }

    /// Like [`post_message`](Self::post_message) with an explicit envelope
    /// tag. The tag reaches the receiver only through codecs that put it on
    /// the wire.
    pub fn post_message_tagged(
        &mut self,
        message: &[Sp::Message],
        receiver: Peid,
        tag: Tag,
    ) -> Result<()> {
        self.post_internal(message, receiver, receiver, tag)
    }

    /// Posts a single message value.
    pub fn post_one(&mut self, message: Sp::Message, receiver: Peid) -> Result<()> {
        self.post_message(std::slice::from_ref(&message), receiver)
    }

    /// Like [`post_message`](Self::post_message), but guarantees one pass
    /// of transport progress before returning. Deliveries that complete
    /// during that pass are staged for the next `poll` or `terminate`.
    pub fn post_message_blocking(&mut self, message: &[Sp::Message], receiver: Peid) -> Result<()> {
        self.post_message(message, receiver)?;
        self.queue.progress()
    }

    pub(crate) fn make_progress(&mut self) -> Result<()> {
        self.queue.progress()
    }

    /// Posts `message` into the buffer for `via` while the envelope keeps
    /// `receiver` as its destination. Relay layers use this to route a
    /// message through an intermediate rank.
    pub fn post_message_via(
        &mut self,
        message: &[Sp::Message],
        via: Peid,
        receiver: Peid,
    ) -> Result<()> {
        self.post_internal(message, via, receiver, 0)
    }

    fn post_internal(
        &mut self,
        message: &[Sp::Message],
        destination: Peid,
        receiver: Peid,
        tag: Tag,
    ) -> Result<()> {
        if self.queue.is_sealed() {
            return Err(Error::QueueTerminating);
        }
        let size = self.queue.size();
        for peer in [destination, receiver] {
            if peer < 0 || peer >= size {
                return Err(Error::InvalidReceiver {
                    receiver: peer,
                    comm_size: size,
                });
            }
        }
        let my_rank = self.queue.rank();
        let envelope = Envelope {
            message: Cow::Borrowed(message),
            sender: my_rank,
            receiver,
            tag,
        };

        let (current, projected) = {
            let buffer = self.buffers.entry(destination).or_default();
            let projected = self
                .merger
                .new_buffer_len(buffer, destination, my_rank, &envelope);
            (buffer.len(), projected)
        };
        let encoded_len = projected - current;
        if encoded_len > self.max_message_len {
            return Err(Error::BufferOverflow {
                message_len: encoded_len,
                max_len: self.max_message_len,
            });
        }
        if current > 0 && projected > self.local_threshold {
            self.flush(destination)?;
        }

        let filled = {
            let buffer = self.buffers.entry(destination).or_default();
            let before = buffer.len();
            self.merger.merge(buffer, destination, my_rank, envelope);
            let after = buffer.len();
            self.total_buffered += after - before;
            after
        };
        if filled > self.local_threshold {
            self.flush(destination)?;
        }
        if self.total_buffered > self.global_threshold {
            self.flush_largest()?;
        }
        Ok(())
    }

    /// Hands the buffer for `destination` to the transport, after giving
    /// the cleaner a chance to rewrite it. Empty buffers are left alone.
    pub fn flush(&mut self, destination: Peid) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(&destination) else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }
        let mut outgoing = std::mem::take(buffer);
        self.total_buffered -= outgoing.len();
        self.cleaner.clean(&mut outgoing, destination);
        tracing::trace!(destination, len = outgoing.len(), "flushing send buffer");
        let tag = self.queue.message_tag();
        self.queue.post_vec(outgoing, destination, tag)
    }

    /// Flushes every non-empty buffer, lowest destination first.
    pub fn flush_all(&mut self) -> Result<()> {
        let destinations: Vec<Peid> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(destination, _)| *destination)
            .collect();
        for destination in destinations {
            self.flush(destination)?;
        }
        Ok(())
    }

    fn flush_largest(&mut self) -> Result<()> {
        let mut target: Option<(Peid, usize)> = None;
        for (destination, buffer) in &self.buffers {
            let larger = target.map_or(true, |(_, len)| buffer.len() > len);
            if !buffer.is_empty() && larger {
                target = Some((*destination, buffer.len()));
            }
        }
        match target {
            Some((destination, _)) => self.flush(destination),
            None => Ok(()),
        }
    }

    fn dispatch<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&mut Self, Envelope<'_, Sp::Message>),
    {
        while let Some(buffer) = self.queue.take_ready() {
            let splitter = self.splitter.clone();
            let my_rank = self.queue.rank();
            for envelope in splitter.split(&buffer.data, buffer.source, my_rank) {
                handler(&mut *self, envelope);
            }
        }
        Ok(())
    }

    /// Makes one pass of transport progress and delivers every completed
    /// buffer's messages to `handler`. Handlers may post through the queue
    /// reference they receive.
    pub fn poll<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&mut Self, Envelope<'_, Sp::Message>),
    {
        self.queue.progress()?;
        self.dispatch(handler)
    }

    /// Flushes everything and drives the termination protocol, delivering
    /// messages to `handler` the whole time. Buffers refilled by handlers
    /// while the waves are in flight are flushed straight away, so a
    /// successful return proves every buffer in the group is empty.
    pub fn terminate<H>(&mut self, handler: &mut H) -> Result<bool>
    where
        H: FnMut(&mut Self, Envelope<'_, Sp::Message>),
    {
        if self.queue.is_sealed() {
            return Ok(true);
        }
        self.flush_all()?;
        let clean = termination::detect(self, |q| {
            q.queue.progress()?;
            q.dispatch(&mut *handler)?;
            q.flush_all()
        })?;
        if clean {
            self.queue.seal();
            while !self.queue.transport_idle() {
                self.queue.progress()?;
                self.dispatch(handler)?;
            }
            tracing::debug!(rank = self.queue.rank(), "buffered queue terminated");
        }
        Ok(clean)
    }
}

impl<B, T, Mg, Sp, Cl> termination::RawQueueAccess<B, T> for BufferedQueue<B, T, Mg, Sp, Cl>
where
    B: WireType,
    T: Transport<B>,
{
    fn raw(&mut self) -> &mut MessageQueue<B, T> {
        &mut self.queue
    }
}
