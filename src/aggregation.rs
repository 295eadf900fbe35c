//! Message aggregation codecs.
//!
//! A [`Merger`] appends one logical message into a per-destination send
//! buffer; the matching [`Splitter`] recovers the logical messages from a
//! received buffer on the other side. A [`BufferCleaner`] runs right before
//! a buffer is handed to the transport and may rewrite it in place.
//!
//! Three codec families ship with the crate:
//!
//! - [`AppendMerger`] / [`NoSplitter`]: raw concatenation, the receiver sees
//!   one envelope per transport buffer.
//! - [`SentinelMerger`] / [`SentinelSplitter`]: messages separated by a
//!   sentinel value outside the message alphabet.
//! - [`EnvelopeMerger`] / [`EnvelopeSplitter`]: each message is framed as
//!   `[len, sender, receiver, tag, payload..]` with a configurable
//!   [`EnvelopeFormat`] deciding which metadata fields go on the wire. The
//!   length field counts every element after itself up to the next record.

use std::borrow::Cow;
use std::marker::PhantomData;

use crate::chunks::chunk_by_embedded_size;
use crate::chunks::ChunksByEmbeddedSize;
use crate::transport::WireType;
use crate::{Envelope, Peid};

/// A message value that can be flattened into wire elements.
///
/// Scalars occupy one element; tuples flatten their fields in declaration
/// order, so `WIDTH` is a compile-time constant of the message type.
pub trait WireMessage<B: WireType>: Clone {
    /// Number of wire elements one message value occupies.
    const WIDTH: usize;

    /// Appends this value's wire representation to `out`.
    fn encode(&self, out: &mut Vec<B>);

    /// Rebuilds a value from exactly `WIDTH` wire elements.
    fn decode(chunk: &[B]) -> Self;
}

macro_rules! impl_wire_message_scalar {
    ($($t:ty),*) => {
        $(impl WireMessage<$t> for $t {
            const WIDTH: usize = 1;

            #[inline]
            fn encode(&self, out: &mut Vec<$t>) {
                out.push(*self);
            }

            #[inline]
            fn decode(chunk: &[$t]) -> Self {
                chunk[0]
            }
        })*
    };
}

impl_wire_message_scalar!(i32, i64, u32, u64);

impl<B: WireType, T0: WireMessage<B>, T1: WireMessage<B>> WireMessage<B> for (T0, T1) {
    const WIDTH: usize = T0::WIDTH + T1::WIDTH;

    fn encode(&self, out: &mut Vec<B>) {
        self.0.encode(out);
        self.1.encode(out);
    }

    fn decode(chunk: &[B]) -> Self {
        let (a, b) = chunk.split_at(T0::WIDTH);
        (T0::decode(a), T1::decode(b))
    }
}

impl<B, T0, T1, T2> WireMessage<B> for (T0, T1, T2)
where
    B: WireType,
    T0: WireMessage<B>,
    T1: WireMessage<B>,
    T2: WireMessage<B>,
{
    const WIDTH: usize = T0::WIDTH + T1::WIDTH + T2::WIDTH;

    fn encode(&self, out: &mut Vec<B>) {
        self.0.encode(out);
        self.1.encode(out);
        self.2.encode(out);
    }

    fn decode(chunk: &[B]) -> Self {
        let (a, rest) = chunk.split_at(T0::WIDTH);
        let (b, c) = rest.split_at(T1::WIDTH);
        (T0::decode(a), T1::decode(b), T2::decode(c))
    }
}

/// Appends one logical message into a per-destination buffer.
pub trait Merger<M: Clone, B: WireType> {
    /// Encodes `envelope` at the end of `buffer`.
    fn merge(&self, buffer: &mut Vec<B>, destination: Peid, my_rank: Peid, envelope: Envelope<'_, M>);

    /// Buffer length after `envelope` would be merged, without merging.
    /// Used to decide whether a flush must happen first.
    fn new_buffer_len(
        &self,
        buffer: &[B],
        destination: Peid,
        my_rank: Peid,
        envelope: &Envelope<'_, M>,
    ) -> usize;
}

/// Recovers logical messages from one received transport buffer.
pub trait Splitter<B: WireType> {
    /// The logical message value type this splitter produces.
    type Message: Clone;

    /// Yields the envelopes contained in `buffer`. Payloads borrow the
    /// buffer where the codec permits; they are valid for the duration of
    /// the handler call only.
    fn split<'a>(
        &self,
        buffer: &'a [B],
        origin: Peid,
        my_rank: Peid,
    ) -> impl Iterator<Item = Envelope<'a, Self::Message>>
    where
        Self::Message: 'a;
}

/// Pre-send hook that may rewrite an outgoing buffer in place. Any
/// `FnMut(&mut Vec<B>, Peid)` closure qualifies.
pub trait BufferCleaner<B> {
    fn clean(&mut self, buffer: &mut Vec<B>, destination: Peid);
}

impl<B, F> BufferCleaner<B> for F
where
    F: FnMut(&mut Vec<B>, Peid),
{
    fn clean(&mut self, buffer: &mut Vec<B>, destination: Peid) {
        self(buffer, destination)
    }
}

/// Cleaner that leaves buffers untouched, the builder default.
pub fn noop_cleaner<B>(_buffer: &mut Vec<B>, _destination: Peid) {}

/// Type of the default no-op cleaner.
pub type NoopCleaner<B> = fn(&mut Vec<B>, Peid);

/// Concatenates message payloads with no framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendMerger;

impl<B: WireType> Merger<B, B> for AppendMerger {
    fn merge(
        &self,
        buffer: &mut Vec<B>,
        _destination: Peid,
        _my_rank: Peid,
        envelope: Envelope<'_, B>,
    ) {
        buffer.extend_from_slice(&envelope.message);
    }

    fn new_buffer_len(
        &self,
        buffer: &[B],
        _destination: Peid,
        _my_rank: Peid,
        envelope: &Envelope<'_, B>,
    ) -> usize {
        buffer.len() + envelope.message.len()
    }
}

/// Treats a whole received buffer as a single envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSplitter;

impl<B: WireType> Splitter<B> for NoSplitter {
    type Message = B;

    fn split<'a>(
        &self,
        buffer: &'a [B],
        origin: Peid,
        my_rank: Peid,
    ) -> impl Iterator<Item = Envelope<'a, B>>
    where
        B: 'a,
    {
        std::iter::once(Envelope {
            message: Cow::Borrowed(buffer),
            sender: origin,
            receiver: my_rank,
            tag: 0,
        })
    }
}

/// Terminates every message with a sentinel value.
///
/// The sentinel must not occur inside message payloads.
#[derive(Debug, Clone, Copy)]
pub struct SentinelMerger<B> {
    sentinel: B,
}

impl<B: WireType> SentinelMerger<B> {
    pub fn new(sentinel: B) -> Self {
        Self { sentinel }
    }
}

impl<B: WireType> Merger<B, B> for SentinelMerger<B> {
    fn merge(
        &self,
        buffer: &mut Vec<B>,
        _destination: Peid,
        _my_rank: Peid,
        envelope: Envelope<'_, B>,
    ) {
        buffer.extend_from_slice(&envelope.message);
        buffer.push(self.sentinel);
    }

    fn new_buffer_len(
        &self,
        buffer: &[B],
        _destination: Peid,
        _my_rank: Peid,
        envelope: &Envelope<'_, B>,
    ) -> usize {
        buffer.len() + envelope.message.len() + 1
    }
}

/// Splits a buffer on a sentinel value, one envelope per segment.
#[derive(Debug, Clone, Copy)]
pub struct SentinelSplitter<B> {
    sentinel: B,
}

impl<B: WireType> SentinelSplitter<B> {
    pub fn new(sentinel: B) -> Self {
        Self { sentinel }
    }
}

impl<B: WireType> Splitter<B> for SentinelSplitter<B> {
    type Message = B;

    fn split<'a>(
        &self,
        buffer: &'a [B],
        origin: Peid,
        my_rank: Peid,
    ) -> impl Iterator<Item = Envelope<'a, B>>
    where
        B: 'a,
    {
        let sentinel = self.sentinel;
        // The merger always terminates the buffer with a sentinel; drop it
        // so the split does not produce a trailing empty segment.
        let body = &buffer[..buffer.len().saturating_sub(1)];
        body.split(move |v| *v == sentinel).map(move |segment| Envelope {
            message: Cow::Borrowed(segment),
            sender: origin,
            receiver: my_rank,
            tag: 0,
        })
    }
}

/// Selects which envelope metadata fields travel on the wire.
///
/// When `size` is off, every message must have the same length and
/// `fixed_message_len` carries it (in message values, not wire elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeFormat {
    pub size: bool,
    pub sender: bool,
    pub receiver: bool,
    pub tag: bool,
    pub fixed_message_len: Option<usize>,
}

impl Default for EnvelopeFormat {
    fn default() -> Self {
        Self {
            size: true,
            sender: false,
            receiver: true,
            tag: false,
            fixed_message_len: None,
        }
    }
}

impl EnvelopeFormat {
    /// Number of metadata elements preceding each payload.
    pub fn metadata_len(&self) -> usize {
        usize::from(self.size)
            + usize::from(self.sender)
            + usize::from(self.receiver)
            + usize::from(self.tag)
    }

    fn assert_usable(&self) {
        assert!(
            self.size || self.fixed_message_len.is_some(),
            "envelope format without a size field requires fixed_message_len"
        );
    }
}

/// Frames each message as `[len, sender, receiver, tag, payload..]`, with
/// the fields chosen by an [`EnvelopeFormat`].
///
/// The length field counts everything that follows it within the record,
/// metadata included, so a receiver can cut records out of the buffer
/// without knowing the payload type's width.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeMerger {
    format: EnvelopeFormat,
}

impl EnvelopeMerger {
    pub fn new(format: EnvelopeFormat) -> Self {
        format.assert_usable();
        Self { format }
    }

    pub fn format(&self) -> EnvelopeFormat {
        self.format
    }
}

impl Default for EnvelopeMerger {
    fn default() -> Self {
        Self::new(EnvelopeFormat::default())
    }
}

impl<M: WireMessage<B>, B: WireType> Merger<M, B> for EnvelopeMerger {
    fn merge(
        &self,
        buffer: &mut Vec<B>,
        _destination: Peid,
        _my_rank: Peid,
        envelope: Envelope<'_, M>,
    ) {
        let fmt = self.format;
        let payload_elems = envelope.message.len() * M::WIDTH;
        buffer.reserve(payload_elems + fmt.metadata_len());
        if fmt.size {
            buffer.push(B::from_usize(payload_elems + fmt.metadata_len() - 1));
        }
        if fmt.sender {
            buffer.push(B::from_peid(envelope.sender));
        }
        if fmt.receiver {
            buffer.push(B::from_peid(envelope.receiver));
        }
        if fmt.tag {
            buffer.push(B::from_peid(envelope.tag));
        }
        for value in envelope.message.iter() {
            value.encode(buffer);
        }
    }

    fn new_buffer_len(
        &self,
        buffer: &[B],
        _destination: Peid,
        _my_rank: Peid,
        envelope: &Envelope<'_, M>,
    ) -> usize {
        buffer.len() + envelope.message.len() * M::WIDTH + self.format.metadata_len()
    }
}

/// Decodes buffers produced by [`EnvelopeMerger`] with the same format.
///
/// Metadata fields absent from the wire fall back to what the transport
/// knows: the buffer's origin as sender, the local rank as receiver, tag 0.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeSplitter<M> {
    format: EnvelopeFormat,
    _marker: PhantomData<M>,
}

impl<M> EnvelopeSplitter<M> {
    pub fn new(format: EnvelopeFormat) -> Self {
        format.assert_usable();
        Self {
            format,
            _marker: PhantomData,
        }
    }

    pub fn format(&self) -> EnvelopeFormat {
        self.format
    }
}

impl<M> Default for EnvelopeSplitter<M> {
    fn default() -> Self {
        Self::new(EnvelopeFormat::default())
    }
}

enum Frames<'a, B: WireType> {
    Embedded(ChunksByEmbeddedSize<'a, B>),
    Fixed(std::slice::Chunks<'a, B>),
}

impl<'a, B: WireType> Iterator for Frames<'a, B> {
    type Item = &'a [B];

    fn next(&mut self) -> Option<&'a [B]> {
        match self {
            Frames::Embedded(it) => it.next(),
            Frames::Fixed(it) => it.next(),
        }
    }
}

impl<M: WireMessage<B>, B: WireType> Splitter<B> for EnvelopeSplitter<M> {
    type Message = M;

    fn split<'a>(
        &self,
        buffer: &'a [B],
        origin: Peid,
        my_rank: Peid,
    ) -> impl Iterator<Item = Envelope<'a, M>>
    where
        M: 'a,
    {
        let fmt = self.format;
        let frames = if fmt.size {
            Frames::Embedded(chunk_by_embedded_size(buffer, 0))
        } else {
            let record = fmt.fixed_message_len.unwrap_or(0) * M::WIDTH + fmt.metadata_len();
            Frames::Fixed(buffer.chunks(record.max(1)))
        };
        frames.map(move |record| {
            let mut index = usize::from(fmt.size);
            let mut sender = origin;
            let mut receiver = my_rank;
            let mut tag = 0;
            if fmt.sender {
                sender = record.get(index).copied().map_or(sender, B::to_peid);
                index += 1;
            }
            if fmt.receiver {
                receiver = record.get(index).copied().map_or(receiver, B::to_peid);
                index += 1;
            }
            if fmt.tag {
                tag = record.get(index).copied().map_or(tag, B::to_peid);
                index += 1;
            }
            let payload = record.get(index..).unwrap_or(&[]);
            let message: Vec<M> = payload.chunks_exact(M::WIDTH).map(M::decode).collect();
            Envelope {
                message: Cow::Owned(message),
                sender,
                receiver,
                tag,
            }
        })
    }
}
