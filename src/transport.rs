//! Transport façade shared by all queue layers.
//!
//! A [`Transport`] is a thin adapter over a point-to-point message fabric
//! for a fixed group of ranks: nonblocking tagged sends and receives, a
//! probe that reports the element count of a pending message without
//! consuming it, request polling, and nonblocking barrier / all-reduce
//! collectives. Queue layers own their transport value outright, so two
//! transports over the same rank group never observe each other's traffic.

use crate::error::Result;
use crate::{Peid, Tag};

/// Element types a transport can move natively.
///
/// Buffers on the wire are flat sequences of one of these types. The
/// conversions exist so codecs can embed lengths and rank identifiers
/// directly into a buffer; they truncate like `as` casts, which is fine for
/// the value ranges a rank group can produce.
pub trait WireType:
    Copy + Default + PartialEq + std::fmt::Debug + Send + 'static
{
    fn from_usize(v: usize) -> Self;
    fn to_usize(self) -> usize;
    fn from_peid(v: Peid) -> Self;
    fn to_peid(self) -> Peid;
}

macro_rules! impl_wire_type {
    ($($t:ty),*) => {
        $(impl WireType for $t {
            #[inline]
            fn from_usize(v: usize) -> Self {
                v as $t
            }
            #[inline]
            fn to_usize(self) -> usize {
                self as usize
            }
            #[inline]
            fn from_peid(v: Peid) -> Self {
                v as $t
            }
            #[inline]
            fn to_peid(self) -> Peid {
                self as Peid
            }
        })*
    };
}

impl_wire_type!(i32, i64, u32, u64);

/// Result of a successful probe: a message is pending and can be received
/// with a matching [`Transport::irecv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Rank that sent the pending message.
    pub source: Peid,
    /// Tag the message was sent with.
    pub tag: Tag,
    /// Payload length in buffer elements.
    pub len: usize,
}

/// Nonblocking transport over a fixed rank group.
///
/// Matching contract: between sends from one source with one tag, delivery
/// is FIFO, and a probe followed by a matching `irecv` consumes exactly the
/// probed message. Posted receives claim their message eagerly, so a probe
/// never reports a message twice.
pub trait Transport<B: WireType> {
    /// Handle for an in-flight send.
    type SendRequest;
    /// Handle for an in-flight receive.
    type RecvRequest;
    /// Handle for an in-flight barrier or all-reduce.
    type CollectiveRequest;

    /// This endpoint's rank, in `[0, size)`.
    fn rank(&self) -> Peid;

    /// Number of ranks in the group.
    fn size(&self) -> Peid;

    /// Starts a nonblocking send. The transport owns `buf` until the
    /// request completes.
    fn isend(&mut self, buf: Vec<B>, dest: Peid, tag: Tag) -> Result<Self::SendRequest>;

    /// Checks for a pending message with the given tag from any source,
    /// without consuming it.
    fn iprobe(&mut self, tag: Tag) -> Result<Option<ProbeInfo>>;

    /// Starts a nonblocking receive into `buf` for the next message from
    /// `source` with `tag`. `buf` must be sized from a preceding probe.
    fn irecv(&mut self, buf: Vec<B>, source: Peid, tag: Tag) -> Result<Self::RecvRequest>;

    /// Polls a send request. Returns `true` once the transport has released
    /// the buffer.
    fn test_send(&mut self, req: &mut Self::SendRequest) -> Result<bool>;

    /// Polls a receive request, yielding the filled buffer on completion.
    /// Completion consumes the buffer; later polls yield nothing.
    fn test_recv(&mut self, req: &mut Self::RecvRequest) -> Result<Option<Vec<B>>>;

    /// Starts a nonblocking barrier over all ranks, carried on `tag`.
    /// Every rank must start its collectives in the same order with the
    /// same tags.
    fn ibarrier(&mut self, tag: Tag) -> Result<Self::CollectiveRequest>;

    /// Starts a nonblocking element-wise sum over all ranks'
    /// contributions, carried on `tag`.
    fn iallreduce_sum(
        &mut self,
        contribution: [u64; 2],
        tag: Tag,
    ) -> Result<Self::CollectiveRequest>;

    /// Polls a collective. A completed barrier yields `[0, 0]`; a completed
    /// all-reduce yields the global sums.
    fn test_collective(&mut self, req: &mut Self::CollectiveRequest) -> Result<Option<[u64; 2]>>;
}
