//! bulkmq - asynchronous message queue with per-destination aggregation for
//! fixed-size rank groups.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ IndirectionAdapter          relay routing over embedded        │
//! │                             receivers (optional)               │
//! ├────────────────────────────────────────────────────────────────┤
//! │ BufferedQueue               per-destination buffers, merger /  │
//! │                             splitter / cleaner codecs, flush   │
//! │                             thresholds                         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ MessageQueue                nonblocking post / probe / receive,│
//! │                             request slots, termination waves   │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Transport                   send, sized probe, receive,        │
//! │ (trait; MeshTransport       request polling, barrier,          │
//! │  ships in-process)          all-reduce                         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every queue is driven by exactly one thread through cooperative polling:
//! all transport progress happens inside `post`, `poll`, `flush` and
//! `terminate`, and message handlers run on the polling thread. Handlers
//! receive a `&mut` reference to the queue and may post new messages
//! through it.
//!
//! Termination is decided by a two-wave counter protocol: once a rank has
//! nothing pending it enters a barrier, snapshots how much it has sent and
//! received, and joins an all-reduce of those counters. The group is done
//! exactly when the global sums agree and nothing was posted after the
//! snapshot; until then, callers loop:
//!
//! ```ignore
//! loop {
//!     // ... drain application work, posting as needed ...
//!     if queue.terminate(&mut on_message)? {
//!         break;
//!     }
//! }
//! ```

pub mod aggregation;
pub mod buffered;
pub mod chunks;
pub mod error;
pub mod indirection;
pub mod mesh;
pub mod queue;
mod termination;
pub mod transport;

use std::borrow::Cow;

/// Rank identifier within a group, always in `[0, size)`.
pub type Peid = i32;

/// Message tag.
pub type Tag = i32;

/// One logical message together with its routing metadata.
///
/// The payload borrows the queue's receive buffer where the codec permits
/// and is only valid for the duration of the handler call; handlers that
/// keep message data copy it out.
#[derive(Debug, Clone)]
pub struct Envelope<'a, M: Clone> {
    pub message: Cow<'a, [M]>,
    pub sender: Peid,
    pub receiver: Peid,
    pub tag: Tag,
}

pub use aggregation::{
    noop_cleaner, AppendMerger, BufferCleaner, EnvelopeFormat, EnvelopeMerger, EnvelopeSplitter,
    Merger, NoSplitter, NoopCleaner, SentinelMerger, SentinelSplitter, Splitter, WireMessage,
};
pub use buffered::{BufferedQueue, BufferedQueueBuilder, DEFAULT_LOCAL_THRESHOLD};
pub use chunks::{chunk_by_embedded_size, ChunksByEmbeddedSize};
pub use error::{Error, Result};
pub use indirection::{
    GridScheme, IndirectionAdapter, IndirectionScheme, NoopScheme, RoutedQueue,
};
pub use mesh::{create_mesh, MeshTransport};
pub use queue::{MessageQueue, QueueConfig};
pub use transport::{ProbeInfo, Transport, WireType};
