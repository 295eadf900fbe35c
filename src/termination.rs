//! Distributed termination detection.
//!
//! Two-wave counter protocol. Every rank first drains locally until nothing
//! is pending, then enters a nonblocking barrier (wave one). The barrier
//! establishes a global cut: every send posted before any rank leaves the
//! barrier has been initiated everywhere. At barrier completion each rank
//! snapshots its local sent/received counters and contributes them to a
//! nonblocking all-reduce (wave two), polling for new traffic the whole
//! time. The group is quiescent exactly when the global sums agree and no
//! local send was posted after the snapshot; otherwise the caller loops and
//! the protocol starts over on the next call.

use crate::error::Result;
use crate::queue::MessageQueue;
use crate::transport::{Transport, WireType};

/// Glue that lets every queue layer drive the detector while keeping
/// message dispatch in its own hands.
pub(crate) trait RawQueueAccess<B: WireType, T: Transport<B>> {
    fn raw(&mut self) -> &mut MessageQueue<B, T>;
}

/// Runs one full pass of the protocol. `step` performs one unit of local
/// progress: transport polling, dispatching staged messages to the user
/// handler, and whatever upper-layer housekeeping (such as flushing refilled
/// aggregation buffers) must keep happening while the waves are in flight.
pub(crate) fn detect<B, T, Q, S>(owner: &mut Q, mut step: S) -> Result<bool>
where
    B: WireType,
    T: Transport<B>,
    Q: RawQueueAccess<B, T>,
    S: FnMut(&mut Q) -> Result<()>,
{
    loop {
        step(owner)?;
        if owner.raw().is_quiet()? {
            break;
        }
    }
    tracing::trace!(rank = owner.raw().rank(), "local drain complete");

    let mut barrier = owner.raw().begin_barrier()?;
    loop {
        step(owner)?;
        if owner.raw().poll_collective(&mut barrier)?.is_some() {
            break;
        }
    }

    let snapshot = owner.raw().counters();
    let mut reduce = owner.raw().begin_allreduce(snapshot)?;
    let totals = loop {
        step(owner)?;
        if let Some(totals) = owner.raw().poll_collective(&mut reduce)? {
            break totals;
        }
    };

    let sent_now = owner.raw().counters()[0];
    let clean = totals[0] == totals[1] && sent_now == snapshot[0];
    tracing::debug!(
        rank = owner.raw().rank(),
        sent_global = totals[0],
        received_global = totals[1],
        quiescent = clean,
        "termination wave finished"
    );
    Ok(clean)
}
