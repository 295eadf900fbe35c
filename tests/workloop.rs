//! Branching task workloop driven to distributed quiescence.
//!
//! Every rank seeds a fixed number of tasks. A task is a flat record
//! `[ttl, hops, trace..]`: processing a live task decrements its
//! time-to-live, bumps the hop count, appends the local rank to the trace
//! and forwards copies to randomly chosen ranks with a random branching
//! factor. A task whose time-to-live reached zero is consumed, and its hop
//! count must equal the length of its trace. Total work is bounded, so the
//! terminate loop must finish.

use std::collections::VecDeque;
use std::thread;

use bulkmq::{
    create_mesh, BufferedQueueBuilder, EnvelopeMerger, EnvelopeSplitter, GridScheme,
    IndirectionAdapter, MeshTransport, SentinelMerger, SentinelSplitter, Transport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const INITIAL_TASKS: usize = 1000;
const RANKS: usize = 4;

fn seed_tasks(rng: &mut StdRng) -> VecDeque<Vec<i32>> {
    (0..INITIAL_TASKS)
        .map(|_| vec![rng.gen_range(5..=10), 0])
        .collect()
}

fn process(
    task: &mut Vec<i32>,
    rank: i32,
    size: i32,
    rng: &mut StdRng,
    mut forward: impl FnMut(&[i32], i32),
) -> bool {
    let ttl = task[0];
    if ttl > 0 {
        task[0] -= 1;
        task[1] += 1;
        task.push(rank);
        let branching = rng.gen_range(1..=4);
        for _ in 0..branching {
            forward(task, rng.gen_range(0..size));
        }
        false
    } else {
        assert_eq!(
            task[1] as usize,
            task.len() - 2,
            "hop count must match the trace length"
        );
        true
    }
}

#[test]
fn test_workloop_terminates_with_matching_traces() {
    let handles: Vec<_> = create_mesh::<i32>(RANKS)
        .into_iter()
        .map(|transport| thread::spawn(move || drive_workloop(transport)))
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let sent: u64 = results.iter().map(|(s, _, _)| s).sum();
    let received: u64 = results.iter().map(|(_, r, _)| r).sum();
    assert_eq!(sent, received);
    let consumed: usize = results.iter().map(|(_, _, c)| c).sum();
    assert!(consumed > 0);
}

fn drive_workloop(transport: MeshTransport<i32>) -> (u64, u64, usize) {
    let rank = transport.rank();
    let size = transport.size();
    let mut rng = StdRng::seed_from_u64(rank as u64);
    let mut tasks = seed_tasks(&mut rng);

    let mut queue = BufferedQueueBuilder::new(transport)
        .with_merger(SentinelMerger::new(-1))
        .with_splitter(SentinelSplitter::new(-1))
        .build();

    let mut consumed = 0;
    loop {
        while let Some(mut task) = tasks.pop_front() {
            let finished = process(&mut task, rank, size, &mut rng, |task, receiver| {
                queue.post_message_blocking(task, receiver).unwrap();
            });
            if finished {
                consumed += 1;
            }
        }
        let done = queue
            .terminate(&mut |_q, env| tasks.push_back(env.message.to_vec()))
            .unwrap();
        if done {
            break;
        }
    }
    (queue.local_sent(), queue.local_received(), consumed)
}

#[test]
fn test_workloop_with_grid_indirection() {
    let handles: Vec<_> = create_mesh::<i32>(RANKS)
        .into_iter()
        .map(|transport| thread::spawn(move || drive_workloop_indirect(transport)))
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let sent: u64 = results.iter().map(|(s, _, _)| s).sum();
    let received: u64 = results.iter().map(|(_, r, _)| r).sum();
    assert_eq!(sent, received);
    let consumed: usize = results.iter().map(|(_, _, c)| c).sum();
    assert!(consumed > 0);
}

fn drive_workloop_indirect(transport: MeshTransport<i32>) -> (u64, u64, usize) {
    let rank = transport.rank();
    let size = transport.size();
    let mut rng = StdRng::seed_from_u64(1000 + rank as u64);
    let mut tasks = seed_tasks(&mut rng);

    let queue = BufferedQueueBuilder::new(transport)
        .with_merger(EnvelopeMerger::default())
        .with_splitter(EnvelopeSplitter::<i32>::default())
        .build();
    let mut queue = IndirectionAdapter::new(queue, GridScheme::new(rank, size));

    let mut consumed = 0;
    loop {
        while let Some(mut task) = tasks.pop_front() {
            let finished = process(&mut task, rank, size, &mut rng, |task, receiver| {
                queue.post_message_blocking(task, receiver).unwrap();
            });
            if finished {
                consumed += 1;
            }
        }
        let done = queue
            .terminate(&mut |_q, env| tasks.push_back(env.message.to_vec()))
            .unwrap();
        if done {
            break;
        }
    }
    (queue.local_sent(), queue.local_received(), consumed)
}
