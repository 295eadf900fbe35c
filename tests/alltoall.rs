//! All-to-all exchange scenarios, one OS thread per rank over the
//! in-process mesh.

use std::thread;

use bulkmq::{
    create_mesh, BufferedQueueBuilder, EnvelopeMerger, EnvelopeSplitter, GridScheme,
    IndirectionAdapter, MeshTransport, Transport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_LOCAL_ELEMENTS: usize = 1_000_000;
const RANKS: usize = 4;

/// Runs `f` on every endpoint of a fresh mesh, each on its own thread, and
/// collects the per-rank results.
fn spawn_ranks<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(MeshTransport<i32>) -> R + Clone + Send + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = create_mesh::<i32>(size)
        .into_iter()
        .map(|transport| {
            let f = f.clone();
            thread::spawn(move || f(transport))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_alltoall_scalar() {
    let results = spawn_ranks(RANKS, |transport| {
        let rank = transport.rank();
        let size = transport.size();
        let mut rng = StdRng::seed_from_u64(rank as u64);
        let data: Vec<i32> = (0..NUM_LOCAL_ELEMENTS)
            .map(|_| rng.gen_range(0..size))
            .collect();

        let mut queue = BufferedQueueBuilder::new(transport).build();
        queue.synchronous_mode();

        for &value in &data {
            queue.post_message_blocking(&[value], value).unwrap();
        }

        let mut received: Vec<i32> = Vec::new();
        loop {
            let done = queue
                .terminate(&mut |_q, env| received.extend_from_slice(&env.message))
                .unwrap();
            if done {
                break;
            }
        }

        assert!(received.iter().all(|&v| v == rank));
        (queue.local_sent(), queue.local_received(), received.len())
    });

    let delivered: usize = results.iter().map(|(_, _, n)| n).sum();
    assert_eq!(delivered, NUM_LOCAL_ELEMENTS * RANKS);
    let sent: u64 = results.iter().map(|(s, _, _)| s).sum();
    let received: u64 = results.iter().map(|(_, r, _)| r).sum();
    assert_eq!(sent, received);
}

#[test]
fn test_alltoall_tuple() {
    let results = spawn_ranks(RANKS, |transport| {
        let rank = transport.rank();
        let size = transport.size();
        let mut rng = StdRng::seed_from_u64(100 + rank as u64);
        let data: Vec<(i32, i32)> = (0..NUM_LOCAL_ELEMENTS)
            .map(|_| (rng.gen_range(0..size), rank))
            .collect();

        let mut queue = BufferedQueueBuilder::new(transport)
            .with_merger(EnvelopeMerger::default())
            .with_splitter(EnvelopeSplitter::<(i32, i32)>::default())
            .build();
        queue.synchronous_mode();

        for &(destination, source) in &data {
            queue
                .post_message_blocking(&[(destination, source)], destination)
                .unwrap();
        }

        let mut received: Vec<(i32, i32)> = Vec::new();
        loop {
            let done = queue
                .terminate(&mut |_q, env| received.extend_from_slice(&env.message))
                .unwrap();
            if done {
                break;
            }
        }

        for &(destination, source) in &received {
            assert_eq!(destination, rank);
            assert!((0..size).contains(&source));
        }
        received.len()
    });

    assert_eq!(results.iter().sum::<usize>(), NUM_LOCAL_ELEMENTS * RANKS);
}

#[test]
fn test_alltoall_with_grid_indirection() {
    let side = 2; // 4 ranks arrange as a 2 x 2 grid
    let results = spawn_ranks(RANKS, move |transport| {
        let rank = transport.rank();
        let size = transport.size();
        let mut rng = StdRng::seed_from_u64(200 + rank as u64);
        let data: Vec<i32> = (0..NUM_LOCAL_ELEMENTS)
            .map(|_| rng.gen_range(0..size))
            .collect();

        let queue = BufferedQueueBuilder::new(transport)
            .with_merger(EnvelopeMerger::default())
            .with_splitter(EnvelopeSplitter::<i32>::default())
            .build();
        let mut queue = IndirectionAdapter::new(queue, GridScheme::new(rank, size));
        queue.synchronous_mode();

        for &value in &data {
            queue.post_message_blocking(&[value], value).unwrap();
        }

        let mut received: Vec<i32> = Vec::new();
        loop {
            let done = queue
                .terminate(&mut |_q, env| received.extend_from_slice(&env.message))
                .unwrap();
            if done {
                break;
            }
        }

        assert!(received.iter().all(|&v| v == rank));

        // routing keeps the transport traffic inside this rank's grid row
        // and column
        let sends = queue.transport().data_sends_by_peer().to_vec();
        for (peer, count) in sends.iter().enumerate() {
            if *count > 0 {
                let peer = peer as i32;
                assert!(
                    peer / side == rank / side || peer % side == rank % side,
                    "rank {rank} sent data to {peer}, outside its row and column"
                );
            }
        }
        let distinct_peers = sends.iter().filter(|&&n| n > 0).count();
        assert!(distinct_peers <= 2 * side as usize);

        received.len()
    });

    assert_eq!(results.iter().sum::<usize>(), NUM_LOCAL_ELEMENTS * RANKS);
}

#[test]
fn test_two_queues_on_independent_groups_do_not_interfere() {
    const MESSAGES: usize = 5;
    let first_group = create_mesh::<i32>(RANKS);
    let second_group = create_mesh::<i32>(RANKS);

    let handles: Vec<_> = first_group
        .into_iter()
        .zip(second_group)
        .map(|(ta, tb)| {
            thread::spawn(move || {
                let rank = ta.rank();
                let size = ta.size();
                let mut first = BufferedQueueBuilder::new(ta).build();
                let mut second = BufferedQueueBuilder::new(tb).build();
                first.synchronous_mode();
                second.synchronous_mode();

                let mut rng = StdRng::seed_from_u64(300 + rank as u64);
                for _ in 0..MESSAGES {
                    let destination = rng.gen_range(0..size);
                    first.post_one(1, destination).unwrap();
                    second.post_one(2, destination).unwrap();
                }

                let mut second_values: Vec<i32> = Vec::new();
                loop {
                    let done = second
                        .terminate(&mut |_q, env| second_values.extend_from_slice(&env.message))
                        .unwrap();
                    if done {
                        break;
                    }
                }
                let mut first_values: Vec<i32> = Vec::new();
                loop {
                    let done = first
                        .terminate(&mut |_q, env| first_values.extend_from_slice(&env.message))
                        .unwrap();
                    if done {
                        break;
                    }
                }

                assert!(first_values.iter().all(|&v| v == 1));
                assert!(second_values.iter().all(|&v| v == 2));
                (first_values.len(), second_values.len())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let first_total: usize = results.iter().map(|(a, _)| a).sum();
    let second_total: usize = results.iter().map(|(_, b)| b).sum();
    assert_eq!(first_total, MESSAGES * RANKS);
    assert_eq!(second_total, MESSAGES * RANKS);
}
