use ndarray::{Array2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use spiral_robust::center::{CenterReduce, LocalReduce, ReduceError, RendezvousReduce, RunningCenter};
use std::sync::mpsc;
use std::time::Duration;

fn rows(seed: u64, count: usize, dim: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((count, dim), |_| rng.gen_range(-1.0f32..1.0))
}

#[test]
fn rendezvous_sums_buffers_across_workers() {
    let world = 3;
    let mut handles = Vec::new();
    for rank in 0..world {
        handles.push(std::thread::spawn(move || {
            let reduce = RendezvousReduce::join("center-sum", rank, world).unwrap();
            let mut buffer = vec![rank as f32, 1.0];
            reduce.all_reduce_sum(&mut buffer).unwrap();
            buffer
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![3.0, 3.0]);
    }
}

#[test]
fn uneven_batches_average_by_row_count() {
    let world = 2;
    let mut handles = Vec::new();
    for rank in 0..world {
        handles.push(std::thread::spawn(move || {
            let reduce = RendezvousReduce::join("center-uneven", rank, world).unwrap();
            let mut center = RunningCenter::new(2, 0.0, reduce).unwrap();
            let batch = if rank == 0 {
                Array2::zeros((1, 2))
            } else {
                Array2::from_elem((3, 2), 4.0f32)
            };
            center.update(&batch).unwrap().to_vec()
        }));
    }
    for handle in handles {
        let center = handle.join().unwrap();
        assert!((center[0] - 3.0).abs() < 1e-6);
        assert!((center[1] - 3.0).abs() < 1e-6);
    }
}

#[test]
fn distributed_center_matches_a_single_worker_over_all_rows() {
    let world = 3;
    let steps = 5;
    let dim = 4;
    let mut handles = Vec::new();
    for rank in 0..world {
        handles.push(std::thread::spawn(move || {
            let reduce = RendezvousReduce::join("center-steps", rank, world).unwrap();
            let mut center = RunningCenter::new(dim, 0.9, reduce).unwrap();
            for step in 0..steps {
                let seed = (step * world + rank) as u64;
                center.update(&rows(seed, 2, dim)).unwrap();
            }
            center.center().to_vec()
        }));
    }
    let distributed: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut local = RunningCenter::new(dim, 0.9, LocalReduce).unwrap();
    for step in 0..steps {
        let parts: Vec<Array2<f32>> = (0..world)
            .map(|rank| rows((step * world + rank) as u64, 2, dim))
            .collect();
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let all = ndarray::concatenate(Axis(0), &views).unwrap();
        local.update(&all).unwrap();
    }
    for center in distributed {
        for (a, b) in center.iter().zip(local.center().iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}

#[test]
fn mismatched_widths_fail_every_participant() {
    let world = 2;
    let mut handles = Vec::new();
    for rank in 0..world {
        handles.push(std::thread::spawn(move || {
            let reduce = RendezvousReduce::join("center-mismatch", rank, world).unwrap();
            let dim = 2 + rank;
            let mut center = RunningCenter::new(dim, 0.5, reduce).unwrap();
            center.update(&Array2::ones((1, dim))).map(|c| c.to_vec())
        }));
    }
    for handle in handles {
        assert!(matches!(
            handle.join().unwrap(),
            Err(ReduceError::BufferLengthMismatch { .. })
        ));
    }
}

#[test]
fn late_rank_joins_the_failed_round_and_the_group_recovers() {
    let world = 3;
    let (sender, receiver) = mpsc::channel();
    for rank in 0..world {
        let sender = sender.clone();
        std::thread::spawn(move || {
            let reduce = RendezvousReduce::join("center-late", rank, world).unwrap();
            if rank == 2 {
                std::thread::sleep(Duration::from_millis(50));
            }
            let width = if rank == 1 { 3 } else { 2 };
            let mut buffer = vec![1.0f32; width];
            let failed = reduce.all_reduce_sum(&mut buffer);

            let mut buffer = vec![rank as f32, 1.0];
            let recovered = reduce.all_reduce_sum(&mut buffer).map(|_| buffer);
            sender.send((rank, failed, recovered)).unwrap();
        });
    }
    drop(sender);

    let mut seen = Vec::new();
    for _ in 0..world {
        let (rank, failed, recovered) = receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("a rank stayed blocked in the reduce");
        assert!(
            matches!(failed, Err(ReduceError::BufferLengthMismatch { .. })),
            "rank {rank} got {failed:?}"
        );
        assert_eq!(recovered.unwrap(), vec![3.0, 3.0]);
        seen.push(rank);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn join_validates_ranks_and_world_size() {
    assert_eq!(
        RendezvousReduce::join("center-join", 0, 0).unwrap_err(),
        ReduceError::EmptyWorldSize(0)
    );
    assert_eq!(
        RendezvousReduce::join("center-join", 2, 2).unwrap_err(),
        ReduceError::RankOutOfBounds { rank: 2, world_size: 2 }
    );
    let first = RendezvousReduce::join("center-join", 0, 2).unwrap();
    assert_eq!(
        RendezvousReduce::join("center-join", 0, 2).unwrap_err(),
        ReduceError::DuplicateRank { rank: 0 }
    );
    assert_eq!(
        RendezvousReduce::join("center-join", 1, 3).unwrap_err(),
        ReduceError::WorldSizeMismatch { expected: 2, got: 3 }
    );
    assert_eq!(first.world_size(), 2);
    drop(first);

    // The group is released with its last member and can be re-formed.
    let solo = RendezvousReduce::join("center-join", 0, 1).unwrap();
    let mut buffer = vec![2.5f32];
    solo.all_reduce_sum(&mut buffer).unwrap();
    assert_eq!(buffer, vec![2.5]);
}
