// File-backed queue behavior across close and reopen.
use std::path::Path;
use std::thread;

use mpsclog::api::{DurableLog, ErrorKind, Pool, PoolOptions, Queue};

fn open(path: &Path, workers: usize) -> Queue<Pool> {
    let pool = Pool::open(path).expect("open pool");
    Queue::new(DurableLog::open(pool).expect("log"), workers).expect("queue")
}

fn drain(queue: &Queue<Pool>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while queue
        .try_consume_batch(|batch| {
            out.extend(batch.entries().map(<[u8]>::to_vec));
            Ok(())
        })
        .expect("consume")
    {}
    out
}

#[test]
fn records_survive_reopen() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    drop(Pool::create(&path, PoolOptions::new(4096)).expect("create"));

    {
        let queue = open(&path, 1);
        assert!(drain(&queue).is_empty());
        let mut worker = queue.register_worker().expect("worker");
        for i in 0..10u32 {
            let payload = format!("record-{i}").repeat(i as usize + 1);
            assert!(worker.try_produce(payload.as_bytes()).expect("produce"));
        }
    }

    let queue = open(&path, 1);
    let expected: Vec<Vec<u8>> = (0..10u32)
        .map(|i| format!("record-{i}").repeat(i as usize + 1).into_bytes())
        .collect();
    assert_eq!(drain(&queue), expected);
    let checkpoint = queue.consumed_offset();
    drop(queue);

    let queue = open(&path, 1);
    assert_eq!(queue.consumed_offset(), checkpoint);
    assert!(drain(&queue).is_empty());
}

#[test]
fn partial_drain_resumes_from_checkpoint() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    drop(Pool::create(&path, PoolOptions::new(2048)).expect("create"));

    {
        let queue = open(&path, 1);
        assert!(drain(&queue).is_empty());
        let mut worker = queue.register_worker().expect("worker");
        assert!(worker.try_produce(b"one").expect("produce"));
        assert!(worker.try_produce(b"two").expect("produce"));
        assert_eq!(drain(&queue), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(worker.try_produce(b"three").expect("produce"));
    }

    let queue = open(&path, 1);
    assert_eq!(drain(&queue), vec![b"three".to_vec()]);
}

#[test]
fn threads_share_a_file_backed_queue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    drop(Pool::create(&path, PoolOptions::new(64 * 1024)).expect("create"));

    let queue = open(&path, 4);
    assert!(drain(&queue).is_empty());
    thread::scope(|scope| {
        for t in 0..4u8 {
            let queue = &queue;
            scope.spawn(move || {
                let mut worker = queue.register_worker().expect("worker");
                for i in 0..50u8 {
                    assert!(worker.try_produce(&[t, i, 0xaa]).expect("produce"));
                }
            });
        }
    });

    let mut got = drain(&queue);
    assert_eq!(got.len(), 200);
    got.sort();
    got.dedup();
    assert_eq!(got.len(), 200);
}

#[test]
fn open_pool_is_locked() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    let _pool = Pool::create(&path, PoolOptions::new(4096)).expect("create");
    let err = Pool::open(&path).err().expect("locked");
    assert_eq!(err.kind(), ErrorKind::Busy);
}
