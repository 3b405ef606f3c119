//! Integration tests for the connection pool

use mockall::{mock, Sequence};
use probe_core::dslx::{Closer, ConnPool};
use std::io;
use std::sync::Arc;

mock! {
    pub Handle {}

    impl Closer for Handle {
        fn close(&self) -> io::Result<()>;
    }
}

fn handle(seq: &mut Sequence) -> Arc<dyn Closer> {
    let mut mock = MockHandle::new();
    mock.expect_close().times(1).in_sequence(seq).returning(|| Ok(()));
    Arc::new(mock)
}

#[test]
fn test_close_in_reverse_order() {
    let mut seq = Sequence::new();
    // expectations are checked in creation order: create the last tracked first
    let third = handle(&mut seq);
    let second = handle(&mut seq);
    let first = handle(&mut seq);

    let pool = ConnPool::new();
    pool.track(Some(first));
    pool.track(Some(second));
    pool.track(Some(third));
    pool.close();
    pool.close();
    assert!(pool.is_empty());
}

#[test]
fn test_failing_close_does_not_stop_others() {
    let mut seq = Sequence::new();
    let mut failing = MockHandle::new();
    failing
        .expect_close()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Err(io::Error::from(io::ErrorKind::NotConnected)));
    let first = handle(&mut seq);

    let pool = ConnPool::new();
    pool.track(Some(first));
    pool.track(Some(Arc::new(failing)));
    pool.close();
}

#[test]
fn test_drop_closes() {
    let mut seq = Sequence::new();
    let pool = ConnPool::new();
    pool.track(Some(handle(&mut seq)));
    drop(pool);
}

#[test]
fn test_concurrent_track() {
    let pool = Arc::new(ConnPool::new());
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0..8 {
                    let mut mock = MockHandle::new();
                    mock.expect_close().times(1).returning(|| Ok(()));
                    pool.track(Some(Arc::new(mock)));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(pool.len(), 32);
    pool.close();
    assert!(pool.is_empty());
}
