//! Registry behavior under concurrent registration and release.

use std::sync::Arc;
use std::thread;

use ism_buffer::{BufferRegistry, Order};

#[test]
fn concurrent_register_and_release_balance_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(BufferRegistry::with_dir(dir.path().to_path_buf()));

    let array = Arc::new(
        registry
            .create("shared-frame", (16, 16), Order::F)
            .expect("create"),
    );

    const PER_THREAD: usize = 50;
    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        let array = array.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..PER_THREAD {
                registry.register_for_transfer(array.clone());
            }
        }));
    }
    for handle in handles {
        handle.join().expect("registration thread");
    }
    assert_eq!(registry.pending("shared-frame"), 4 * PER_THREAD);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..PER_THREAD {
                registry.release("shared-frame").expect("release");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("release thread");
    }
    assert_eq!(registry.pending("shared-frame"), 0);
    assert!(registry.release("shared-frame").is_err());
}

#[test]
fn distinct_names_are_independent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = BufferRegistry::with_dir(dir.path().to_path_buf());

    for i in 0..3 {
        let name = format!("seq-{i}");
        let array = Arc::new(registry.create(&name, (4, 4), Order::F).expect("create"));
        registry.register_for_transfer(array);
    }
    registry.release("seq-1").expect("release middle name");
    assert_eq!(registry.pending("seq-0"), 1);
    assert_eq!(registry.pending("seq-1"), 0);
    assert_eq!(registry.pending("seq-2"), 1);
}
