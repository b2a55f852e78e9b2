use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use winmount_client::sync::channel;

#[test]
fn test_slots_reused_through_tiny_buffer() {
    let (tx, rx) = channel::<u64>(2).expect("channel");
    const COUNT: u64 = 50_000;

    let producer = thread::spawn(move || {
        for i in 0..COUNT {
            tx.send(i).expect("receiver alive");
        }
    });

    let received: Vec<u64> = rx.into_iter().collect();
    producer.join().expect("producer panicked");

    assert_eq!(received.len() as u64, COUNT);
    assert!(received.iter().enumerate().all(|(i, v)| *v == i as u64));
}

#[test]
fn test_producers_racing_on_shared_buffer() {
    let (tx, mut rx) = channel::<(usize, u32)>(8).expect("channel");
    const PRODUCERS: usize = 6;
    const PER_PRODUCER: u32 = 20_000;

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    // Mix both paths: spin on try_send a few times, then block.
                    let mut pending = Some((p, i));
                    for _ in 0..3 {
                        let Some(item) = pending.take() else { break };
                        if let Err(back) = tx.try_send(item) {
                            pending = Some(back);
                            thread::yield_now();
                        }
                    }
                    if let Some(item) = pending {
                        tx.send(item).expect("receiver alive");
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let mut next: HashMap<usize, u32> = HashMap::new();
    let mut total = 0;
    while let Some((p, i)) = rx.recv() {
        let expected = next.entry(p).or_insert(0);
        assert_eq!(i, *expected, "producer {p} delivered out of order");
        *expected += 1;
        total += 1;
    }
    for handle in handles {
        handle.join().expect("producer panicked");
    }

    assert_eq!(total, PRODUCERS * PER_PRODUCER as usize);
    assert!(rx.is_disconnected());
}

#[test]
fn test_sender_sees_receiver_leave() {
    let (tx, rx) = channel::<String>(4).expect("channel");
    assert!(!tx.is_disconnected());

    let watcher = thread::spawn(move || {
        while !tx.is_disconnected() {
            thread::sleep(Duration::from_millis(1));
        }
        tx.send("too late".to_string()).unwrap_err().into_inner()
    });

    thread::sleep(Duration::from_millis(20));
    drop(rx);
    assert_eq!(watcher.join().expect("watcher panicked"), "too late");
}
