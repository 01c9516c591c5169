use anyhow::Result;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use ipc_substrate::net::{Chain, Utimer};

/// Timer items scheduled out of order fire in expiry order at roughly
/// their requested delays, and a cross-thread stop ends the chain.
///
/// This is the core reactor smoke test: a chain, a utimer, three items at
/// 100, 50 and 200 ms, a stop at 500 ms.
#[test]
fn chain_fires_timers_in_order() -> Result<()> {
    let (tx, rx) = mpsc::channel();

    let worker = std::thread::spawn(move || {
        let chain = Chain::new().unwrap();
        let timer = Utimer::new(&chain, "scenario");
        let started = Instant::now();
        let fired: Rc<RefCell<Vec<(u64, Duration)>>> = Rc::new(RefCell::new(Vec::new()));

        for delay_ms in [100u64, 50, 200] {
            let fired = Rc::clone(&fired);
            timer.add(delay_ms, Duration::from_millis(delay_ms), move || {
                fired.borrow_mut().push((delay_ms, started.elapsed()));
            });
        }

        tx.send(chain.controller()).unwrap();
        chain.run().unwrap();
        let result = fired.borrow().clone();
        result
    });

    let controller = rx.recv()?;
    std::thread::sleep(Duration::from_millis(500));
    controller.stop().unwrap();
    let fired = worker.join().unwrap();

    let order: Vec<u64> = fired.iter().map(|(k, _)| *k).collect();
    assert_eq!(order, vec![50, 100, 200]);

    for (delay_ms, at) in fired {
        let expected = Duration::from_millis(delay_ms);
        assert!(
            at >= expected,
            "item {} fired early at {:?}",
            delay_ms,
            at
        );
        assert!(
            at < expected + Duration::from_millis(150),
            "item {} fired late at {:?}",
            delay_ms,
            at
        );
    }
    Ok(())
}

/// A stop issued while the chain sleeps on its full 24-hour block time
/// still takes effect promptly: the wakeup byte interrupts the select.
#[test]
fn stop_interrupts_long_block() -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let worker = std::thread::spawn(move || {
        let chain = Chain::new().unwrap();
        // A utimer with no items leaves the block time at its maximum.
        let _timer = Utimer::new(&chain, "empty");
        tx.send(chain.controller()).unwrap();
        chain.run().unwrap();
    });

    let controller = rx.recv()?;
    std::thread::sleep(Duration::from_millis(50));
    let stop_at = Instant::now();
    controller.stop().unwrap();
    worker.join().unwrap();
    assert!(stop_at.elapsed() < Duration::from_secs(2));
    Ok(())
}
