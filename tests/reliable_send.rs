//! Acknowledged sends, link resets and pacing between two simulated endpoints.

use ble_reliable_link::ble::{is_ack_reply_packet, Fragment, SeqNum};
use ble_reliable_link::sim::{LinkFaults, SimPair};
use ble_reliable_link::transport::{DeliveryEvent, TransportConfig, TxError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Harness {
    pair: SimPair,
    inbox: Arc<Mutex<Vec<Vec<u8>>>>,
    events: Arc<Mutex<Vec<DeliveryEvent>>>,
}

fn harness(config: &TransportConfig, faults: LinkFaults) -> Harness {
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let log = inbox.clone();
    let pair = SimPair::new(config, faults, 3, |_: &[u8]| true, move |message: &[u8]| {
        log.lock().unwrap().push(message.to_vec());
        true
    })
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let event_log = events.clone();
    pair.a
        .tx
        .set_delivery_observer(move |event: DeliveryEvent| event_log.lock().unwrap().push(event));

    Harness {
        pair,
        inbox,
        events,
    }
}

#[test]
fn test_dead_link_fails_after_retries() {
    init_logging();
    let config = TransportConfig::default()
        .with_message_timeout(Duration::from_millis(200))
        .with_max_ack_retries(2);
    let h = harness(&config, LinkFaults::with_loss(1.0));

    let id = h.pair.a.tx.write_with_ack(b"hello").unwrap();
    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(10)));

    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    match &events[0] {
        DeliveryEvent::Failed(failed, TxError::AckTimeoutExhausted { retries }) => {
            assert_eq!(*failed, id);
            assert_eq!(*retries, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(h.pair.a.tx.pending_reliable(), 0);
    assert_eq!(h.pair.a.tx.stats().snapshot().messages_failed, 1);
    // One single-fragment attempt plus two retries, all lost
    assert_eq!(h.pair.a.outbound.counters().dropped.load(Ordering::Relaxed), 3);
    assert!(h.inbox.lock().unwrap().is_empty());
}

#[test]
fn test_retry_after_link_recovers() {
    init_logging();
    let config = TransportConfig::default()
        .with_message_timeout(Duration::from_millis(200))
        .with_max_ack_retries(5);
    let h = harness(&config, LinkFaults::with_loss(1.0));

    h.pair.a.tx.write_with_ack(b"later").unwrap();
    h.pair.scheduler.advance(Duration::from_millis(250));
    assert!(h.events.lock().unwrap().is_empty());

    h.pair.a.outbound.set_faults(LinkFaults::default());
    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(10)));

    assert!(matches!(
        h.events.lock().unwrap().as_slice(),
        [DeliveryEvent::Delivered(_)]
    ));
    assert_eq!(*h.inbox.lock().unwrap(), vec![b"later".to_vec()]);
}

#[test]
fn test_lost_ack_does_not_deliver_twice() {
    init_logging();
    let config = TransportConfig::default().with_message_timeout(Duration::from_millis(200));
    let h = harness(&config, LinkFaults::default());

    let dropped = Arc::new(AtomicBool::new(false));
    let seen = dropped.clone();
    h.pair.b.outbound.set_filter(move |bytes: &[u8]| {
        let is_ack = Fragment::from_bytes(bytes).is_ok_and(|f| is_ack_reply_packet(f.flags));
        is_ack && !seen.swap(true, Ordering::Relaxed)
    });

    let id = h.pair.a.tx.write_with_ack(b"once").unwrap();
    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(10)));

    assert!(dropped.load(Ordering::Relaxed));
    assert_eq!(*h.inbox.lock().unwrap(), vec![b"once".to_vec()]);
    assert!(matches!(
        h.events.lock().unwrap().as_slice(),
        [DeliveryEvent::Delivered(done)] if *done == id
    ));
    assert_eq!(h.pair.a.tx.stats().snapshot().retransmissions, 1);
    assert_eq!(h.pair.b.rx.stats().snapshot().messages_received, 1);
    assert_eq!(h.pair.b.tx.stats().snapshot().acks_sent, 2);
}

#[test]
fn test_flush_drops_tracking_silently() {
    init_logging();
    let h = harness(&TransportConfig::default(), LinkFaults::default());

    h.pair.a.tx.write_with_ack(b"flushed").unwrap();
    let next = h.pair.a.tx.get_next_seq_num();
    h.pair.a.tx.flush_tx();
    assert_eq!(h.pair.a.tx.pending_reliable(), 0);
    assert_eq!(h.pair.a.tx.get_next_seq_num(), next);

    // Already on the air: the peer still gets it, its ACK matches nothing
    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(10)));
    assert_eq!(*h.inbox.lock().unwrap(), vec![b"flushed".to_vec()]);
    assert!(h.events.lock().unwrap().is_empty());
    assert_eq!(h.pair.b.tx.stats().snapshot().acks_sent, 1);
}

#[test]
fn test_reset_both_ends_resumes_at_zero() {
    init_logging();
    let h = harness(&TransportConfig::default(), LinkFaults::default());

    for _ in 0..3 {
        h.pair.a.tx.write(b"before reset").unwrap();
    }
    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(5)));
    assert_eq!(h.pair.b.rx.expected_seq(), SeqNum::new(3));

    h.pair.a.tx.reset_seq_num();
    h.pair.b.rx.reset_seq_num();
    assert_eq!(h.pair.a.tx.get_next_seq_num(), SeqNum::ZERO);

    h.pair.a.tx.write(b"after reset").unwrap();
    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(5)));
    assert_eq!(h.pair.b.rx.expected_seq(), SeqNum::new(1));
    assert_eq!(h.inbox.lock().unwrap().len(), 4);
    assert_eq!(h.inbox.lock().unwrap()[3], b"after reset".to_vec());
}

#[test]
fn test_paced_message_one_packet_per_interval() {
    init_logging();
    let config = TransportConfig::default().with_connection_interval(Duration::from_millis(10));
    let h = harness(&config, LinkFaults::default());

    // 90 bytes in 18 byte payloads
    let message = vec![0x5a; 90];
    h.pair.a.tx.write(&message).unwrap();
    let queued = || h.pair.a.outbound.counters().queued.load(Ordering::Relaxed);
    assert_eq!(queued(), 1);
    assert_eq!(h.pair.a.tx.queued_packets(), 4);

    h.pair.scheduler.advance(Duration::from_millis(25));
    assert_eq!(queued(), 3);

    h.pair.scheduler.advance(Duration::from_millis(20));
    assert_eq!(queued(), 5);
    assert_eq!(h.pair.a.tx.queued_packets(), 0);

    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(5)));
    assert_eq!(*h.inbox.lock().unwrap(), vec![message]);
}

#[test]
fn test_dropping_pacing_releases_queue() {
    init_logging();
    let config = TransportConfig::default().with_connection_interval(Duration::from_millis(50));
    let h = harness(&config, LinkFaults::default());

    h.pair.a.tx.write(&[1; 60]).unwrap();
    assert_eq!(h.pair.a.tx.queued_packets(), 3);

    h.pair.a.tx.change_connection_interval(Duration::ZERO);
    assert_eq!(h.pair.a.tx.queued_packets(), 0);
    assert_eq!(h.pair.a.outbound.counters().queued.load(Ordering::Relaxed), 4);

    assert!(h.pair.scheduler.run_until_idle(Duration::from_secs(5)));
    assert_eq!(h.inbox.lock().unwrap().len(), 1);
}
