//! Gap detection and NACK-driven recovery of single lost fragments.

use ble_reliable_link::ble::{is_nack_packet, Fragment, FragmentFlags, Fragmenter, SeqNum};
use ble_reliable_link::sim::{LinkFaults, SimPair, SimScheduler};
use ble_reliable_link::transport::{Rx, TransportConfig, Tx};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NACK_GAP_TIMEOUT: Duration = Duration::from_millis(100);
const NAK_TIMEOUT: Duration = Duration::from_millis(1000);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Receiver with a paired Tx whose output (the NACKs) is recorded.
struct Receiver {
    sched: Arc<SimScheduler>,
    rx: Rx,
    control: Arc<Mutex<Vec<Fragment>>>,
    inbox: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Receiver {
    fn new() -> Self {
        let config = TransportConfig::default()
            .with_mtu(3)
            .with_nack_gap_timeout(NACK_GAP_TIMEOUT)
            .with_nak_timeout(NAK_TIMEOUT);
        let sched = Arc::new(SimScheduler::new());

        let control = Arc::new(Mutex::new(Vec::new()));
        let log = control.clone();
        let sink = move |bytes: &[u8], _timeout: Duration| {
            log.lock().unwrap().push(Fragment::from_bytes(bytes).unwrap());
            true
        };
        let tx = Tx::new(&config, Arc::new(sink), sched.clone()).unwrap();

        let inbox = Arc::new(Mutex::new(Vec::new()));
        let received = inbox.clone();
        let handler = move |message: &[u8]| {
            received.lock().unwrap().push(message.to_vec());
            true
        };
        let rx = Rx::new(&config, sched.clone(), Some(tx), handler).unwrap();

        Self {
            sched,
            rx,
            control,
            inbox,
        }
    }

    fn feed(&self, fragment: &Fragment) {
        self.rx.on_ble_phys_rx(&fragment.to_bytes());
    }

    fn nacks(&self) -> Vec<SeqNum> {
        self.control
            .lock()
            .unwrap()
            .iter()
            .filter(|f| is_nack_packet(f.flags))
            .map(|f| f.seq)
            .collect()
    }

    fn delivered(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().unwrap().clone()
    }
}

fn fragments(message: &[u8]) -> Vec<Fragment> {
    Fragmenter::new(3).fragment(message).unwrap()
}

#[test]
fn test_skip_each_of_four_fragments() {
    init_logging();

    for skipped in 0..4 {
        let receiver = Receiver::new();
        let run = fragments(b"hi!?");
        assert_eq!(run.len(), 4);

        for (i, fragment) in run.iter().enumerate() {
            if i != skipped {
                receiver.feed(fragment);
            }
        }
        assert!(receiver.delivered().is_empty(), "skipped {}", skipped);

        let bound = if skipped == 3 {
            NAK_TIMEOUT.mul_f64(1.8)
        } else {
            NACK_GAP_TIMEOUT.mul_f64(1.8)
        };
        let nacked = receiver
            .sched
            .run_until(bound, || !receiver.nacks().is_empty());
        assert!(nacked, "no NACK within {:?} for skipped {}", bound, skipped);
        assert_eq!(receiver.nacks()[0], SeqNum::new(skipped as u8));

        receiver.feed(&run[skipped].as_retransmission());
        assert_eq!(
            receiver.delivered(),
            vec![b"hi!?".to_vec()],
            "skipped {}",
            skipped
        );
        assert!(!receiver.rx.gap_timer_armed());
    }
}

#[test]
fn test_stop_first_delivers_nothing() {
    init_logging();
    let receiver = Receiver::new();
    let run = fragments(b"hi!");

    receiver.feed(&run[2]);
    receiver.feed(&run[0]);
    receiver.feed(&run[1]);
    assert!(receiver.delivered().is_empty());

    receiver.feed(&run[2].as_retransmission());
    assert_eq!(receiver.delivered(), vec![b"hi!".to_vec()]);
}

#[test]
fn test_missing_stop_delivers_nothing() {
    init_logging();
    let receiver = Receiver::new();
    let run = fragments(b"hi!");

    receiver.feed(&run[0]);
    receiver.feed(&run[1]);
    receiver.sched.advance(Duration::from_millis(500));
    assert!(receiver.delivered().is_empty());
}

#[test]
fn test_missing_middle_delivers_nothing() {
    init_logging();
    let receiver = Receiver::new();
    let run = fragments(b"hi!");

    receiver.feed(&run[0]);
    receiver.feed(&run[2]);
    receiver.sched.advance(Duration::from_millis(50));
    assert!(receiver.delivered().is_empty());
}

#[test]
fn test_full_run_delivers() {
    init_logging();
    let receiver = Receiver::new();
    for fragment in fragments(b"hi!") {
        receiver.feed(&fragment);
    }
    assert_eq!(receiver.delivered(), vec![b"hi!".to_vec()]);
    assert!(receiver.nacks().is_empty());
}

#[test]
fn test_nack_repeats_until_abandoned() {
    init_logging();
    let receiver = Receiver::new();
    let run = fragments(b"abcd");

    receiver.feed(&run[0]);
    receiver.feed(&run[2]);
    receiver.feed(&run[3]);

    receiver.sched.advance(NAK_TIMEOUT);
    let nacks = receiver.nacks();
    assert_eq!(nacks.len(), 9);
    assert!(nacks.iter().all(|seq| *seq == SeqNum::new(1)));
    assert!(receiver.delivered().is_empty());
    assert!(!receiver.rx.has_gap());
    assert_eq!(receiver.rx.stats().snapshot().gaps_abandoned, 1);

    // A retransmission arriving after abandonment is stale
    receiver.feed(&run[1].as_retransmission());
    assert!(receiver.delivered().is_empty());
}

#[test]
fn test_lost_start_recovered_over_link() {
    init_logging();
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let log = inbox.clone();
    let config = TransportConfig::default().with_mtu(3);
    let pair = SimPair::new(
        &config,
        LinkFaults::default(),
        11,
        |_: &[u8]| true,
        move |message: &[u8]| {
            log.lock().unwrap().push(message.to_vec());
            true
        },
    )
    .unwrap();

    // Drop the first transmission of each fragment position once
    for skipped in 0..4u8 {
        let mut dropped = false;
        pair.a.outbound.set_filter(move |packet: &[u8]| {
            let Some(fragment) = Fragment::from_bytes(packet).ok() else {
                return false;
            };
            let position = fragment.seq.value() % 4;
            let original = !fragment.flags.contains(FragmentFlags::RETRANS);
            if !dropped && original && position == skipped {
                dropped = true;
                return true;
            }
            false
        });

        pair.a.tx.write(b"hi!?").unwrap();
        assert!(pair.scheduler.run_until_idle(Duration::from_secs(5)));
    }

    assert_eq!(*inbox.lock().unwrap(), vec![b"hi!?".to_vec(); 4]);
    let stats = pair.a.tx.stats().snapshot();
    assert_eq!(stats.nacks_received, 4);
    assert_eq!(stats.retransmissions, 4);
}
