//! Simulated transfer over a lossy BLE link.
//!
//! Sends reliable messages from endpoint A to endpoint B through a seeded
//! lossy link on a virtual clock and reports what it took to get them
//! across. With `--realtime` the same endpoints run on tokio timers and
//! channel queues instead (no loss injection).
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin link-sim -- --loss 0.15 --size 4096 --count 5 --seed 7
//! RUST_LOG=debug cargo run --bin link-sim -- --realtime
//! ```

use ble_reliable_link::platform::{channel_queue, TokioScheduler};
use ble_reliable_link::sim::{LinkFaults, SimPair};
use ble_reliable_link::transport::{DeliveryEvent, Rx, TransportConfig, Tx};
use log::{error, info, warn};
use std::process::exit;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

struct Options {
    loss: f64,
    duplicate: f64,
    size: usize,
    count: usize,
    seed: u32,
    mtu: usize,
    realtime: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            loss: 0.1,
            duplicate: 0.0,
            size: 4096,
            count: 3,
            seed: 1,
            mtu: 185,
            realtime: false,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(2);
        }
    };

    let result = if options.realtime {
        run_realtime(&options)
    } else {
        run_simulated(&options)
    };
    if let Err(e) = result {
        error!("{}", e);
        exit(1);
    }
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--loss" => options.loss = parse(&value("--loss")?)?,
            "--dup" => options.duplicate = parse(&value("--dup")?)?,
            "--size" => options.size = parse(&value("--size")?)?,
            "--count" => options.count = parse(&value("--count")?)?,
            "--seed" => options.seed = parse(&value("--seed")?)?,
            "--mtu" => options.mtu = parse(&value("--mtu")?)?,
            "--realtime" => options.realtime = true,
            "--help" | "-h" => {
                println!("BLE reliable link simulator");
                println!();
                println!("Usage:");
                println!("  {} [OPTIONS]", args[0]);
                println!();
                println!("Options:");
                println!("  --loss <ratio>   Packet loss ratio 0.0-1.0 (default 0.1)");
                println!("  --dup <ratio>    Packet duplication ratio (default 0.0)");
                println!("  --size <bytes>   Message size (default 4096)");
                println!("  --count <n>      Messages to send (default 3)");
                println!("  --seed <n>       Random seed (default 1)");
                println!("  --mtu <bytes>    Link MTU (default 185)");
                println!("  --realtime       Run on tokio timers and channels");
                exit(0);
            }
            other => return Err(format!("unknown option {}", other)),
        }
    }

    if !(0.0..=1.0).contains(&options.loss) || !(0.0..=1.0).contains(&options.duplicate) {
        return Err("ratios must be within 0.0-1.0".to_string());
    }
    if options.size == 0 {
        return Err("--size must be > 0".to_string());
    }
    Ok(options)
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value '{}'", value))
}

/// Deterministic test pattern for message `index`.
fn payload(index: usize, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(31) ^ index.wrapping_mul(7)) as u8)
        .collect()
}

fn config(options: &Options) -> TransportConfig {
    TransportConfig::simulation()
        .with_mtu(options.mtu)
        .with_assembly_capacity(options.size.max(1024))
}

fn run_simulated(options: &Options) -> Result<(), String> {
    let config = config(options);
    let faults = LinkFaults {
        loss_ratio: options.loss,
        duplicate_ratio: options.duplicate,
        ..Default::default()
    };

    let inbox = Arc::new(Mutex::new(Vec::new()));
    let log = inbox.clone();
    let pair = SimPair::new(
        &config,
        faults,
        options.seed,
        |_: &[u8]| true,
        move |message: &[u8]| {
            log.lock().unwrap_or_else(|e| e.into_inner()).push(message.to_vec());
            true
        },
    )
    .map_err(|e| e.to_string())?;

    let (events_tx, events_rx) = mpsc::channel();
    let events_tx = Mutex::new(events_tx);
    pair.a.tx.set_delivery_observer(move |event: DeliveryEvent| {
        if let Ok(sender) = events_tx.lock() {
            let _ = sender.send(event);
        }
    });

    info!(
        "Sending {} x {} bytes, loss {:.0}%, mtu {}, seed {}",
        options.count,
        options.size,
        options.loss * 100.0,
        options.mtu,
        options.seed
    );

    let mut delivered = 0;
    for index in 0..options.count {
        let message = payload(index, options.size);
        let id = pair
            .a
            .tx
            .write_with_ack(&message)
            .map_err(|e| e.to_string())?;
        let started = pair.scheduler.elapsed();

        let mut outcome = None;
        pair.scheduler.run_until(Duration::from_secs(600), || {
            if let Ok(event) = events_rx.try_recv() {
                outcome = Some(event);
            }
            outcome.is_some()
        });

        let took = pair.scheduler.elapsed() - started;
        match outcome {
            Some(DeliveryEvent::Delivered(done)) if done == id => {
                delivered += 1;
                info!("{} delivered in {:?} (virtual)", id, took);
            }
            Some(DeliveryEvent::Failed(done, e)) if done == id => {
                warn!("{} failed after {:?}: {}", id, took, e);
            }
            other => warn!("{}: unexpected outcome {:?}", id, other),
        }
    }

    // Let trailing ACKs and NACKs settle
    pair.scheduler.run_until_idle(Duration::from_secs(30));

    let received = inbox.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let intact = (0..options.count)
        .filter(|index| received.contains(&payload(*index, options.size)))
        .count();

    info!("Sender:   {}", pair.a.tx.stats().snapshot());
    info!("Receiver: {}", pair.b.rx.stats().snapshot());
    info!(
        "{}/{} acknowledged, {}/{} received intact, {} deliveries total",
        delivered,
        options.count,
        intact,
        options.count,
        received.len()
    );

    if intact == options.count {
        Ok(())
    } else {
        Err(format!("{} message(s) lost", options.count - intact))
    }
}

fn run_realtime(options: &Options) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| e.to_string())?;
    runtime.block_on(realtime_transfer(options))
}

async fn realtime_transfer(options: &Options) -> Result<(), String> {
    if options.loss > 0.0 {
        warn!("--realtime does not inject loss, ignoring --loss");
    }
    let config = config(options);
    let scheduler = Arc::new(TokioScheduler::current());

    let (queue_a, mut wire_a) = channel_queue(1024);
    let (queue_b, mut wire_b) = channel_queue(1024);

    let tx_a = Tx::new(&config, Arc::new(queue_a), scheduler.clone()).map_err(|e| e.to_string())?;
    let tx_b = Tx::new(&config, Arc::new(queue_b), scheduler.clone()).map_err(|e| e.to_string())?;

    let (inbox_tx, mut inbox) = tokio::sync::mpsc::unbounded_channel();
    let rx_a = Rx::new(&config, scheduler.clone(), Some(tx_a.clone()), |_: &[u8]| true)
        .map_err(|e| e.to_string())?;
    let rx_b = Rx::new(
        &config,
        scheduler.clone(),
        Some(tx_b.clone()),
        move |message: &[u8]| inbox_tx.send(message.to_vec()).is_ok(),
    )
    .map_err(|e| e.to_string())?;

    // Radio pumps: A's outbound queue feeds B's receiver and vice versa
    let pump_ab = tokio::spawn(async move {
        while let Some(packet) = wire_a.recv().await {
            rx_b.on_ble_phys_rx(&packet);
        }
    });
    let pump_ba = tokio::spawn(async move {
        while let Some(packet) = wire_b.recv().await {
            rx_a.on_ble_phys_rx(&packet);
        }
    });

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    tx_a.set_delivery_observer(move |event: DeliveryEvent| {
        let _ = events_tx.send(event);
    });

    for index in 0..options.count {
        let message = payload(index, options.size);
        let started = tokio::time::Instant::now();
        let id = tx_a.write_with_ack(&message).map_err(|e| e.to_string())?;

        let outcome = tokio::time::timeout(Duration::from_secs(30), events.recv()).await;
        match outcome {
            Ok(Some(DeliveryEvent::Delivered(done))) if done == id => {
                info!("{} delivered in {:?}", id, started.elapsed());
            }
            Ok(other) => return Err(format!("{}: unexpected outcome {:?}", id, other)),
            Err(_) => return Err(format!("{}: no outcome within 30s", id)),
        }

        match inbox.recv().await {
            Some(received) if received == message => {}
            _ => return Err(format!("{}: payload mismatch", id)),
        }
    }

    info!("Sender:   {}", tx_a.stats().snapshot());
    info!("Receiver: {}", tx_b.stats().snapshot());

    tx_a.flush_tx();
    tx_b.flush_tx();
    pump_ab.abort();
    pump_ba.abort();
    Ok(())
}
