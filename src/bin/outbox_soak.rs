//! OutboxDB Soak Test Binary
//!
//! Drives one message store with concurrent producers and a publishing
//! consumer, then verifies the store's invariants on disk.
//! Run with: `cargo run --bin outbox_soak -- [OPTIONS]`
//!
//! Kept out of the regular test suite because it is long-running and
//! configurable from the command line.
//!
//! # Examples
//!
//! ```bash
//! # Default: 4 producers, 5000 messages, capacity 1000
//! cargo run --release --bin outbox_soak
//!
//! # Tight capacity to exercise rejections
//! cargo run --release --bin outbox_soak -- --messages 20000 --capacity 100
//!
//! # Verbose store logging
//! RUST_LOG=outboxdb=debug cargo run --bin outbox_soak
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use outboxdb::{Error, MessageStore, Priority, Qos, StoreConfig};
use tracing_subscriber::EnvFilter;

/// Soak test configuration
struct Config {
    /// Total number of messages to store
    num_messages: usize,
    /// Number of producer threads
    producers: usize,
    /// Store capacity
    capacity: u32,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_messages: 5000,
            producers: 4,
            capacity: 1000,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--messages" | "-m" => {
                i += 1;
                config.num_messages = parse_arg(&args, i, "--messages");
            }
            "--producers" | "-p" => {
                i += 1;
                config.producers = parse_arg(&args, i, "--producers");
            }
            "--capacity" | "-c" => {
                i += 1;
                config.capacity = parse_arg(&args, i, "--capacity");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = args.get(i).cloned();
            }
            "--help" | "-h" => {
                println!(
                    r#"OutboxDB Soak Test

Usage: outbox_soak [OPTIONS]

Options:
  -m, --messages <N>   Total messages to store (default: 5000)
  -p, --producers <N>  Producer threads (default: 4)
  -c, --capacity <N>   Store capacity (default: 1000)
  -d, --db <PATH>      Database path (default: temp file)
  -h, --help           Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn parse_arg<T: std::str::FromStr>(args: &[String], i: usize, name: &str) -> T {
    match args.get(i).map(|v| v.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("Invalid {} value", name);
            std::process::exit(1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("outboxdb=info")),
        )
        .init();

    let config = parse_args();

    println!("OutboxDB Soak Test");
    println!("==================");
    println!("Messages:    {}", config.num_messages);
    println!("Producers:   {}", config.producers);
    println!("Capacity:    {}", config.capacity);
    println!();

    let temp_dir = std::env::temp_dir().join(format!("outboxdb-soak-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("soak.db").to_string_lossy().to_string());

    println!("Database:    {}", db_path);
    println!();

    let store_config = StoreConfig::new(1, 0, config.capacity).with_checkpoint(true);
    let store = MessageStore::open(&db_path, "soak_messages", store_config).expect("open store");

    let stored = AtomicU64::new(0);
    let rejected = AtomicU64::new(0);
    let errors = AtomicU64::new(0);
    let confirmed = AtomicU64::new(0);
    let producers_done = AtomicBool::new(false);

    println!("Starting soak test...");
    let start = Instant::now();
    let per_producer = config.num_messages / config.producers.max(1);

    thread::scope(|s| {
        let producers: Vec<_> = (0..config.producers)
            .map(|producer| {
                let store = &store;
                let (stored, rejected, errors) = (&stored, &rejected, &errors);
                s.spawn(move || {
                    for i in 0..per_producer {
                        // Every 50th message is lifecycle traffic.
                        let priority = if i % 50 == 0 {
                            Priority::LIFECYCLE
                        } else {
                            Priority::new(2 + (i % 6) as i32)
                        };
                        let qos = Qos::new((i % 3) as u8);
                        let topic = format!("soak/{producer}/{i}");
                        let payload = format!("payload-{producer}-{i}").into_bytes();

                        match store.store(&topic, Some(payload.as_slice()), qos, false, priority) {
                            Ok(_) => {
                                stored.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(Error::CapacityExceeded { .. }) => {
                                rejected.fetch_add(1, Ordering::Relaxed);
                                thread::sleep(Duration::from_millis(1));
                            }
                            Err(_) => {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
            })
            .collect();

        // Consumer: publish the next message and confirm it right away.
        let consumer = s.spawn(|| loop {
            // Read the flag before the queue so the last stores are not missed.
            let done = producers_done.load(Ordering::Acquire);
            match store.get_next_message() {
                Ok(Some(msg)) => {
                    let published = store.mark_as_published(msg.id);
                    let acked = if msg.qos.requires_confirmation() {
                        store.mark_as_confirmed(msg.id)
                    } else {
                        Ok(())
                    };
                    if published.and(acked).is_ok() {
                        confirmed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) if done => break,
                Ok(None) => thread::sleep(Duration::from_millis(1)),
                Err(_) => {
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        for producer in producers {
            producer.join().expect("producer thread panicked");
        }
        producers_done.store(true, Ordering::Release);
        consumer.join().expect("consumer thread panicked");
    });

    let elapsed = start.elapsed();

    let stored = stored.load(Ordering::Relaxed);
    let rejected = rejected.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);
    let delivered = confirmed.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Stored:          {}", stored);
    println!("Rejected (full): {}", rejected);
    println!("Delivered:       {}", delivered);
    println!("Errors:          {}", error_count);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} messages/sec",
        stored as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");

    assert_eq!(error_count, 0, "unexpected store errors");
    assert_eq!(delivered, stored, "every stored message should be delivered");
    println!("  Delivery:          all stored messages delivered ✓");

    assert!(store.get_unpublished_messages().expect("list").is_empty());
    assert!(store.get_in_flight_messages().expect("list").is_empty());
    println!("  Queue:             drained ✓");

    let ids: Vec<i64> = store
        .with_plain_connection(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM soak_messages")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .expect("read ids");
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "duplicate ids on disk");
    println!("  Identity:          {} rows, ids unique ✓", ids.len());

    let purged = store
        .delete_stale_messages(Duration::ZERO)
        .expect("purge");
    assert_eq!(store.get_message_count().expect("count"), 0);
    println!("  Purge:             {} delivered rows removed ✓", purged.total());

    let report = store.repair().expect("repair");
    assert!(report.is_clean());
    println!("  Repair:            table consistent ✓");

    store.stop();

    println!();
    println!("Soak test PASSED ✓");
}
