//! Hands boxed jobs from producer threads to consumer threads through a
//! pointer queue. Backoff tuning comes from `RINGHAND__*` env vars or a
//! config file passed as the first argument.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use ringhand_concurrent::{dequeue_wait, enqueue_wait, new_queue, QueueOptions, RawHandle};
use ringhand_core::{init_tracing, install, BackoffConfig};
use tracing::info;

struct Job {
    id: usize,
    payload: u64,
}

const JOBS_PER_PRODUCER: usize = 100_000;

fn main() -> Result<()> {
    init_tracing();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = BackoffConfig::load(path.as_deref())?;
    let settings = install(&config)?;
    info!(?settings, "backoff installed");

    let workers = (num_cpus::get() / 2).max(1);
    let (consumer, producer) = new_queue::<RawHandle<Job>>(1024, QueueOptions::default())?;
    let checksum = Arc::new(AtomicUsize::new(0));
    let total = workers * JOBS_PER_PRODUCER;
    let started = Instant::now();

    let producers: Vec<_> = (0..workers)
        .map(|w| {
            let producer = producer.clone();
            thread::spawn(move || -> Result<()> {
                for i in 0..JOBS_PER_PRODUCER {
                    let job = Box::new(Job {
                        id: w * JOBS_PER_PRODUCER + i,
                        payload: i as u64,
                    });
                    let handle = RawHandle::new(std::ptr::NonNull::from(Box::leak(job)));
                    enqueue_wait(&producer, handle)?;
                }
                Ok(())
            })
        })
        .collect();

    let consumers: Vec<_> = (0..workers)
        .map(|_| {
            let consumer = consumer.clone();
            let checksum = checksum.clone();
            thread::spawn(move || -> Result<usize> {
                let mut seen = 0;
                for _ in 0..JOBS_PER_PRODUCER {
                    let handle = dequeue_wait(&consumer)?;
                    // Safety: every handle was leaked from a Box by exactly one producer
                    // and is dequeued exactly once.
                    let job = unsafe { Box::from_raw(handle.as_ptr()) };
                    checksum.fetch_add(job.id ^ job.payload as usize, Ordering::Relaxed);
                    seen += 1;
                }
                Ok(seen)
            })
        })
        .collect();

    for p in producers {
        p.join().map_err(|_| anyhow::anyhow!("producer panicked"))??;
    }
    let mut received = 0;
    for c in consumers {
        received += c.join().map_err(|_| anyhow::anyhow!("consumer panicked"))??;
    }

    let elapsed = started.elapsed();
    info!(
        workers,
        received,
        total,
        checksum = checksum.load(Ordering::Relaxed),
        elapsed_ms = elapsed.as_millis() as u64,
        per_sec = (received as f64 / elapsed.as_secs_f64()) as u64,
        "hand-off finished"
    );
    anyhow::ensure!(received == total, "lost {} jobs", total - received);
    Ok(())
}
