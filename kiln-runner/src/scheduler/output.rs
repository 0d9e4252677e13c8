//! Output consumer
//!
//! Drains a build's log channel and appends the buffered lines to the
//! build's stored output every flush interval. The consumer ends once every
//! sender is gone, after one last flush.

use kiln_core::interface::BuildStorage;
use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::logstream::LogReceiver;

/// Forwards the lines on `rx` to storage until the channel closes
pub async fn forward_output(
    build_id: i64,
    mut rx: LogReceiver,
    storage: Arc<dyn BuildStorage>,
    every: Duration,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    buffer.extend_from_slice(&line);
                    buffer.push(b'\n');
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = flush(build_id, &mut buffer, storage.as_ref()).await {
                    warn!(build_id, "Failed to send output, retrying next tick: {:#}", e);
                }
            }
        }
    }

    if let Err(e) = flush(build_id, &mut buffer, storage.as_ref()).await {
        error!(build_id, "Failed to send final output: {:#}", e);
    }
}

/// Sends the buffer and clears it; a failed send keeps it for the next try
async fn flush(build_id: i64, buffer: &mut Vec<u8>, storage: &dyn BuildStorage) -> anyhow::Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    debug!(build_id, "Sending {} bytes of output", buffer.len());
    storage.add_out(build_id, buffer).await?;
    buffer.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::tests::InMemoryStorage;
    use crate::logstream::{self, send_line};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_final_flush_after_channel_closes() {
        let storage = Arc::new(InMemoryStorage::default());
        let (tx, rx) = logstream::channel();

        let consumer = tokio::spawn(forward_output(7, rx, storage.clone(), Duration::from_secs(3600)));
        send_line(&tx, "build | ", "compiling");
        send_line(&tx, "build | ", "done");
        drop(tx);
        consumer.await.unwrap();

        assert_eq!(
            String::from_utf8(storage.output.lock().unwrap().clone()).unwrap(),
            "build | compiling\nbuild | done\n"
        );
    }

    #[tokio::test]
    async fn test_flushes_on_interval() {
        let storage = Arc::new(InMemoryStorage::default());
        let (tx, rx) = logstream::channel();

        let consumer = tokio::spawn(forward_output(7, rx, storage.clone(), Duration::from_millis(20)));
        send_line(&tx, "", "first");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.output.lock().unwrap().as_slice(), b"first\n");

        drop(tx);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let storage = Arc::new(InMemoryStorage::default());
        storage.failing_output.store(true, Ordering::SeqCst);
        let (tx, rx) = logstream::channel();

        let consumer = tokio::spawn(forward_output(7, rx, storage.clone(), Duration::from_millis(20)));
        send_line(&tx, "", "kept");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(storage.output.lock().unwrap().is_empty());

        storage.failing_output.store(false, Ordering::SeqCst);
        drop(tx);
        consumer.await.unwrap();
        assert_eq!(storage.output.lock().unwrap().as_slice(), b"kept\n");
    }
}
