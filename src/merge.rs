//! Watch stream fan-in
//!
//! [`StreamMerger`] combines the event channels of N per-namespace watches
//! into one output channel. One forwarding task per source copies events to
//! the shared output until its source closes; the output closes only after
//! every source has been drained, so the consumer sees a clean end-of-stream
//! and never a silent stall. Ordering across sources is arrival order only.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::MERGED_OUTPUT_BUFFER;

/// Merges a fixed set of event channels into a single output channel.
///
/// Sources are handed over at construction and cannot be added or removed
/// later. [`StreamMerger::stop`] is idempotent and safe to call concurrently;
/// it stops the forwarding tasks but does not cancel whatever is feeding the
/// source channels - tearing those down is the caller's responsibility
/// (dropping the merger output closes the forwarding channels, which
/// propagates backpressure-failure to the feeders).
pub struct StreamMerger<T> {
    output: mpsc::Receiver<T>,
    cancel: CancellationToken,
    stopped: Mutex<bool>,
}

impl<T: Send + 'static> StreamMerger<T> {
    /// Build a merger over the given source channels and spawn its
    /// forwarding tasks.
    pub fn new(sources: Vec<mpsc::Receiver<T>>) -> Self {
        let (tx, output) = mpsc::channel(MERGED_OUTPUT_BUFFER);
        let cancel = CancellationToken::new();

        let mut forwarders = JoinSet::new();
        for mut source in sources {
            let tx = tx.clone();
            let cancel = cancel.clone();
            forwarders.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = source.recv() => match event {
                            Some(event) => {
                                // output dropped: consumer is gone, stop copying
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
        // The constructor's own sender is dropped here; once every forwarder
        // finishes (dropping its clone) the output channel closes. The
        // supervisor only observes completion.
        drop(tx);
        tokio::spawn(async move {
            let count = forwarders.len();
            while forwarders.join_next().await.is_some() {}
            debug!(sources = count, "all merge sources drained");
        });

        Self {
            output,
            cancel,
            stopped: Mutex::new(false),
        }
    }

    /// Receive the next merged event; `None` once every source has closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.output.recv().await
    }

    /// Signal shutdown. Idempotent; concurrent calls are safe. Forwarding
    /// stops promptly but source feeders are not cancelled here.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            *stopped = true;
            self.cancel.cancel();
        }
    }

    /// Whether [`StreamMerger::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Consume the merger into a stream of events for response bodies.
    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.output)
    }
}
