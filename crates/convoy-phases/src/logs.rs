//! Rate-capped build log streaming
//!
//! Builders push lines synchronously; a drain task publishes them as
//! `LogLine` events. Lines beyond the per-second cap are counted and
//! merged into one tail summary instead of flooding the bus.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

use convoy_ports::{EventSink, LogSink};
use convoy_types::{DeploymentId, EventPayload};

/// Streams build output into the event bus with a lines-per-second cap.
pub struct LogStream {
    tx: Option<mpsc::UnboundedSender<String>>,
    drain: tokio::task::JoinHandle<u64>,
}

impl LogStream {
    pub fn start(events: Arc<dyn EventSink>, deployment_id: DeploymentId, max_lines_per_sec: u32) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let drain = tokio::spawn(async move {
            let mut window_start = Instant::now();
            let mut window_count = 0u32;
            let mut suppressed = 0u64;
            while let Some(line) = rx.recv().await {
                if window_start.elapsed() >= Duration::from_secs(1) {
                    window_start = Instant::now();
                    window_count = 0;
                }
                window_count += 1;
                if window_count > max_lines_per_sec {
                    suppressed += 1;
                    continue;
                }
                let _ = events
                    .publish(deployment_id, EventPayload::LogLine { line })
                    .await;
            }
            if suppressed > 0 {
                debug!(deployment_id = %deployment_id, suppressed, "build log lines suppressed");
                let _ = events
                    .publish(
                        deployment_id,
                        EventPayload::LogLine {
                            line: format!("... {suppressed} build log lines suppressed"),
                        },
                    )
                    .await;
            }
            suppressed
        });
        Self { tx: Some(tx), drain }
    }

    /// The sink handed to the container builder.
    pub fn sink(&self) -> LogSink {
        let tx = self.tx.clone().expect("sink taken after finish");
        Arc::new(move |line: String| {
            let _ = tx.send(line);
        })
    }

    /// Close the stream and wait for the drain to publish everything.
    /// Returns how many lines were suppressed by the cap.
    pub async fn finish(mut self) -> u64 {
        self.tx.take();
        self.drain.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_ports::fakes::RecordingSink;

    #[tokio::test]
    async fn passes_lines_through_under_the_cap() {
        let sink = Arc::new(RecordingSink::new());
        let id = DeploymentId::generate();
        let stream = LogStream::start(sink.clone(), id, 200);
        let log = stream.sink();
        for n in 0..5 {
            log(format!("line {n}"));
        }
        drop(log);
        let suppressed = stream.finish().await;
        assert_eq!(suppressed, 0);
        assert_eq!(sink.events().len(), 5);
    }

    #[tokio::test]
    async fn merges_overflow_into_a_tail_summary() {
        let sink = Arc::new(RecordingSink::new());
        let id = DeploymentId::generate();
        let stream = LogStream::start(sink.clone(), id, 10);
        let log = stream.sink();
        for n in 0..50 {
            log(format!("line {n}"));
        }
        drop(log);
        let suppressed = stream.finish().await;
        assert_eq!(suppressed, 40);

        let events = sink.events();
        // 10 lines plus the summary.
        assert_eq!(events.len(), 11);
        match &events.last().unwrap().payload {
            EventPayload::LogLine { line } => {
                assert!(line.contains("40 build log lines suppressed"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
