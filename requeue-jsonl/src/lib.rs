//! JSONL sink for `requeue`. Appends one retry event per line.
//! The file is created on first write; bring your own path and rotation.

use requeue::telemetry::{event_to_json, RetryEvent, TelemetrySink};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<RetryEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RetryEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let result = async {
                let mut file =
                    tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(err) = &result {
                tracing::debug!(
                    target: "requeue::telemetry",
                    path = %path.display(),
                    error = %err,
                    "jsonl sink write failed"
                );
            }
            result
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
