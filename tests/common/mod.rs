#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use requeue::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub fn start_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
}

pub fn policy_3() -> RetryPolicy {
    RetryPolicy::builder().max_attempts(3).delays_ms([100, 200, 300]).build().unwrap()
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Handler that fails its first `failures` calls, then succeeds. Returns the call counter.
pub fn flaky(failures: usize) -> (requeue::MessageHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = message_handler(move |_| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err::<(), HandlerError>(format!("handler failure #{}", n + 1).into())
            } else {
                Ok(())
            }
        }
    });
    (handler, calls)
}

/// Captures formatted tracing output.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
