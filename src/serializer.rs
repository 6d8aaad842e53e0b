//! Serial execution of passes triggered from concurrent sources.
//!
//! The serializer keeps a single "tail": the most recently scheduled pass.
//! Scheduling a new pass chains it behind the current tail and makes it the
//! new tail in one step under a lock, so a third trigger always queues behind
//! the second rather than racing it. Passes therefore run one at a time, in
//! the order they were scheduled.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::error;

use crate::error::Error;

/// Handle to a scheduled pass. Resolves once the pass has settled.
pub type PassHandle = Shared<BoxFuture<'static, ()>>;

/// Receives the error built from a panicking pass.
pub type PanicHandler = Arc<dyn Fn(Error) + Send + Sync>;

pub struct Serializer {
    name: &'static str,
    tail: Mutex<PassHandle>,
    on_panic: PanicHandler,
}

impl Serializer {
    pub fn new(name: &'static str, on_panic: impl Fn(Error) + Send + Sync + 'static) -> Self {
        Self {
            name,
            tail: Mutex::new(futures_util::future::ready(()).boxed().shared()),
            on_panic: Arc::new(on_panic),
        }
    }

    /// Queues `pass` behind every previously scheduled pass and starts
    /// driving the chain on the tokio runtime.
    ///
    /// A panicking pass is logged, handed to the panic handler as
    /// [`Error::Panicked`] and treated as settled so later passes still run.
    /// Callers report ordinary failures from inside `pass`.
    pub fn schedule<F>(&self, pass: F) -> PassHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let on_panic = Arc::clone(&self.on_panic);
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tail.clone();

        let next = async move {
            previous.await;
            if let Err(payload) = AssertUnwindSafe(pass).catch_unwind().await {
                let message = panic_message(payload.as_ref());
                error!("{} pass panicked: {}; continuing with the next one", name, message);
                on_panic(Error::Panicked {
                    pass: name.to_string(),
                    message,
                });
            }
        }
        .boxed()
        .shared();

        *tail = next.clone();
        drop(tail);

        tokio::spawn(next.clone());
        next
    }

    /// Resolves once every pass scheduled so far has settled.
    pub fn idle(&self) -> PassHandle {
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn passes_never_overlap_and_keep_order() {
        let serializer = Serializer::new("test", |_| {});
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5u64 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let order = Arc::clone(&order);
            let _ = serializer.schedule(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Earlier passes sleep longer, so overlap would reorder them.
                tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                order.lock().unwrap().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        serializer.idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn panicking_pass_is_reported_and_does_not_break_the_chain() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let serializer = Serializer::new("test", move |err| {
            sink.lock().unwrap().push(err.to_string());
        });
        let ran = Arc::new(AtomicUsize::new(0));

        let _ = serializer.schedule(async {
            panic!("boom");
        });
        let counter = Arc::clone(&ran);
        serializer
            .schedule(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(*reported.lock().unwrap(), vec!["test pass panicked: boom"]);
    }
}
