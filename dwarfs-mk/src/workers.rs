//! The ordered worker pool.
//!
//! Block compression runs on parallel threads, but blocks must hit the wire
//! in emission order; [`OrderedPool`] runs tasks concurrently while
//! delivering results strictly in submission order. (File hashing, the
//! other parallel stage, borrows from the scan and therefore runs on scoped
//! threads owned by the scanner.)
use std::{num::NonZero, panic, thread};

use crossbeam_channel as channel;

/// Run tasks in parallel while delivering results in submission order.
///
/// A fixed in-flight window provides backpressure: submitting blocks once
/// the window is full of results that cannot be delivered yet.
pub struct OrderedPool<R> {
    injector: Option<channel::Sender<Task<R>>>,
    collector: channel::Receiver<TaskResult<R>>,
    next_to_send: usize,
    next_to_recv: usize,
    /// Tasks submitted but not yet handed back to the caller.
    undelivered: usize,
    /// Completed-but-undeliverable results, indexed modulo the window size.
    window: Box<[Option<R>]>,
    threads: Box<[thread::JoinHandle<()>]>,
}

type Task<R> = (usize, Box<dyn FnOnce() -> R + Send>);
type TaskResult<R> = (usize, thread::Result<R>);

impl<R> std::fmt::Debug for OrderedPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPool")
            .field("threads", &self.threads.len())
            .field("window", &self.window.len())
            .field("undelivered", &self.undelivered)
            .finish_non_exhaustive()
    }
}

impl<R> Drop for OrderedPool<R> {
    fn drop(&mut self) {
        self.injector = None;
        let panicked = std::mem::take(&mut self.threads)
            .into_vec()
            .into_iter()
            .fold(false, |panicked, t| panicked | t.join().is_err());
        if panicked && !thread::panicking() {
            panic!("worker panicked");
        }
    }
}

impl<R: Send + 'static> OrderedPool<R> {
    pub fn new(name: &str, thread_cnt: NonZero<usize>) -> std::io::Result<Self> {
        // Allow some slack beyond the thread count so workers stay busy
        // while the consumer catches up.
        let window_len = thread_cnt.get() + thread_cnt.get().div_ceil(2);

        let (injector, injector_rx) = channel::bounded(window_len);
        let (collector_tx, collector) = channel::bounded(window_len);

        let threads = (0..thread_cnt.get())
            .map(|idx| {
                let rx = injector_rx.clone();
                let tx = collector_tx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || Self::worker(rx, tx))
            })
            .collect::<std::io::Result<Box<[_]>>>()?;

        Ok(Self {
            injector: Some(injector),
            collector,
            next_to_send: 0,
            next_to_recv: 0,
            undelivered: 0,
            window: std::iter::repeat_with(|| None).take(window_len).collect(),
            threads,
        })
    }

    fn worker(rx: channel::Receiver<Task<R>>, tx: channel::Sender<TaskResult<R>>) {
        while let Ok((index, task)) = rx.recv() {
            let ret = panic::catch_unwind(panic::AssertUnwindSafe(task));
            if tx.send((index, ret)).is_err() {
                break;
            }
        }
    }

    /// Submit a task and return whatever results are deliverable in order.
    pub fn submit(&mut self, task: impl FnOnce() -> R + Send + 'static) -> Vec<R> {
        let index = self.next_to_send;
        self.next_to_send = (self.next_to_send + 1) % self.window.len();
        self.undelivered += 1;

        // If the slot being reused is still pending, block until the
        // bottleneck task delivers.
        if self.next_to_send == self.next_to_recv {
            while self.window[self.next_to_recv].is_none() {
                let ret = self.collector.recv().expect("workers are alive");
                Self::store(ret, &mut self.window);
            }
        }

        self.injector
            .as_ref()
            .expect("pool is not stopped")
            .try_send((index, Box::new(task)))
            .expect("in-flight window bounds the queue");
        while let Ok(ret) = self.collector.try_recv() {
            Self::store(ret, &mut self.window);
        }

        self.take_deliverable()
    }

    /// Block until every submitted task has been delivered and return the
    /// remaining results in order.
    pub fn finish(&mut self) -> Vec<R> {
        let mut out = Vec::with_capacity(self.undelivered);
        while self.undelivered > 0 {
            if self.window[self.next_to_recv].is_none() {
                let ret = self.collector.recv().expect("workers are alive");
                Self::store(ret, &mut self.window);
            }
            out.append(&mut self.take_deliverable());
        }
        out
    }

    fn store((index, ret): TaskResult<R>, window: &mut [Option<R>]) {
        let v = match ret {
            Ok(v) => v,
            Err(_) => panic!("worker task panicked"),
        };
        assert!(window[index].is_none(), "in-flight window overflowed");
        window[index] = Some(v);
    }

    fn take_deliverable(&mut self) -> Vec<R> {
        let mut out = Vec::new();
        while let Some(elem) = self.window[self.next_to_recv].take() {
            self.next_to_recv = (self.next_to_recv + 1) % self.window.len();
            self.undelivered -= 1;
            out.push(elem);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn ordered_pool_preserves_submission_order() {
        let mut pool = OrderedPool::new("test", NonZero::new(4).unwrap()).unwrap();
        let mut out = Vec::new();
        for i in 0..100u64 {
            // Make late tasks finish first now and then.
            let delay = (i % 3) * 2;
            out.extend(pool.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis(delay));
                i
            }));
        }
        out.extend(pool.finish());
        assert_eq!(out, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn ordered_pool_finish_on_full_window() {
        let mut pool = OrderedPool::new("test", NonZero::new(2).unwrap()).unwrap();
        let mut out = Vec::new();
        for i in 0..3u64 {
            out.extend(pool.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                i
            }));
        }
        out.extend(pool.finish());
        assert_eq!(out, vec![0, 1, 2]);
    }
}
