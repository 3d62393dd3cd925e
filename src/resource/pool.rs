//! Bounded task group
//!
//! Runs a batch of futures with at most `max_workers` in flight and hands
//! back every task's own result. A failing task never cancels its siblings.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Split `items` into owned chunks of at most `size`
pub fn chunks<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct TaskGroup {
    max_workers: usize,
}

impl TaskGroup {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run all tasks, results in completion order
    pub async fn run<I, F, Fut, T, E>(&self, items: I, task: F) -> Vec<Result<T, E>>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        stream::iter(items)
            .map(task)
            .buffer_unordered(self.max_workers)
            .collect()
            .await
    }

    /// Run all tasks, results in submission order
    pub async fn run_ordered<I, F, Fut, T, E>(&self, items: I, task: F) -> Vec<Result<T, E>>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        stream::iter(items)
            .map(task)
            .buffered(self.max_workers)
            .collect()
            .await
    }
}
