use tokio::task::{JoinError, JoinHandle};

/// A spawned task that is aborted if this goes out of scope before
/// it is joined.
///
/// ```rust
/// use raftline_stream::utils::async_utils::AbortOnDrop;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let task = AbortOnDrop::new(tokio::spawn(async { 1 + 1 }));
/// assert_eq!(task.join().await.unwrap(), 2);
/// # });
/// ```
#[must_use]
pub struct AbortOnDrop<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Wait for the task to finish.
    pub async fn join(mut self) -> Result<T, JoinError> {
        match self.handle.take() {
            Some(handle) => handle.await,
            // Only drop removes the handle.
            None => unreachable!("AbortOnDrop without a handle"),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
