use tasksync_core::Collection;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::{ChangeEvent, LocalStore};
use crate::error::StorageError;

type QueryFn<T> = Box<dyn Fn() -> Result<Vec<T>, StorageError> + Send + Sync>;

/// A live result set. The first [`next`](Self::next) yields the current rows;
/// each later call waits for a committed change to one of the watched
/// collections and yields the re-queried rows if they differ from the last
/// emission.
pub struct Observation<T> {
    rx: broadcast::Receiver<ChangeEvent>,
    collections: Vec<Collection>,
    query: QueryFn<T>,
    last: Option<Vec<T>>,
}

impl<T: Clone + PartialEq> Observation<T> {
    pub(crate) fn new(
        store: &LocalStore,
        collections: &[Collection],
        query: impl Fn() -> Result<Vec<T>, StorageError> + Send + Sync + 'static,
    ) -> Self {
        // Subscribe before the first query so no change slips between them.
        Self {
            rx: store.changes(),
            collections: collections.to_vec(),
            query: Box::new(query),
            last: None,
        }
    }

    /// Run the query now without waiting.
    pub fn current(&self) -> Result<Vec<T>, StorageError> {
        (self.query)()
    }

    /// `None` once the store's change feed has closed.
    pub async fn next(&mut self) -> Option<Result<Vec<T>, StorageError>> {
        if self.last.is_none() {
            return Some(self.emit());
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if self.collections.contains(&event.collection) => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
            self.drain();
            match (self.query)() {
                Ok(rows) if self.last.as_ref() == Some(&rows) => continue,
                Ok(rows) => {
                    self.last = Some(rows.clone());
                    return Some(Ok(rows));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn emit(&mut self) -> Result<Vec<T>, StorageError> {
        let rows = (self.query)()?;
        self.last = Some(rows.clone());
        Ok(rows)
    }

    /// Coalesce a burst of queued events into one re-query.
    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}
