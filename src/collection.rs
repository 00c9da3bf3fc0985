//! Collection shapes and the resumable batch enumerator.

use async_trait::async_trait;

use crate::cursor::{CursorError, Position};

/// A collection that supports random slicing. The cursor is a plain
/// offset of items already consumed.
#[async_trait]
pub trait Sliceable: Send + Sync {
    /// Total number of items.
    async fn size(&self) -> Result<u64, anyhow::Error>;

    /// Items in `[start, start + len)`, in stable order. May return fewer
    /// than `len` at the end of the collection.
    async fn slice(&self, start: u64, len: u64) -> Result<Vec<serde_json::Value>, anyhow::Error>;
}

/// A collection ordered by a key, filtered with `key > cursor`. The
/// cursor is the key of the last processed item, so the sequence stays
/// correct if rows are inserted or deleted ahead of the cursor between
/// invocations.
#[async_trait]
pub trait Keyed: Send + Sync {
    /// Up to `limit` items strictly after `key` (or from the start when
    /// `key` is `None`), each paired with its own ordering-key values.
    async fn after(
        &self,
        key: Option<&[serde_json::Value]>,
        limit: u64,
    ) -> Result<Vec<(serde_json::Value, Vec<serde_json::Value>)>, anyhow::Error>;
}

/// The collection a task iterates, in one of the two supported shapes.
pub enum Collection {
    Sliced(Box<dyn Sliceable>),
    Keyed(Box<dyn Keyed>),
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Collection::Sliced(_) => f.write_str("Collection::Sliced(..)"),
            Collection::Keyed(_) => f.write_str("Collection::Keyed(..)"),
        }
    }
}

/// In-memory sliceable collection over a vector of JSON items.
pub struct VecCollection {
    items: Vec<serde_json::Value>,
}

impl VecCollection {
    pub fn new(items: Vec<serde_json::Value>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl Sliceable for VecCollection {
    async fn size(&self) -> Result<u64, anyhow::Error> {
        Ok(self.items.len() as u64)
    }

    async fn slice(&self, start: u64, len: u64) -> Result<Vec<serde_json::Value>, anyhow::Error> {
        let start = start as usize;
        if start >= self.items.len() {
            return Ok(Vec::new());
        }
        let end = (start + len as usize).min(self.items.len());
        Ok(self.items[start..end].to_vec())
    }
}

/// One batch: items in order, each paired with the cursor that resumes
/// strictly after it.
pub type Batch = Vec<(serde_json::Value, Position)>;

/// Drives a collection from a resume position, one bounded batch at a
/// time. Never materializes more than one batch into memory.
#[derive(Debug)]
pub struct BatchEnumerator {
    collection: Collection,
    batch_size: u64,
    position: Option<Position>,
}

impl BatchEnumerator {
    /// Create an enumerator resuming at `position` (`None` starts from
    /// the beginning). Fails if the cursor shape does not match the
    /// collection shape.
    pub fn new(
        collection: Collection,
        batch_size: u64,
        position: Option<Position>,
    ) -> Result<Self, CursorError> {
        match (&collection, &position) {
            (Collection::Sliced(_), Some(Position::Key(_))) => {
                return Err(CursorError::Corrupt(
                    "key cursor replayed against a sliceable collection".to_string(),
                ));
            }
            (Collection::Keyed(_), Some(Position::Offset(_))) => {
                return Err(CursorError::Corrupt(
                    "offset cursor replayed against a keyed collection".to_string(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            collection,
            batch_size,
            position,
        })
    }

    /// The next batch, or `None` when the collection is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>, anyhow::Error> {
        let batch = match &self.collection {
            Collection::Sliced(sliced) => {
                let start = match &self.position {
                    Some(Position::Offset(n)) => *n,
                    _ => 0,
                };
                let items = sliced.slice(start, self.batch_size).await?;
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| (item, Position::Offset(start + i as u64 + 1)))
                    .collect::<Batch>()
            }
            Collection::Keyed(keyed) => {
                let key = match &self.position {
                    Some(Position::Key(k)) => Some(k.as_slice()),
                    _ => None,
                };
                let items = keyed.after(key, self.batch_size).await?;
                items
                    .into_iter()
                    .map(|(item, key)| (item, Position::Key(key)))
                    .collect::<Batch>()
            }
        };

        if batch.is_empty() {
            return Ok(None);
        }

        // Advance past the batch so the next call continues from there.
        self.position = batch.last().map(|(_, pos)| pos.clone());
        Ok(Some(batch))
    }
}
