//! Fixed-size batching of query results.

/// Split `items` into consecutive batches of at most `size` elements.
///
/// Produces `ceil(len / size)` batches, never an empty trailing batch, and
/// preserves order. A `size` of zero is treated as one.
pub fn batched<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// Batch an iterator lazily; used for streamed inputs such as JSON-line
/// dataset lists.
pub struct Batches<I: Iterator> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Batches<I> {
    pub fn new(inner: I, size: usize) -> Self {
        Self {
            inner,
            size: size.max(1),
        }
    }
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if batch.is_empty() { None } else { Some(batch) }
    }
}
