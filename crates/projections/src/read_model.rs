//! Read model trait for query-side views.

/// A read model that can report what it holds.
pub trait ReadModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of entities tracked by the view.
    fn count(&self) -> usize;
}
