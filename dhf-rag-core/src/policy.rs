//! Retrieval policy: on-demand categories stay out unless referenced

use crate::document::CategoryKey;
use crate::reference::ReferenceSet;

/// Anything the policy can judge by category and source file.
pub trait Categorized {
    fn category(&self) -> &str;
    fn file_name(&self) -> &str;
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalPolicy {
    on_demand: Vec<CategoryKey>,
}

impl RetrievalPolicy {
    pub fn new(on_demand: impl IntoIterator<Item = CategoryKey>) -> Self {
        Self {
            on_demand: on_demand.into_iter().collect(),
        }
    }

    pub fn is_on_demand(&self, category: &str) -> bool {
        self.on_demand.contains(&CategoryKey::new(category))
    }

    /// An on-demand item is admitted only when a context reference names its
    /// category, and its file when the reference names one.
    pub fn admits<T: Categorized + ?Sized>(&self, item: &T, refs: &ReferenceSet) -> bool {
        !self.is_on_demand(item.category()) || refs.names_context(item.category(), item.file_name())
    }

    /// Keep admitted items, preserving order.
    pub fn filter<T: Categorized>(&self, items: Vec<T>, refs: &ReferenceSet) -> Vec<T> {
        items
            .into_iter()
            .filter(|item| self.admits(item, refs))
            .collect()
    }
}

impl<T: Categorized + ?Sized> Categorized for &T {
    fn category(&self) -> &str {
        (**self).category()
    }

    fn file_name(&self) -> &str {
        (**self).file_name()
    }
}
