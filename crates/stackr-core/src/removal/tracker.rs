use std::collections::BTreeSet;
use std::sync::Mutex;

/// Last observed set of stack names.
#[derive(Debug, Default)]
pub struct InventoryTracker {
    known: Mutex<BTreeSet<String>>,
}

impl InventoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory without reporting anything.
    pub fn seed<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        *self.known.lock().unwrap_or_else(|e| e.into_inner()) = names.into_iter().collect();
    }

    /// Names present last time but missing from `current`. The inventory is
    /// replaced by `current` either way, so each removal is reported once.
    pub fn diff(&self, current: &BTreeSet<String>) -> Vec<String> {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let removed = known.difference(current).cloned().collect();
        *known = current.clone();
        removed
    }

    pub fn len(&self) -> usize {
        self.known.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
