use std::{collections::HashMap, sync::Arc};

use ahash::RandomState;

/// Heap-local symbol id. Ids are handed out sequentially, so the same name
/// usually maps to different ids in different heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<Arc<str>>,
    mappings: HashMap<Arc<str>, SymbolId, RandomState>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `name`, adding it if it is not interned yet.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.mappings.get(name) {
            return id;
        }
        let id = SymbolId(self.names.len() as u32);
        let interned = Arc::<str>::from(name);
        self.names.push(Arc::clone(&interned));
        self.mappings.insert(interned, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.mappings.get(name).copied()
    }

    pub fn resolve(&self, id: SymbolId) -> Option<&Arc<str>> {
        self.names.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Symbols in interning order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (SymbolId(i as u32), name.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ids_are_sequential_and_resolvable() {
        let mut table = SymbolTable::new();
        let a = table.intern("a");
        let b = table.intern("b");
        assert_eq!(a.index() + 1, b.index());
        assert_eq!(table.resolve(b).map(|s| s.as_ref()), Some("b"));
        assert_eq!(table.lookup("c"), None);
    }

    #[test]
    fn iteration_follows_interning_order() {
        let mut table = SymbolTable::new();
        for name in ["x", "y", "z"] {
            table.intern(name);
        }
        let names: Vec<_> = table.iter().map(|(_, n)| n.to_owned()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
    }
}
