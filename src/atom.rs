//! Interned atoms: a name <-> small-integer table, global to a display
//! instance. Ids are handed out monotonically from 1 (0 is None) and are
//! never reused.

use std::collections::HashMap;

pub struct AtomTable {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
    next_id: u32,
}

impl AtomTable {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        }
    }

    /// Intern an atom. With `only_if_exists` set, a missing name returns
    /// `None` instead of allocating.
    pub fn intern(&mut self, name: &str, only_if_exists: bool) -> Option<u32> {
        if let Some(&id) = self.by_name.get(name) {
            return Some(id);
        }
        if only_if_exists || name.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        Some(id)
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern("FOO", false).unwrap();
        let b = atoms.intern("FOO", false).unwrap();
        assert_eq!(a, b);
        assert_eq!(atoms.name(a), Some("FOO"));
    }

    #[test]
    fn ids_start_at_one_and_grow() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern("A", false), Some(1));
        assert_eq!(atoms.intern("B", false), Some(2));
        assert_eq!(atoms.intern("A", false), Some(1));
        assert_eq!(atoms.intern("C", false), Some(3));
    }

    #[test]
    fn only_if_exists_suppresses_creation() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern("MISSING", true), None);
        let id = atoms.intern("MISSING", false).unwrap();
        assert_eq!(atoms.intern("MISSING", true), Some(id));
    }

    #[test]
    fn empty_name_is_never_interned() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern("", false), None);
    }

    #[test]
    fn unknown_id_has_no_name() {
        let atoms = AtomTable::new();
        assert_eq!(atoms.name(42), None);
    }
}
