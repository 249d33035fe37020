use crate::value::{HeapObj, Obj, ObjRef, Value};

const TABLE_MAX_LOAD: f64 = 0.75;

// keys are interned strings, so index identity is content identity; a
// tombstone is key = None with a true value, an empty slot a nil value
#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

const EMPTY: Entry = Entry { key: None, value: Value::Nil };

/// Open-addressing table with linear probing, keyed by interned string
/// references. Capacity is always zero or a power of two. `count` tracks
/// live plus tombstone slots so probe chains stay terminated.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

fn key_hash(objects: &[Option<HeapObj>], key: ObjRef) -> u32 {
    match &objects[key].as_ref().expect("table key was freed").body {
        Obj::Str(s) => s.hash,
        _ => unreachable!("table keys are interned strings"),
    }
}

fn find_entry(entries: &[Entry], objects: &[Option<HeapObj>], key: ObjRef) -> usize {
    let mask = entries.len() - 1;
    let mut index = key_hash(objects, key) as usize & mask;
    let mut tombstone: Option<usize> = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            None => {
                if matches!(entry.value, Value::Nil) {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(k) if k == key => return index,
            Some(_) => {}
        }
        index = (index + 1) & mask;
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 { 8 } else { capacity * 2 }
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: vec![] }
    }

    pub fn get(&self, objects: &[Option<HeapObj>], key: ObjRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, objects, key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or overwrites. Returns true when the key was not present.
    pub fn set(&mut self, objects: &[Option<HeapObj>], key: ObjRef, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            self.adjust_capacity(objects, grow_capacity(self.entries.len()));
        }

        let index = find_entry(&self.entries, objects, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // filling a tombstone reuses its slot in the count
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    pub fn delete(&mut self, objects: &[Option<HeapObj>], key: ObjRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = find_entry(&self.entries, objects, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    fn adjust_capacity(&mut self, objects: &[Option<HeapObj>], capacity: usize) {
        let mut entries = vec![EMPTY; capacity];
        // tombstones are dropped; only live entries carry over
        self.count = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let index = find_entry(&entries, objects, key);
            entries[index] = Entry { key: Some(key), value: entry.value };
            self.count += 1;
        }
        self.entries = entries;
    }

    /// The interning probe: matches by hash, then by byte content, and hands
    /// back the canonical string object.
    pub fn find_string(&self, objects: &[Option<HeapObj>], chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    if let Obj::Str(s) = &objects[key].as_ref().expect("table key was freed").body {
                        if s.hash == hash && s.chars == chars {
                            return Some(key);
                        }
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Deletes every entry whose key object went unmarked this cycle. Run
    /// after tracing and before sweep so the intern pool never dangles.
    pub fn remove_white(&mut self, objects: &[Option<HeapObj>]) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                let marked = objects[key].as_ref().map_or(false, |o| o.header.marked);
                if !marked {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{hash_str, ObjHeader, StrObj};
    use proptest::prelude::*;
    use std::collections::HashMap;

    // a bare arena of interned strings, enough for table tests
    fn arena(names: &[&str]) -> Vec<Option<HeapObj>> {
        names
            .iter()
            .map(|n| {
                Some(HeapObj {
                    header: ObjHeader { marked: false, next: None, size: 0 },
                    body: Obj::Str(StrObj { chars: n.to_string(), hash: hash_str(n) }),
                })
            })
            .collect()
    }

    #[test]
    fn set_get_and_overwrite() {
        let objects = arena(&["a", "b"]);
        let mut table = Table::new();
        assert!(table.set(&objects, 0, Value::Number(1.0)));
        assert!(table.set(&objects, 1, Value::Number(2.0)));
        assert!(!table.set(&objects, 0, Value::Number(3.0)));
        assert!(matches!(table.get(&objects, 0), Some(Value::Number(n)) if n == 3.0));
        assert!(matches!(table.get(&objects, 1), Some(Value::Number(n)) if n == 2.0));
    }

    #[test]
    fn missing_keys_and_empty_table() {
        let objects = arena(&["a"]);
        let table = Table::new();
        assert!(table.get(&objects, 0).is_none());
        let mut table = Table::new();
        assert!(!table.delete(&objects, 0));
    }

    #[test]
    fn delete_leaves_a_tombstone_that_keeps_probing_alive() {
        // three keys forced into one probe chain would need colliding hashes;
        // instead verify the observable contract: delete one of many, the
        // rest stay reachable, and the slot can be refilled
        let names: Vec<String> = (0..32).map(|i| format!("k{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let objects = arena(&refs);
        let mut table = Table::new();
        for i in 0..32 {
            table.set(&objects, i, Value::Number(i as f64));
        }
        assert!(table.delete(&objects, 17));
        assert!(table.get(&objects, 17).is_none());
        for i in (0..32).filter(|&i| i != 17) {
            assert!(table.get(&objects, i).is_some(), "lost key {i}");
        }
        // refilling a tombstone must not grow the occupancy count
        let count_before = table.count;
        assert!(table.set(&objects, 17, Value::Nil));
        assert_eq!(table.count, count_before);
    }

    #[test]
    fn capacity_stays_a_power_of_two() {
        let names: Vec<String> = (0..100).map(|i| format!("k{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let objects = arena(&refs);
        let mut table = Table::new();
        for i in 0..100 {
            table.set(&objects, i, Value::Nil);
        }
        assert!(table.entries.len().is_power_of_two());
        assert!(table.iter().count() == 100);
    }

    #[test]
    fn find_string_matches_by_content() {
        let objects = arena(&["foo", "bar"]);
        let mut table = Table::new();
        table.set(&objects, 0, Value::Nil);
        table.set(&objects, 1, Value::Nil);
        assert_eq!(table.find_string(&objects, "foo", hash_str("foo")), Some(0));
        assert_eq!(table.find_string(&objects, "baz", hash_str("baz")), None);
    }

    #[test]
    fn remove_white_drops_unmarked_keys() {
        let mut objects = arena(&["live", "dead"]);
        objects[0].as_mut().unwrap().header.marked = true;
        let mut table = Table::new();
        table.set(&objects, 0, Value::Nil);
        table.set(&objects, 1, Value::Nil);
        table.remove_white(&objects);
        assert!(table.get(&objects, 0).is_some());
        assert!(table.get(&objects, 1).is_none());
    }

    proptest! {
        // model-check insert/overwrite/delete/lookup against HashMap
        #[test]
        fn behaves_like_a_map(ops in proptest::collection::vec((0usize..24, 0u8..3, -100f64..100.0), 0..200)) {
            let names: Vec<String> = (0..24).map(|i| format!("key{i}")).collect();
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let objects = arena(&refs);
            let mut table = Table::new();
            let mut model: HashMap<usize, f64> = HashMap::new();

            for (key, op, n) in ops {
                match op {
                    0 => {
                        let is_new = table.set(&objects, key, Value::Number(n));
                        prop_assert_eq!(is_new, model.insert(key, n).is_none());
                    }
                    1 => {
                        let deleted = table.delete(&objects, key);
                        prop_assert_eq!(deleted, model.remove(&key).is_some());
                    }
                    _ => {
                        let got = table.get(&objects, key);
                        match model.get(&key) {
                            Some(&expect) => {
                                prop_assert!(matches!(got, Some(Value::Number(v)) if v == expect));
                            }
                            None => prop_assert!(got.is_none()),
                        }
                    }
                }
            }
            prop_assert_eq!(table.iter().count(), model.len());
        }
    }
}
