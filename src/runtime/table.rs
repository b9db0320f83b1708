use std::rc::Rc;

// Growth triggers when used + tombstone slots would exceed 3/4 of capacity.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const MIN_CAPACITY: usize = 8;

/// FNV-1a over the raw bytes of a key.
pub fn hash_str(key: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug, Clone)]
struct Entry<V> {
    key: Rc<str>,
    hash: u32,
    value: V,
}

#[derive(Debug, Clone)]
enum Slot<V> {
    Empty,
    /// A deleted entry. Left in place so probe sequences that passed through
    /// this slot still terminate correctly.
    Tombstone,
    Used(Entry<V>),
}

/// Open-addressing, string-keyed hash table with linear probing and tombstone
/// deletion. Capacity is always a power of two; lookups wrap with a mask.
///
/// Shared by the VM's globals, instance fields, class method dictionaries,
/// and the heap's string-interning set.
#[derive(Debug, Clone)]
pub struct Table<V> {
    slots: Vec<Slot<V>>,
    /// Used entries.
    live: usize,
    /// Used entries plus tombstones; drives the load-factor check.
    filled: usize,
}

impl<V: Clone> Default for Table<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Table<V> {
    pub fn new() -> Self {
        Table {
            slots: Vec::new(),
            live: 0,
            filled: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        if self.live == 0 {
            return None;
        }
        match self.probe(key, hash_str(key)) {
            Probe::Found(idx) => match &self.slots[idx] {
                Slot::Used(entry) => Some(&entry.value),
                _ => None,
            },
            Probe::Insert(_) => None,
        }
    }

    /// Insert or update. Returns `true` when the key was newly inserted,
    /// `false` when an existing entry was overwritten.
    pub fn set(&mut self, key: Rc<str>, value: V) -> bool {
        if (self.filled + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM {
            self.grow();
        }

        let hash = hash_str(&key);
        match self.probe(&key, hash) {
            Probe::Found(idx) => {
                if let Slot::Used(entry) = &mut self.slots[idx] {
                    entry.value = value;
                }
                false
            }
            Probe::Insert(idx) => {
                // Reusing a tombstone does not raise the fill count.
                if matches!(self.slots[idx], Slot::Empty) {
                    self.filled += 1;
                }
                self.slots[idx] = Slot::Used(Entry { key, hash, value });
                self.live += 1;
                true
            }
        }
    }

    /// Tombstone the entry for `key`. Returns whether the key existed.
    pub fn delete(&mut self, key: &str) -> bool {
        if self.live == 0 {
            return false;
        }
        match self.probe(key, hash_str(key)) {
            Probe::Found(idx) => {
                self.slots[idx] = Slot::Tombstone;
                self.live -= 1;
                true
            }
            Probe::Insert(_) => false,
        }
    }

    /// Copy every live entry of `other` into `self`. Used for class
    /// inheritance: a one-time bulk copy, not a live reference.
    pub fn add_all(&mut self, other: &Table<V>) {
        for (key, value) in other.iter() {
            self.set(key.clone(), value.clone());
        }
    }

    /// Content lookup returning the stored key itself; the basis of string
    /// interning.
    pub fn find_key(&self, key: &str) -> Option<Rc<str>> {
        if self.live == 0 {
            return None;
        }
        match self.probe(key, hash_str(key)) {
            Probe::Found(idx) => match &self.slots[idx] {
                Slot::Used(entry) => Some(entry.key.clone()),
                _ => None,
            },
            Probe::Insert(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Used(entry) => Some((&entry.key, &entry.value)),
            _ => None,
        })
    }

    fn probe(&self, key: &str, hash: u32) -> Probe {
        debug_assert!(!self.slots.is_empty(), "probe on empty table");
        let mask = self.slots.len() - 1;
        let mut idx = hash as usize & mask;
        let mut first_tombstone = None;

        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    return Probe::Insert(first_tombstone.unwrap_or(idx));
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Used(entry) => {
                    if entry.hash == hash && &*entry.key == key {
                        return Probe::Found(idx);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Double capacity and rehash every live entry into fresh storage,
    /// discarding tombstones.
    fn grow(&mut self) {
        let new_cap = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(
            &mut self.slots,
            std::iter::repeat_with(|| Slot::Empty).take(new_cap).collect(),
        );

        self.live = 0;
        self.filled = 0;
        for slot in old {
            if let Slot::Used(entry) = slot {
                let mask = new_cap - 1;
                let mut idx = entry.hash as usize & mask;
                while !matches!(self.slots[idx], Slot::Empty) {
                    idx = (idx + 1) & mask;
                }
                self.slots[idx] = Slot::Used(entry);
                self.live += 1;
                self.filled += 1;
            }
        }
    }
}

enum Probe {
    /// Index of the entry holding the key.
    Found(usize),
    /// Index of the slot an insert should use.
    Insert(usize),
}
