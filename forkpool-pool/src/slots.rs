//! Generation-stamped slot table for in-flight call state
//!
//! Slot indices are reused, so a bare index could confuse a late message for
//! a newer call occupying the same position. Every id therefore carries the
//! slot's generation; a lookup with a stale generation misses instead of
//! hitting the wrong call.

/// Slot id: index in the high half, generation in the low half
pub type SlotId = u64;

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct SlotTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn compose(index: u32, generation: u32) -> SlotId {
        (u64::from(index) << 32) | u64::from(generation)
    }

    fn decompose(id: SlotId) -> (u32, u32) {
        ((id >> 32) as u32, id as u32)
    }

    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = match entry {
                Entry::Vacant { generation } => *generation,
                Entry::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            *entry = Entry::Occupied { generation, value };
            return Self::compose(index, generation);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        Self::compose(index, 0)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        let (index, generation) = Self::decompose(id);
        match self.entries.get(index as usize) {
            Some(Entry::Occupied {
                generation: current,
                value,
            }) if *current == generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let (index, generation) = Self::decompose(id);
        match self.entries.get_mut(index as usize) {
            Some(Entry::Occupied {
                generation: current,
                value,
            }) if *current == generation => Some(value),
            _ => None,
        }
    }

    /// Remove and return the value, bumping the slot's generation so the id
    /// can never resolve again
    pub fn take(&mut self, id: SlotId) -> Option<T> {
        let (index, generation) = Self::decompose(id);
        let entry = self.entries.get_mut(index as usize)?;
        match entry {
            Entry::Occupied {
                generation: current,
                ..
            } if *current == generation => {
                let next = generation.wrapping_add(1);
                let old = std::mem::replace(entry, Entry::Vacant { generation: next });
                self.free.push(index);
                self.len -= 1;
                match old {
                    Entry::Occupied { value, .. } => Some(value),
                    Entry::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live ids, for sweeps that need to take entries matching a predicate
    pub fn ids(&self) -> Vec<SlotId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, .. } => {
                    Some(Self::compose(index as u32, *generation))
                }
                Entry::Vacant { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_take_roundtrip() {
        let mut table = SlotTable::new();
        let id = table.insert("a");
        assert_eq!(table.get(id), Some(&"a"));
        assert_eq!(table.take(id), Some("a"));
        assert_eq!(table.take(id), None);
        assert!(table.is_empty());
    }

    #[test]
    fn reused_slot_rejects_stale_id() {
        let mut table = SlotTable::new();
        let first = table.insert("first");
        table.take(first);

        let second = table.insert("second");
        // Same index, different generation
        assert_eq!(first >> 32, second >> 32);
        assert_ne!(first, second);
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"second"));
    }

    #[test]
    fn ids_lists_only_live_entries() {
        let mut table = SlotTable::new();
        let a = table.insert(1);
        let b = table.insert(2);
        let c = table.insert(3);
        table.take(b);

        let mut ids = table.ids();
        ids.sort_unstable();
        let mut expected = vec![a, c];
        expected.sort_unstable();
        assert_eq!(ids, expected);
        assert_eq!(table.len(), 2);
    }
}
