//! A fixed-capacity integer hash table.
//!
//! The codepoint interner needs a map that never allocates on lookup and
//! never rehashes, because it is queried on every single hook event. Buckets
//! are kept in a flat arena and chained through indexes; the head array maps
//! a hash to the first bucket of its chain. There is no deletion: codepoints
//! live for the whole trace.

use thiserror::Error;

/// The table has reached its fixed capacity.
#[derive(Error, Clone, Debug)]
#[error("hash table full")]
pub struct TableFull;

struct Bucket {
    key: u64,
    value: u16,
    next: i32,
}

/// A u64 → u16 map with externally supplied hashes and separate chaining.
pub struct IntTable {
    heads: Vec<i32>,
    buckets: Vec<Bucket>,
}

impl IntTable {
    /// Constructs a table that holds at most `capacity` entries.
    ///
    /// `capacity` also serves as the number of hash chains; it is expected to
    /// be at least the number of entries ever inserted and need not be a
    /// power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { heads: vec![-1; capacity], buckets: Vec::new() }
    }

    /// Looks up `key` under `hash`. Returns `None` when the key is missing.
    pub fn get(&self, hash: u32, key: u64) -> Option<u16> {
        let mut index = self.heads[hash as usize % self.heads.len()];
        while index >= 0 {
            let bucket = &self.buckets[index as usize];
            if bucket.key == key {
                return Some(bucket.value);
            }
            index = bucket.next;
        }
        None
    }

    /// Inserts or replaces `key` under `hash`.
    ///
    /// A new key is appended at the tail of its hash chain; an existing key
    /// has its value replaced in place. Fails once `capacity` distinct keys
    /// are stored, but lookups keep working on a full table.
    pub fn set(&mut self, hash: u32, key: u64, value: u16) -> Result<(), TableFull> {
        let head = hash as usize % self.heads.len();
        let mut index = self.heads[head];

        if index < 0 {
            // No collision, this chain is empty.
            let added = self.add(key, value)?;
            self.heads[head] = added;
            return Ok(());
        }

        // Walk to the terminal bucket; replace on the way if the key exists.
        loop {
            let bucket = &mut self.buckets[index as usize];
            if bucket.key == key {
                bucket.value = value;
                return Ok(());
            }
            if bucket.next < 0 {
                break;
            }
            index = bucket.next;
        }

        let added = self.add(key, value)?;
        self.buckets[index as usize].next = added;
        Ok(())
    }

    #[inline]
    fn add(&mut self, key: u64, value: u16) -> Result<i32, TableFull> {
        if self.buckets.len() >= self.heads.len() {
            return Err(TableFull);
        }
        self.buckets.push(Bucket { key, value, next: -1 });
        Ok((self.buckets.len() - 1) as i32)
    }
}

#[cfg(test)]
mod tests {
    use crate::htable::IntTable;

    #[test]
    fn test_get_set() {
        let mut table = IntTable::with_capacity(128);
        assert_eq!(table.get(7, 7), None);

        table.set(7, 7, 1).unwrap();
        table.set(9, 9, 2).unwrap();
        assert_eq!(table.get(7, 7), Some(1));
        assert_eq!(table.get(9, 9), Some(2));

        // Replacing keeps the chain intact.
        table.set(7, 7, 3).unwrap();
        assert_eq!(table.get(7, 7), Some(3));
    }

    #[test]
    fn test_collisions() {
        let mut table = IntTable::with_capacity(4);
        // Same hash, distinct keys: all end up chained in one bucket list.
        table.set(1, 100, 10).unwrap();
        table.set(1, 200, 20).unwrap();
        table.set(1, 300, 30).unwrap();
        assert_eq!(table.get(1, 100), Some(10));
        assert_eq!(table.get(1, 200), Some(20));
        assert_eq!(table.get(1, 300), Some(30));
        assert_eq!(table.get(1, 400), None);
    }

    #[test]
    fn test_full_table_still_serves_lookups() {
        let mut table = IntTable::with_capacity(2);
        table.set(0, 0, 0).unwrap();
        table.set(1, 1, 1).unwrap();
        assert!(table.set(2, 2, 2).is_err());

        assert_eq!(table.get(0, 0), Some(0));
        assert_eq!(table.get(1, 1), Some(1));
        // Replacement of an existing key is not an insertion.
        table.set(1, 1, 9).unwrap();
        assert_eq!(table.get(1, 1), Some(9));
    }
}
