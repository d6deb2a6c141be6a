//! Bounded selection of the smallest items.
//!
//! Eviction needs the `x` least recently updated blocks out of possibly
//! millions. Keeping a max-heap capped at `x` makes that one pass with
//! `O(n log x)` work and `O(x)` memory instead of sorting everything.

use std::collections::BinaryHeap;

/// Keeps the `limit` smallest items offered to it.
#[derive(Debug)]
pub struct OldestSet<T: Ord> {
    limit: usize,
    heap: BinaryHeap<T>,
}

impl<T: Ord> OldestSet<T> {
    pub fn new(limit: usize) -> Self {
        Self { limit, heap: BinaryHeap::with_capacity(limit.min(4_096)) }
    }

    /// Offer one item; it is kept only if it ranks among the smallest so far.
    pub fn offer(&mut self, item: T) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() < self.limit {
            self.heap.push(item);
            return;
        }
        let replaces_top = self.heap.peek().is_some_and(|top| item < *top);
        if replaces_top {
            self.heap.pop();
            self.heap.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The kept items, smallest first.
    pub fn into_sorted_vec(self) -> Vec<T> {
        self.heap.into_sorted_vec()
    }
}

impl<T: Ord> Extend<T> for OldestSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.offer(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_keeps_smallest() {
        let mut set = OldestSet::new(3);
        set.extend([9, 4, 7, 1, 8, 2, 6]);
        assert_eq!(set.into_sorted_vec(), vec![1, 2, 4]);
    }

    #[test]
    fn test_fewer_items_than_limit() {
        let mut set = OldestSet::new(10);
        set.extend([3, 1]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.into_sorted_vec(), vec![1, 3]);
    }

    #[test]
    fn test_zero_limit() {
        let mut set = OldestSet::new(0);
        set.extend([1, 2, 3]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_matches_full_sort() {
        let mut items: Vec<(u64, String)> = (0..500)
            .map(|i| ((i * 7919) % 211, format!("b{i}")))
            .collect();
        items.shuffle(&mut rand::thread_rng());

        let mut set = OldestSet::new(25);
        set.extend(items.iter().cloned());

        items.sort();
        items.truncate(25);
        assert_eq!(set.into_sorted_vec(), items);
    }
}
