//! Binary min-heap keyed by expiration timestamp.
//!
//! Every item carries its current array position so the heap can report
//! where a freshly pushed item landed (the delay queue only needs to know
//! whether it became the head) and remove an item by position in O(log n).

/// An entry in the [`PriorityQueue`].
#[derive(Debug, Clone)]
pub struct Item<T> {
    pub value: T,
    /// Expiration timestamp in epoch milliseconds. Lower pops first.
    pub priority: i64,
    index: usize,
}

impl<T> Item<T> {
    pub fn new(value: T, priority: i64) -> Self {
        Self {
            value,
            priority,
            index: usize::MAX,
        }
    }

    /// Position in the heap array. `usize::MAX` once the item left the heap.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Min-heap of [`Item`]s ordered by `priority`. Ties pop in unspecified order.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    items: Vec<Item<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> PriorityQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The earliest-expiring item, if any.
    pub fn peek(&self) -> Option<&Item<T>> {
        self.items.first()
    }

    /// Insert an item and return the position it settled at.
    pub fn push(&mut self, mut item: Item<T>) -> usize {
        let n = self.items.len();
        item.index = n;
        self.items.push(item);
        self.up(n)
    }

    /// Remove and return the earliest-expiring item.
    pub fn pop(&mut self) -> Option<Item<T>> {
        let n = self.items.len().checked_sub(1)?;
        self.swap(0, n);
        self.down(0, n);
        let mut item = self.items.pop()?;
        item.index = usize::MAX;
        Some(item)
    }

    /// Remove the item currently at `index`.
    pub fn remove(&mut self, index: usize) -> Option<Item<T>> {
        let n = self.items.len().checked_sub(1)?;
        if index > n {
            return None;
        }
        if index != n {
            self.swap(index, n);
            if !self.down(index, n) {
                self.up(index);
            }
        }
        let mut item = self.items.pop()?;
        item.index = usize::MAX;
        Some(item)
    }

    /// Pop the head if it has expired at `now`.
    ///
    /// Returns `(None, 0)` when empty, `(None, delta)` with `delta > 0` being
    /// the milliseconds until the head expires, or `(Some(head), 0)`.
    pub fn peek_and_shift(&mut self, now: i64) -> (Option<Item<T>>, i64) {
        let Some(head) = self.items.first() else {
            return (None, 0);
        };
        if head.priority > now {
            return (None, head.priority - now);
        }
        (self.pop(), 0)
    }

    fn up(&mut self, mut j: usize) -> usize {
        while j > 0 {
            let i = (j - 1) / 2;
            if self.items[j].priority >= self.items[i].priority {
                break;
            }
            self.swap(i, j);
            j = i;
        }
        j
    }

    fn down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut j = left;
            let right = left + 1;
            if right < n && self.items[right].priority < self.items[left].priority {
                j = right;
            }
            if self.items[j].priority >= self.items[i].priority {
                break;
            }
            self.swap(i, j);
            i = j;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        self.items[i].index = i;
        self.items[j].index = j;
    }
}
