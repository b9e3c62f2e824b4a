//! Value cell with change tracking.
//!
//! Request cells are written with [`store`](DirtyCell::store), whose dirty flag tells the
//! caller whether that very store changed anything. Derived cells are written with
//! [`update`](DirtyCell::update) and consumed by a single reader (the frame commit), which
//! incorporates the value and then calls [`clear_dirty`](DirtyCell::clear_dirty).

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DirtyCell<T> {
    value: T,
    dirty: bool,
}

impl<T: Copy + PartialEq> DirtyCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    /// Stores `value`; the cell is dirty iff `value` differs from the previous value.
    pub fn store(&mut self, value: T) {
        self.dirty = value != self.value;
        self.value = value;
    }

    /// Stores `value`, marking the cell dirty if it changed. A pending change is kept.
    pub fn update(&mut self, value: T) {
        if value != self.value {
            self.value = value;
            self.dirty = true;
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Forces the current value to be consumed again.
    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Sets a known baseline: the value is replaced and nothing is pending.
    pub fn reset(&mut self, value: T) {
        self.value = value;
        self.dirty = false;
    }
}
