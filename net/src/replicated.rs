//! Delta replication of a fixed ordered set of application-level values.
//!
//! A [`ReplicatedContainer`] registers typed cells in a fixed order; each [`send`](ReplicatedContainer::send)
//! emits one dirty bit per cell (packed through [`Buffer::write_bool`]) followed by
//! the values of the cells that changed since the last emission, then clears their
//! dirty flags. [`receive`](ReplicatedContainer::receive) mirrors the same layout.
//!
//! The source this is modeled on (`ReplicatedVariableBase`/`ReplicatedVariable<T>`)
//! used a polymorphic base class per cell; here each cell is instead an owned
//! trait object behind [`ErasedCell`], so the container never needs a common base
//! type for `T` beyond what [`SimpleCodec`] and `PartialEq` already require.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::codec::SimpleCodec;
use crate::error::PacketError;

struct Cell<T> {
    value: T,
    dirty: bool,
}

/// A handle to a single registered cell, returned by [`ReplicatedContainer::add`].
/// Cloning a handle shares the same underlying cell (and its dirty flag) with the
/// container.
pub struct CellHandle<T> {
    inner: Rc<RefCell<Cell<T>>>,
}

impl<T> Clone for CellHandle<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: PartialEq + Clone> CellHandle<T> {

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Replace the value. A no-op, including for dirtiness, if `value` equals the
    /// current one.
    pub fn set(&self, value: T) {
        let mut cell = self.inner.borrow_mut();
        if cell.value == value {
            return;
        }
        cell.value = value;
        cell.dirty = true;
    }

}

/// Object-safe adapter implemented for every registered cell, letting the container
/// hold a single `Vec` of heterogeneous cell types.
trait ErasedCell {
    fn dirty(&self) -> bool;
    fn clear_dirty(&self);
    fn write(&self, buf: &mut Buffer) -> Result<(), PacketError>;
    fn read(&self, buf: &mut Buffer) -> Result<(), PacketError>;
}

impl<T: SimpleCodec + PartialEq> ErasedCell for Rc<RefCell<Cell<T>>> {

    fn dirty(&self) -> bool {
        self.borrow().dirty
    }

    fn clear_dirty(&self) {
        self.borrow_mut().dirty = false;
    }

    fn write(&self, buf: &mut Buffer) -> Result<(), PacketError> {
        self.borrow().value.write(buf)
    }

    fn read(&self, buf: &mut Buffer) -> Result<(), PacketError> {
        let value = T::read(buf)?;
        self.borrow_mut().value = value;
        Ok(())
    }

}

/// An ordered registry of typed cells, replicated as a unit.
///
/// Sender and receiver MUST register cells in the same order with the same types;
/// the container has no way to check this and a mismatch silently desyncs the wire
/// format.
pub struct ReplicatedContainer {
    cells: Vec<Box<dyn ErasedCell>>,
    force: bool,
}

impl ReplicatedContainer {

    pub fn new() -> Self {
        Self { cells: Vec::new(), force: false }
    }

    /// Register a new cell holding `initial`, dirty from the start so that the first
    /// emission after registration always sends every value.
    pub fn add<T>(&mut self, initial: T) -> CellHandle<T>
    where
        T: SimpleCodec + PartialEq + 'static,
    {
        let cell = Rc::new(RefCell::new(Cell { value: initial, dirty: true }));
        self.cells.push(Box::new(cell.clone()));
        CellHandle { inner: cell }
    }

    /// Force every cell to be treated as dirty on the next [`send`](Self::send), even
    /// if unchanged.
    pub fn force(&mut self) {
        self.force = true;
    }

    /// Emit the dirty-bit vector followed by the values of the cells that are dirty
    /// or under `force`, then clear every emitted cell's dirty flag and the
    /// container's `force` flag.
    pub fn send(&mut self, buf: &mut Buffer) -> Result<(), PacketError> {
        for cell in &self.cells {
            buf.write_bool(cell.dirty() || self.force)?;
        }
        for cell in &self.cells {
            if cell.dirty() || self.force {
                cell.write(buf)?;
                cell.clear_dirty();
            }
        }
        self.force = false;
        Ok(())
    }

    /// Read the dirty-bit vector, then the values of the cells whose bit was set,
    /// replacing each cell's local value in registration order.
    pub fn receive(&mut self, buf: &mut Buffer) -> Result<(), PacketError> {
        let mut updated = Vec::with_capacity(self.cells.len());
        for _ in &self.cells {
            updated.push(buf.read_bool()?);
        }
        for (cell, &was_updated) in self.cells.iter().zip(&updated) {
            if was_updated {
                cell.read(buf)?;
            }
        }
        Ok(())
    }

}

impl Default for ReplicatedContainer {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn fresh_cell_is_dirty_and_sends_everything() {
        let mut tx = ReplicatedContainer::new();
        let a = tx.add::<i32>(10);
        let b = tx.add::<i32>(20);

        let mut buf = Buffer::new();
        tx.send(&mut buf).unwrap();

        let mut rx = ReplicatedContainer::new();
        let ra = rx.add::<i32>(0);
        let rb = rx.add::<i32>(0);
        rx.receive(&mut buf).unwrap();

        assert_eq!(ra.get(), a.get());
        assert_eq!(rb.get(), b.get());
        assert_eq!(ra.get(), 10);
        assert_eq!(rb.get(), 20);
    }

    #[test]
    fn unchanged_value_does_not_mark_dirty() {
        let mut tx = ReplicatedContainer::new();
        let a = tx.add::<i32>(10);

        let mut buf = Buffer::new();
        tx.send(&mut buf).unwrap(); // first emission, clears dirty.

        a.set(10); // same value.
        let mut buf2 = Buffer::new();
        tx.send(&mut buf2).unwrap();
        assert!(!buf2.read_bool().unwrap());

        a.set(11); // actual change.
        let mut buf3 = Buffer::new();
        tx.send(&mut buf3).unwrap();
        assert!(buf3.read_bool().unwrap());
        assert_eq!(buf3.read_i32().unwrap(), 11);
    }

}
