//! Exclusively owned buffer moved between the coordinator and the worker.

/// Errors from reading or writing buffer storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Ownership was handed to the other side; the storage is unreachable from here.
    #[error("buffer is detached (ownership was transferred)")]
    Detached,

    #[error("index {index} out of bounds for buffer of {len} slots")]
    OutOfBounds { index: usize, len: usize },
}

/// Fixed-size block of `f64` slots with a single owner.
///
/// Moving the value moves ownership. `detach` additionally leaves a sentinel
/// in place of the original binding: a detached buffer has no storage and
/// every read or write fails with `BufferError::Detached`.
#[derive(Debug, Default, PartialEq)]
pub struct OwnedBuffer {
    slots: Box<[f64]>,
    detached: bool,
}

impl OwnedBuffer {
    /// Allocate a zeroed buffer of `len` slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![0.0; len].into_boxed_slice(),
            detached: false,
        }
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::from(values.to_vec())
    }

    fn detached() -> Self {
        Self {
            slots: Box::default(),
            detached: true,
        }
    }

    /// Move the storage out, leaving a detached sentinel behind.
    ///
    /// Detaching an already detached buffer returns another detached buffer.
    pub fn detach(&mut self) -> OwnedBuffer {
        std::mem::replace(self, Self::detached())
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Slot count; zero once detached.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.len() * super::SLOT_BYTES
    }

    pub fn as_slice(&self) -> Result<&[f64], BufferError> {
        if self.detached {
            return Err(BufferError::Detached);
        }
        Ok(&self.slots[..])
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [f64], BufferError> {
        if self.detached {
            return Err(BufferError::Detached);
        }
        Ok(&mut self.slots[..])
    }

    pub fn get(&self, index: usize) -> Result<f64, BufferError> {
        let slots = self.as_slice()?;
        slots.get(index).copied().ok_or(BufferError::OutOfBounds {
            index,
            len: slots.len(),
        })
    }

    /// Apply `f` in place to the first `length` slots, clamped to the buffer size.
    ///
    /// Returns the number of slots touched.
    pub fn update_prefix(
        &mut self,
        length: usize,
        f: impl Fn(f64) -> f64,
    ) -> Result<usize, BufferError> {
        let slots = self.as_mut_slice()?;
        let count = length.min(slots.len());
        for slot in &mut slots[..count] {
            *slot = f(*slot);
        }
        Ok(count)
    }

    pub fn into_vec(self) -> Result<Vec<f64>, BufferError> {
        if self.detached {
            return Err(BufferError::Detached);
        }
        Ok(self.slots.into_vec())
    }
}

impl From<Vec<f64>> for OwnedBuffer {
    fn from(values: Vec<f64>) -> Self {
        Self {
            slots: values.into_boxed_slice(),
            detached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_leaves_sentinel() {
        let mut buffer = OwnedBuffer::from_slice(&[8.0, 9.0, 10.0]);
        let moved = buffer.detach();

        assert!(buffer.is_detached());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.byte_len(), 0);
        assert_eq!(buffer.as_slice(), Err(BufferError::Detached));
        assert_eq!(buffer.get(0), Err(BufferError::Detached));

        assert!(!moved.is_detached());
        assert_eq!(moved.as_slice().unwrap(), &[8.0, 9.0, 10.0]);
    }

    #[test]
    fn detaching_twice_yields_detached() {
        let mut buffer = OwnedBuffer::new(2);
        let _ = buffer.detach();
        let second = buffer.detach();
        assert!(second.is_detached());
        assert_eq!(second.into_vec(), Err(BufferError::Detached));
    }

    #[test]
    fn update_prefix_mutates_in_place() {
        let mut buffer = OwnedBuffer::from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(buffer.update_prefix(2, |x| x * 2.0), Ok(2));
        assert_eq!(buffer.into_vec().unwrap(), vec![2.0, 4.0, 3.0]);
    }

    #[test]
    fn update_prefix_on_detached_fails() {
        let mut buffer = OwnedBuffer::new(1);
        let _ = buffer.detach();
        assert_eq!(
            buffer.update_prefix(1, |x| x * 2.0),
            Err(BufferError::Detached)
        );
    }

    #[test]
    fn get_reports_bounds() {
        let buffer = OwnedBuffer::new(1);
        assert_eq!(
            buffer.get(3),
            Err(BufferError::OutOfBounds { index: 3, len: 1 })
        );
    }
}
