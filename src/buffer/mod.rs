//! Growable byte buffers with masked secure regions.
//!
//! A [`SecureBuffer`] owns a single pooled [`Chunk`] and tracks the occupied
//! byte range `[lower_bound, upper_bound)` inside it. Bytes are appended at
//! the tail, prepended at the head, and consumed from the head. When the free
//! space around the data runs out the buffer compacts, shifts or relocates the
//! data into a larger chunk checked out from the same [`ChunkPool`].
//!
//! # Secure regions
//!
//! A [`SecureRegion`] marks sensitive bytes (card numbers, PIN blocks) so that
//! diagnostic dumps can mask them. Regions are expressed in storage offsets,
//! the same coordinate system as the bounds, and every move of the data
//! (compaction, prepend shift, relocation on growth) translates the regions by
//! the same delta.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use courier::buffer::{SecureBuffer, pool::TrivialPool};
//!
//! let mut buffer = SecureBuffer::new(Arc::new(TrivialPool::default()));
//! buffer.write(false, b"ABCDE").unwrap();
//! buffer.write(true, b"FG").unwrap();
//!
//! assert_eq!(buffer.read(true, 7).unwrap(), b"FGABCDE");
//! assert!(buffer.is_empty());
//! ```
mod dump;
pub mod pool;

use std::{
    fmt,
    io::{IoSlice, IoSliceMut},
    sync::Arc,
};

use thiserror::Error;

use pool::{Chunk, ChunkPool};

pub use dump::DumpFormat;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum BufferError {
    #[error("buffer has been disposed")]
    Disposed,
    #[error("requested {requested} bytes but only {available} are buffered")]
    InsufficientData { requested: usize, available: usize },
    #[error("cannot discard {count} bytes, only {available} are buffered")]
    InvalidCount { count: usize, available: usize },
    #[error("secure region start {from} is past its end {to}")]
    InvalidRegion { from: usize, to: usize },
}

/// Inclusive range of storage offsets holding sensitive bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureRegion {
    pub from: usize,
    pub to: usize,
}

impl SecureRegion {
    pub fn contains(&self, index: usize) -> bool {
        self.from <= index && index <= self.to
    }
}

pub struct SecureBuffer {
    pool: Arc<dyn ChunkPool>,
    chunk: Option<Chunk>,
    growth: usize,
    lower: usize,
    upper: usize,
    regions: Vec<SecureRegion>,
}

impl SecureBuffer {
    /// Creates an empty buffer backed by one default-sized chunk of `pool`.
    /// The capacity of that chunk is also the growth increment.
    pub fn new(pool: Arc<dyn ChunkPool>) -> Self {
        let chunk = pool.checkout(None);
        let growth = chunk.capacity().max(1);
        Self {
            pool,
            chunk: Some(chunk),
            growth,
            lower: 0,
            upper: 0,
            regions: Vec::new(),
        }
    }

    /// Creates a buffer holding `bytes`.
    pub fn from_bytes(pool: Arc<dyn ChunkPool>, bytes: &[u8]) -> Result<Self, BufferError> {
        let mut buffer = Self::new(pool);
        buffer.write(false, bytes)?;
        Ok(buffer)
    }

    pub fn lower_bound(&self) -> usize {
        self.lower
    }

    pub fn upper_bound(&self) -> usize {
        self.upper
    }

    pub fn capacity(&self) -> usize {
        self.chunk.as_ref().map_or(0, Chunk::capacity)
    }

    /// Number of buffered bytes (`upper_bound - lower_bound`).
    pub fn len(&self) -> usize {
        self.upper - self.lower
    }

    pub fn is_empty(&self) -> bool {
        self.upper == self.lower
    }

    pub fn is_disposed(&self) -> bool {
        self.chunk.is_none()
    }

    pub fn head_room(&self) -> usize {
        self.lower
    }

    pub fn tail_room(&self) -> usize {
        self.capacity() - self.upper
    }

    /// Appends `bytes`, or places them in front of the buffered data when
    /// `prepend` is set.
    pub fn write(&mut self, prepend: bool, bytes: &[u8]) -> Result<(), BufferError> {
        self.live()?;
        let needed = bytes.len();
        if needed == 0 {
            return Ok(());
        }

        let free = self.head_room() + self.tail_room();
        if free < needed {
            let destination = if prepend { needed } else { 0 };
            self.grow(needed - free, destination)?;
        }

        if prepend {
            if self.lower < needed {
                self.shift_forward(needed - self.lower)?;
            }
            self.lower -= needed;
            let (lower, upper) = (self.lower, self.lower + needed);
            self.storage_mut()?[lower..upper].copy_from_slice(bytes);
        } else {
            if self.tail_room() < needed {
                self.compact()?;
            }
            let (lower, upper) = (self.upper, self.upper + needed);
            self.storage_mut()?[lower..upper].copy_from_slice(bytes);
            self.upper = upper;
        }

        Ok(())
    }

    /// Copies `count` bytes from the head, discarding them when `consume` is set.
    pub fn read(&mut self, consume: bool, count: usize) -> Result<Vec<u8>, BufferError> {
        let out = self.peek(count)?.to_vec();
        if consume {
            self.discard(count)?;
        }
        Ok(out)
    }

    /// Borrows the first `count` buffered bytes.
    pub fn peek(&self, count: usize) -> Result<&[u8], BufferError> {
        let storage = self.storage()?;
        if count > self.len() {
            return Err(BufferError::InsufficientData {
                requested: count,
                available: self.len(),
            });
        }
        Ok(&storage[self.lower..self.lower + count])
    }

    /// Drops `count` bytes from the head. Once the buffer is empty both bounds
    /// return to zero and the secure regions are forgotten.
    pub fn discard(&mut self, count: usize) -> Result<(), BufferError> {
        self.live()?;
        if count > self.len() {
            return Err(BufferError::InvalidCount {
                count,
                available: self.len(),
            });
        }

        self.lower += count;
        if self.lower == self.upper {
            self.clear();
        }
        Ok(())
    }

    /// Records `count` bytes written directly into the tail segment returned by
    /// [`SecureBuffer::free_segments`].
    pub fn commit(&mut self, count: usize) -> Result<(), BufferError> {
        self.live()?;
        if count > self.tail_room() {
            return Err(BufferError::InvalidCount {
                count,
                available: self.tail_room(),
            });
        }
        self.upper += count;
        Ok(())
    }

    /// Moves the buffered bytes to offset zero.
    pub fn compact(&mut self) -> Result<(), BufferError> {
        self.live()?;
        if self.lower == 0 {
            return Ok(());
        }

        let (lower, upper) = (self.lower, self.upper);
        self.storage_mut()?.copy_within(lower..upper, 0);
        self.relocate_regions(-(lower as isize));
        self.upper = upper - lower;
        self.lower = 0;
        Ok(())
    }

    /// Grows the capacity by one growth increment, keeping the data in place.
    pub fn expand(&mut self) -> Result<(), BufferError> {
        self.live()?;
        let destination = self.lower;
        self.grow(1, destination)
    }

    /// Writable views over the free tail of the storage.
    pub fn free_segments(&mut self) -> Result<Vec<IoSliceMut<'_>>, BufferError> {
        let upper = self.upper;
        let storage = self.storage_mut()?;
        if upper == storage.len() {
            return Ok(Vec::new());
        }
        Ok(vec![IoSliceMut::new(&mut storage[upper..])])
    }

    /// Views over at most `max_len` buffered bytes.
    pub fn data_segments(&self, max_len: usize) -> Result<Vec<IoSlice<'_>>, BufferError> {
        let storage = self.storage()?;
        let len = max_len.min(self.len());
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![IoSlice::new(&storage[self.lower..self.lower + len])])
    }

    pub fn add_secure_region(&mut self, from: usize, to: usize) -> Result<(), BufferError> {
        self.live()?;
        if from > to {
            return Err(BufferError::InvalidRegion { from, to });
        }
        self.regions.push(SecureRegion { from, to });
        Ok(())
    }

    /// Marks `len` bytes starting `offset` bytes past the head as secure.
    pub fn secure_data(&mut self, offset: usize, len: usize) -> Result<(), BufferError> {
        if len == 0 {
            return Ok(());
        }
        let from = self.lower + offset;
        self.add_secure_region(from, from + len - 1)
    }

    pub fn in_secure_region(&self, index: usize) -> bool {
        self.regions.iter().any(|region| region.contains(index))
    }

    pub fn secure_regions(&self) -> &[SecureRegion] {
        &self.regions
    }

    pub fn forget_secure_regions(&mut self) {
        self.regions.clear();
    }

    /// Resets both bounds to zero and forgets every secure region.
    pub fn clear(&mut self) {
        self.lower = 0;
        self.upper = 0;
        self.regions.clear();
    }

    /// Returns the backing chunk to the pool. Every later operation fails with
    /// [`BufferError::Disposed`].
    pub fn dispose(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool.checkin(chunk);
        }
        self.clear();
    }

    fn live(&self) -> Result<(), BufferError> {
        match self.chunk {
            Some(_) => Ok(()),
            None => Err(BufferError::Disposed),
        }
    }

    fn storage(&self) -> Result<&[u8], BufferError> {
        self.chunk
            .as_ref()
            .map(Chunk::as_slice)
            .ok_or(BufferError::Disposed)
    }

    fn storage_mut(&mut self) -> Result<&mut [u8], BufferError> {
        self.chunk
            .as_mut()
            .map(Chunk::as_mut_slice)
            .ok_or(BufferError::Disposed)
    }

    /// Shifts the occupied range `shift` bytes towards the tail in place.
    fn shift_forward(&mut self, shift: usize) -> Result<(), BufferError> {
        let (lower, upper) = (self.lower, self.upper);
        self.storage_mut()?.copy_within(lower..upper, lower + shift);
        self.relocate_regions(shift as isize);
        self.lower += shift;
        self.upper += shift;
        Ok(())
    }

    /// Swaps in a chunk at least `extra` bytes larger, rounded up to the growth
    /// increment, and copies the data to `destination` inside it.
    fn grow(&mut self, extra: usize, destination: usize) -> Result<(), BufferError> {
        let old = self.chunk.take().ok_or(BufferError::Disposed)?;
        let wanted = old.capacity() + extra.div_ceil(self.growth) * self.growth;
        let mut fresh = self.pool.checkout(Some(wanted));

        let len = self.len();
        fresh.as_mut_slice()[destination..destination + len]
            .copy_from_slice(&old.as_slice()[self.lower..self.upper]);
        self.pool.checkin(old);

        self.relocate_regions(destination as isize - self.lower as isize);
        self.lower = destination;
        self.upper = destination + len;
        self.chunk = Some(fresh);
        Ok(())
    }

    /// Translates regions by `delta`. Regions that end before the current head
    /// refer to discarded bytes and are dropped, partially discarded ones are
    /// clipped to the head first.
    fn relocate_regions(&mut self, delta: isize) {
        let lower = self.lower;
        self.regions.retain(|region| region.to >= lower);
        for region in self.regions.iter_mut() {
            region.from = (region.from.max(lower) as isize + delta) as usize;
            region.to = (region.to as isize + delta) as usize;
        }
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool.checkin(chunk);
        }
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("capacity", &self.capacity())
            .field("regions", &self.regions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::pool::TrivialPool;
    use super::*;

    fn buffer(chunk: usize) -> (Arc<TrivialPool>, SecureBuffer) {
        let pool = Arc::new(TrivialPool::new(chunk));
        let buffer = SecureBuffer::new(pool.clone());
        (pool, buffer)
    }

    #[test]
    fn write_read_round_trip() {
        let (_, mut buf) = buffer(16);
        let payload: Vec<u8> = (0..=255).collect();

        buf.write(false, &payload).unwrap();
        assert_eq!(buf.read(true, payload.len()).unwrap(), payload);
        assert_eq!((buf.lower_bound(), buf.upper_bound()), (0, 0));
    }

    #[test]
    fn append_keeps_order() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"ABCDE").unwrap();
        buf.write(false, b"FG").unwrap();

        assert_eq!(buf.read(true, 7).unwrap(), b"ABCDEFG");
    }

    #[test]
    fn draining_forgets_secure_regions() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"1234").unwrap();
        buf.secure_data(0, 4).unwrap();
        buf.discard(4).unwrap();

        buf.write(false, b"open").unwrap();

        assert!(buf.secure_regions().is_empty());
        assert!(!buf.in_secure_region(0));
    }

    #[test]
    fn prepend_places_bytes_in_front() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"ABCDE").unwrap();
        buf.write(true, b"FG").unwrap();

        assert_eq!(buf.read(true, 7).unwrap(), b"FGABCDE");
    }

    #[test]
    fn prepend_uses_head_room() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"xxABC").unwrap();
        buf.discard(2).unwrap();
        buf.write(true, b"YZ").unwrap();

        assert_eq!(buf.lower_bound(), 0);
        assert_eq!(buf.read(false, 5).unwrap(), b"YZABC");
    }

    #[test]
    fn prepend_shift_moves_regions() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"0123456789").unwrap();
        buf.add_secure_region(2, 4).unwrap();
        buf.write(true, b"ab").unwrap();

        assert_eq!(buf.secure_regions(), &[SecureRegion { from: 4, to: 6 }]);
        assert_eq!(buf.read(false, 12).unwrap(), b"ab0123456789");
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn compaction_preserves_data_and_regions() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"0123456789").unwrap();
        buf.add_secure_region(2, 4).unwrap();
        buf.discard(2).unwrap();
        buf.compact().unwrap();

        assert_eq!(buf.lower_bound(), 0);
        assert_eq!(buf.secure_regions(), &[SecureRegion { from: 0, to: 2 }]);
        assert_eq!(buf.read(true, 8).unwrap(), b"23456789");
    }

    #[test]
    fn compaction_drops_discarded_regions() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"0123456789").unwrap();
        buf.add_secure_region(0, 1).unwrap();
        buf.add_secure_region(3, 6).unwrap();
        buf.discard(4).unwrap();
        buf.compact().unwrap();

        assert_eq!(buf.secure_regions(), &[SecureRegion { from: 0, to: 2 }]);
    }

    #[test]
    fn append_compacts_before_growing() {
        let (pool, mut buf) = buffer(8);
        buf.write(false, b"abcdef").unwrap();
        buf.discard(4).unwrap();
        buf.write(false, b"ghijkl").unwrap();

        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.read(true, 8).unwrap(), b"efghijkl");
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn growth_preserves_data() {
        let (pool, mut buf) = buffer(8);
        buf.write(false, b"0123456").unwrap();
        buf.add_secure_region(1, 2).unwrap();
        buf.discard(1).unwrap();
        buf.write(false, b"789abcdefghij").unwrap();

        assert_eq!(buf.capacity(), 24);
        assert_eq!(buf.len(), 19);
        assert_eq!(buf.secure_regions(), &[SecureRegion { from: 0, to: 1 }]);
        assert_eq!(buf.read(false, 19).unwrap(), b"123456789abcdefghij");
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn prepend_growth_relocates() {
        let (_, mut buf) = buffer(8);
        buf.write(false, b"abcdef").unwrap();
        buf.add_secure_region(0, 0).unwrap();
        buf.write(true, b"123456").unwrap();

        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.secure_regions(), &[SecureRegion { from: 6, to: 6 }]);
        assert_eq!(buf.read(true, 12).unwrap(), b"123456abcdef");
    }

    #[test]
    fn expand_keeps_data_in_place() {
        let (_, mut buf) = buffer(8);
        buf.write(false, b"abcd").unwrap();
        buf.discard(1).unwrap();
        buf.expand().unwrap();

        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.lower_bound(), 1);
        assert_eq!(buf.read(false, 3).unwrap(), b"bcd");
    }

    #[test]
    fn read_more_than_buffered() {
        let (_, mut buf) = buffer(8);
        buf.write(false, b"abc").unwrap();

        assert_eq!(
            buf.read(true, 4),
            Err(BufferError::InsufficientData {
                requested: 4,
                available: 3
            })
        );
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn invalid_discard_has_no_effect() {
        let (_, mut buf) = buffer(8);
        buf.write(false, b"abc").unwrap();

        assert!(matches!(
            buf.discard(4),
            Err(BufferError::InvalidCount { .. })
        ));
        assert_eq!(buf.read(false, 3).unwrap(), b"abc");
    }

    #[test]
    fn inverted_region_rejected() {
        let (_, mut buf) = buffer(8);
        assert_eq!(
            buf.add_secure_region(4, 2),
            Err(BufferError::InvalidRegion { from: 4, to: 2 })
        );
    }

    #[test]
    fn in_secure_region_scan() {
        let (_, mut buf) = buffer(16);
        buf.write(false, b"0123456789").unwrap();
        buf.add_secure_region(2, 4).unwrap();
        buf.secure_data(7, 2).unwrap();

        let secured: Vec<usize> = (0..10).filter(|i| buf.in_secure_region(*i)).collect();
        assert_eq!(secured, vec![2, 3, 4, 7, 8]);

        buf.forget_secure_regions();
        assert!(!buf.in_secure_region(3));
    }

    #[test]
    fn segments_cover_free_and_data() {
        let (_, mut buf) = buffer(8);
        buf.write(false, b"abc").unwrap();

        {
            let data = buf.data_segments(10).unwrap();
            assert_eq!(data.len(), 1);
            assert_eq!(&*data[0], b"abc");
        }

        let mut free = buf.free_segments().unwrap();
        assert_eq!(free[0].len(), 5);
        free[0][..2].copy_from_slice(b"de");
        drop(free);
        buf.commit(2).unwrap();

        assert_eq!(&*buf.data_segments(4).unwrap()[0], b"abcd");
        assert!(buf.commit(4).is_err());
    }

    #[test]
    fn dispose_returns_chunk() {
        let (pool, mut buf) = buffer(8);
        buf.write(false, b"abc").unwrap();
        buf.dispose();

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(buf.write(false, b"x"), Err(BufferError::Disposed));
        assert_eq!(buf.read(false, 0), Err(BufferError::Disposed));
        assert_eq!(buf.discard(0), Err(BufferError::Disposed));
    }

    #[test]
    fn drop_returns_chunk() {
        let pool = Arc::new(TrivialPool::new(8));
        {
            let mut buf = SecureBuffer::new(pool.clone());
            buf.write(false, &[0; 20]).unwrap();
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
