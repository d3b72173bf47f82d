use core::borrow::BorrowMut;
use core::cmp::min;

pub struct Buffer<T: BorrowMut<[u8]>> {
    inner: T,
    rpos: usize, // next byte to read from
    wpos: usize, // next byte to write into
}

impl<T: BorrowMut<[u8]>> Buffer<T> {
    pub fn new(inner: T) -> Buffer<T> {
        Buffer {
            inner,
            rpos: 0,
            wpos: 0,
        }
    }

    pub fn available_read(&self) -> usize {
        self.wpos - self.rpos
    }

    pub fn available_write(&self) -> usize {
        self.inner.borrow().len() - self.wpos
    }

    /// Returns number of bytes actually written
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.available_write() < data.len() {
            self.shift();
        }
        let count = min(self.available_write(), data.len());
        let inner = self.inner.borrow_mut();
        inner[self.wpos..(self.wpos + count)].copy_from_slice(&data[..count]);
        self.wpos += count;
        debug_assert!(self.wpos <= inner.len());
        count
    }

    pub fn write_all<E>(
        &mut self,
        max_count: usize,
        overflow_err: E,
        f: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        if self.available_write() < max_count {
            self.shift();
            if self.available_write() < max_count {
                return Err(overflow_err);
            }
        }

        let inner = self.inner.borrow_mut();

        f(&mut inner[self.wpos..(self.wpos + max_count)]).map(|count| {
            let advance_by = min(count, inner.len() - self.wpos);
            self.wpos += advance_by;
            debug_assert!(self.wpos <= inner.len());
            advance_by
        })
    }

    pub fn read<E>(&mut self, f: impl FnOnce(&mut [u8]) -> Result<usize, E>) -> Result<usize, E> {
        let boundary = self.rpos + self.available_read();
        let inner = self.inner.borrow_mut();
        f(&mut inner[self.rpos..boundary]).map(|count| {
            let advance_by = min(count, self.available_read());
            self.rpos += advance_by;
            debug_assert!(self.rpos <= self.wpos);
            advance_by
        })
    }

    pub fn clean(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    fn shift(&mut self) {
        if self.rpos != self.wpos {
            unsafe {
                core::ptr::copy(
                    &self.inner.borrow()[self.rpos] as *const u8,
                    &mut self.inner.borrow_mut()[0] as *mut u8,
                    self.available_read(),
                )
            }
            self.wpos -= self.rpos;
            self.rpos = 0;
        } else {
            self.clean();
        }
    }
}
