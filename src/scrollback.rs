use std::collections::VecDeque;

use bytes::Bytes;

/// Default scrollback cap: 100 KiB per session.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 100 * 1024;

/// Bounded, append-only byte history for one session.
///
/// Once the cap is reached the oldest bytes are evicted first, so memory per
/// session stays fixed no matter how much the shell prints. Readers get a
/// copy via [`Scrollback::snapshot`]; nothing holds a live reference.
#[derive(Debug)]
pub struct Scrollback {
    buf: VecDeque<u8>,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(DEFAULT_SCROLLBACK_BYTES)),
            cap,
        }
    }

    /// Append a chunk, evicting from the front if the cap would be exceeded.
    pub fn append(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }

        // A chunk larger than the whole buffer only leaves its tail behind.
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }

        let needed = self.buf.len() + data.len();
        if needed > self.cap {
            let to_remove = needed - self.cap;
            self.buf.drain(..to_remove);
        }
        self.buf.extend(data);
    }

    /// Copy out the current contents, oldest byte first.
    pub fn snapshot(&self) -> Bytes {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        Bytes::from(out)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Drop all history. Used when the owning session terminates.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.shrink_to_fit();
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_BYTES)
    }
}
