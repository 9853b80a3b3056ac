//! Mock transport for testing

use super::Transport;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// In-memory transport for unit testing the serial MMU link.
///
/// Clones share the same buffers, so a test can keep one handle while the
/// link under test owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    purged: usize,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(Inner {
                read_buffer: VecDeque::new(),
                write_buffer: Vec::new(),
                purged: 0,
            })),
        }
    }

    /// Inject data to be read by the link under test
    pub fn inject_read(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_buffer.extend(data);
    }

    /// Take everything the link wrote so far
    pub fn take_written(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.write_buffer)
    }

    /// Number of purge() calls observed
    pub fn purge_count(&self) -> usize {
        self.inner.lock().unwrap().purged
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let available = inner.read_buffer.len().min(buffer.len());
        for slot in buffer.iter_mut().take(available) {
            *slot = inner.read_buffer.pop_front().unwrap();
        }
        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.write_buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn purge(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_buffer.clear();
        inner.purged += 1;
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().read_buffer.len())
    }
}
