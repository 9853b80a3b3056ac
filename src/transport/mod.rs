//! Byte-level transport abstraction for the MMU serial link

use crate::error::Result;

mod mock;
mod serial;
pub use mock::MockTransport;
pub use serial::SerialTransport;

/// Transport trait for half-duplex byte-stream communication
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read (0 when no
    /// data is pending - reads never block)
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Discard anything pending in both directions.
    ///
    /// Used by the protocol recovery paths to get rid of the tail of a
    /// half-received message before restarting the handshake.
    fn purge(&mut self) -> Result<()>;

    /// Check if data is available to read
    fn available(&mut self) -> Result<usize> {
        Ok(0)
    }
}
