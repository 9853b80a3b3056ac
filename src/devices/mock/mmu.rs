//! Scripted MMU link
//!
//! Stands in for a real MMU on the other end of an [`MmuLink`]: tests
//! queue the replies the device would give and inspect the requests the
//! protocol logic sent. Clones share state, so a test keeps a handle
//! while the logic owns its copy.

use crate::error::{Error, Result};
use crate::mmu::protocol::{RequestMsg, ResponseMsg};
use crate::mmu::transport::MmuLink;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum Reply {
    Msg(ResponseMsg),
    Malformed,
}

struct Inner {
    sent: Vec<RequestMsg>,
    replies: VecDeque<Reply>,
    purges: usize,
    decoder_resets: usize,
}

#[derive(Clone)]
pub struct ScriptedLink {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sent: Vec::new(),
                replies: VecDeque::new(),
                purges: 0,
                decoder_resets: 0,
            })),
        }
    }

    /// Queue a well-formed reply for the next poll
    pub fn push_response(&self, rsp: ResponseMsg) {
        self.lock().replies.push_back(Reply::Msg(rsp));
    }

    /// Queue an undecodable frame for the next poll
    pub fn push_malformed(&self) {
        self.lock().replies.push_back(Reply::Malformed);
    }

    /// Requests sent since the last call
    pub fn take_sent(&self) -> Vec<RequestMsg> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Queued replies not yet consumed
    pub fn pending(&self) -> usize {
        self.lock().replies.len()
    }

    pub fn purge_count(&self) -> usize {
        self.lock().purges
    }

    pub fn decoder_reset_count(&self) -> usize {
        self.lock().decoder_resets
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MmuLink for ScriptedLink {
    fn send(&mut self, rq: &RequestMsg) -> Result<()> {
        self.lock().sent.push(*rq);
        Ok(())
    }

    fn poll_response(&mut self) -> Result<Option<ResponseMsg>> {
        match self.lock().replies.pop_front() {
            Some(Reply::Msg(rsp)) => Ok(Some(rsp)),
            Some(Reply::Malformed) => {
                Err(Error::InvalidPacket("scripted malformed frame".to_string()))
            }
            None => Ok(None),
        }
    }

    fn reset_decoder(&mut self) {
        self.lock().decoder_resets += 1;
    }

    fn purge(&mut self) -> Result<()> {
        let mut inner = self.lock();
        inner.purges += 1;
        inner.replies.clear();
        Ok(())
    }
}
