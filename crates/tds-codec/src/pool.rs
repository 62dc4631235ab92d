//! Reuse of channels between logical operations.
//!
//! A channel goes back to the pool only when it is quiescent: no attention
//! outstanding, no open result sets and no fatal error. Anything else is
//! dropped when its guard goes out of scope.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tds_protocol::packet::DEFAULT_PACKET_SIZE;

use crate::channel::Channel;
use crate::error::CodecError;

#[derive(Debug)]
struct PoolState {
    idle: SmallVec<[Channel; 4]>,
    packet_size: usize,
    next_id: u16,
    max_channels: usize,
    in_use: usize,
    broken: bool,
}

/// Pool of channels sharing one session.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    inner: Arc<Mutex<PoolState>>,
}

/// Counts reported by [`ChannelPool::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Channels ready for reuse.
    pub idle: usize,
    /// Channels held by operations.
    pub in_use: usize,
    /// Upper bound on channels alive at once.
    pub max: usize,
}

impl ChannelPool {
    /// Pool handing out at most `max_channels` channels at once.
    #[must_use]
    pub fn new(max_channels: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolState {
                idle: SmallVec::new(),
                packet_size: DEFAULT_PACKET_SIZE,
                next_id: 0,
                max_channels: max_channels.max(1),
                in_use: 0,
                broken: false,
            })),
        }
    }

    /// Take an idle channel or open a new one.
    pub fn acquire(&self) -> Result<PooledChannel, CodecError> {
        let mut state = self.inner.lock();
        if state.broken {
            return Err(CodecError::Broken);
        }
        let channel = match state.idle.pop() {
            Some(channel) => channel,
            None => {
                if state.in_use >= state.max_channels {
                    return Err(CodecError::PoolExhausted);
                }
                let id = state.next_id;
                state.next_id = state.next_id.wrapping_add(1);
                tracing::trace!(channel = id, "opening channel");
                Channel::with_id(id, state.packet_size)?
            }
        };
        state.in_use += 1;
        Ok(PooledChannel {
            channel,
            pool: Some(Arc::clone(&self.inner)),
        })
    }

    /// Apply a negotiated packet size to idle and future channels.
    ///
    /// Channels in use pick it up when they come back.
    pub fn set_packet_size(&self, size: usize) -> Result<(), CodecError> {
        let mut state = self.inner.lock();
        for channel in &mut state.idle {
            channel.set_packet_size(size)?;
        }
        state.packet_size = size;
        Ok(())
    }

    /// Dispose every idle channel and refuse new ones.
    pub fn mark_broken(&self) {
        let mut state = self.inner.lock();
        state.broken = true;
        state.idle.clear();
        tracing::warn!("channel pool broken");
    }

    /// Whether the pool has seen a fatal error.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.inner.lock().broken
    }

    /// Current counts.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use,
            max: state.max_channels,
        }
    }
}

/// A channel on loan from a [`ChannelPool`].
#[derive(Debug)]
pub struct PooledChannel {
    channel: Channel,
    pool: Option<Arc<Mutex<PoolState>>>,
}

impl PooledChannel {
    /// Take the channel out of the pool for good.
    #[must_use]
    pub fn detach(mut self) -> Channel {
        if let Some(pool) = self.pool.take() {
            pool.lock().in_use -= 1;
        }
        std::mem::take(&mut self.channel)
    }
}

impl Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl DerefMut for PooledChannel {
    fn deref_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let mut state = pool.lock();
        state.in_use -= 1;

        let mut channel = std::mem::take(&mut self.channel);
        let quiescent = !channel.is_broken()
            && !channel.attention_pending()
            && channel.open_results() == 0
            && !channel.is_writing();
        if state.broken || !quiescent {
            tracing::debug!(channel = channel.id(), "channel disposed");
            return;
        }
        channel.reset();
        if channel.set_packet_size(state.packet_size).is_ok() {
            state.idle.push(channel);
        }
    }
}
