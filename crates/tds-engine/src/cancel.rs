//! Attention from another task.
//!
//! A [`CancelHandle`] is taken from a [`SessionDriver`](crate::SessionDriver)
//! before a request starts. Calling [`cancel`](CancelHandle::cancel) writes
//! an attention packet; the task running the request sees its response cut
//! short and drains to the acknowledgment.
//!
//! ```rust,ignore
//! let cancel = driver.cancel_handle();
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     cancel.cancel_and_wait().await
//! });
//! driver.execute("WAITFOR DELAY '01:00'", &mut Discard).await?;
//! ```
//!
//! - Repeated calls before the acknowledgment send nothing more.
//! - A missing acknowledgment within the attention timeout is fatal.

use std::time::Duration;

use tds_codec::CancelHandle as CodecCancelHandle;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Phase, Result};

/// Sends attention for a session.
pub struct CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    inner: CodecCancelHandle<T>,
    ack_timeout: Duration,
}

impl<T> CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(inner: CodecCancelHandle<T>, ack_timeout: Duration) -> Self {
        Self { inner, ack_timeout }
    }

    /// Write an attention packet.
    pub async fn cancel(&self) -> Result<()> {
        self.inner.cancel().await?;
        Ok(())
    }

    /// Wait until the request task has read the acknowledgment.
    pub async fn wait_cancelled(&self) {
        self.inner.wait_cancelled().await;
    }

    /// Cancel, then wait for the acknowledgment at most the attention
    /// timeout.
    pub async fn cancel_and_wait(&self) -> Result<()> {
        self.cancel().await?;
        tokio::time::timeout(self.ack_timeout, self.wait_cancelled())
            .await
            .map_err(|_| Error::Timeout {
                phase: Phase::Attention,
            })
    }

    /// Whether an attention awaits its acknowledgment.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.inner.is_cancelling()
    }
}

impl<T> Clone for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ack_timeout: self.ack_timeout,
        }
    }
}

impl<T> std::fmt::Debug for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("inner", &self.inner)
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tds_codec::Connection;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;

    #[test]
    fn test_cancel_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CancelHandle<DuplexStream>>();
    }

    #[tokio::test]
    async fn test_unacknowledged_attention_times_out() {
        let (client, mut server) = tokio::io::duplex(1024);
        let conn = Connection::new(client);
        let handle = CancelHandle::new(conn.cancel_handle(), Duration::from_millis(20));

        let err = handle.cancel_and_wait().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::Attention }));
        assert!(err.is_fatal());
        assert!(handle.is_cancelling());

        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x06);
    }
}
