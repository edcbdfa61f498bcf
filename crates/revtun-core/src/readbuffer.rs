//! Per-stream inbound byte queue.
//!
//! DATA frame bodies are offered in arrival order and handed to readers in
//! that exact order. Reads block until data, a terminal error, the absolute
//! read deadline, or the per-call idle timeout. Crossing the high watermark
//! upward yields a single `Pause` signal; dropping below the low watermark
//! yields a single `Resume`; callers turn these into wire frames.

use crate::error::{TunnelError, TunnelResult};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Flow-control edge produced by a buffer size crossing a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowSignal {
    Pause,
    Resume,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: VecDeque<Bytes>,
    size: usize,
    /// Set once; `closed` with `err == None` is a clean EOF.
    err: Option<TunnelError>,
    closed: bool,
    deadline: Option<Instant>,
    read_timeout: Option<Duration>,
    /// Whether we have signalled Pause and not yet signalled Resume.
    paused: bool,
}

#[derive(Debug)]
pub(crate) struct ReadBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
    high_water: usize,
    low_water: usize,
}

impl ReadBuffer {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water < high_water);
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            high_water,
            low_water,
        }
    }

    /// Append a frame body, split into chunks of at most `max_chunk` bytes.
    ///
    /// A no-op after close (the frame is simply discarded). Returns `Pause`
    /// exactly when the buffered size crosses the high watermark upward.
    pub fn offer(&self, mut body: Bytes, max_chunk: usize) -> Option<FlowSignal> {
        let signal = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return None;
            }
            inner.size += body.len();
            while body.len() > max_chunk {
                let chunk = body.split_to(max_chunk);
                inner.chunks.push_back(chunk);
            }
            if !body.is_empty() {
                inner.chunks.push_back(body);
            }
            if !inner.paused && inner.size >= self.high_water {
                inner.paused = true;
                Some(FlowSignal::Pause)
            } else {
                None
            }
        };
        self.notify.notify_waiters();
        signal
    }

    /// Copy buffered bytes into `buf`, blocking until at least one byte is
    /// available or the buffer reaches a terminal state.
    ///
    /// Returns `Ok((0, _))` for a clean EOF once the queue is drained;
    /// a stored terminal error is returned only after the drain.
    pub async fn read(&self, buf: &mut [u8]) -> TunnelResult<(usize, Option<FlowSignal>)> {
        if buf.is_empty() {
            return Ok((0, None));
        }
        loop {
            // Register interest before checking state so a signal arriving
            // between the check and the wait is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait: (Option<Instant>, Option<Duration>);
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.size > 0 {
                    return Ok(Self::pop_locked(&mut inner, buf, self.low_water));
                }
                if let Some(err) = &inner.err {
                    return Err(err.clone());
                }
                if inner.closed {
                    return Ok((0, None));
                }
                if let Some(deadline) = inner.deadline {
                    if deadline <= Instant::now() {
                        return Err(TunnelError::ReadDeadlineExceeded);
                    }
                }
                wait = (inner.deadline, inner.read_timeout);
            }

            let (deadline, idle) = wait;
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => return Err(TunnelError::ReadDeadlineExceeded),
                _ = sleep_opt(idle) => return Err(TunnelError::ReadTimeoutExceeded),
            }
        }
    }

    fn pop_locked(inner: &mut Inner, buf: &mut [u8], low_water: usize) -> (usize, Option<FlowSignal>) {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(chunk) = inner.chunks.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            if n == chunk.len() {
                inner.chunks.pop_front();
            } else {
                let _ = chunk.split_to(n);
            }
        }
        inner.size -= copied;
        let signal = if inner.paused && inner.size <= low_water {
            inner.paused = false;
            Some(FlowSignal::Resume)
        } else {
            None
        };
        (copied, signal)
    }

    /// Set the terminal state. The first close wins; later calls are no-ops.
    /// `err == None` is a clean EOF.
    pub fn close(&self, err: Option<TunnelError>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.err = err;
        }
        self.notify.notify_waiters();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.inner.lock().unwrap().deadline = deadline;
        // Wake blocked readers so they pick up the new deadline.
        self.notify.notify_waiters();
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().unwrap().read_timeout = timeout;
        self.notify.notify_waiters();
    }

    /// Buffered byte count, for tracing.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().size
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> ReadBuffer {
        ReadBuffer::new(1 << 20, 1 << 18)
    }

    #[tokio::test]
    async fn read_returns_offered_bytes_in_order() {
        let rb = buffer();
        rb.offer(Bytes::from_static(b"test"), 8192);
        rb.offer(Bytes::from_static(b"more"), 8192);

        let mut buf = [0u8; 10];
        let (n, _) = rb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"testmore");
    }

    #[tokio::test]
    async fn read_with_small_destination_keeps_remainder() {
        let rb = buffer();
        rb.offer(Bytes::from_static(b"abcdef"), 2);

        let mut buf = [0u8; 4];
        let (n, _) = rb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let (n, _) = rb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn read_with_timeout() {
        let rb = buffer();
        rb.set_read_timeout(Some(Duration::from_millis(50)));
        let mut buf = [0u8; 10];
        match rb.read(&mut buf).await {
            Err(TunnelError::ReadTimeoutExceeded) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_with_deadline() {
        let rb = buffer();
        rb.set_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 10];
        match rb.read(&mut buf).await {
            Err(TunnelError::ReadDeadlineExceeded) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_deadline_fails_immediately() {
        let rb = buffer();
        rb.set_deadline(Some(Instant::now() - Duration::from_millis(1)));
        let mut buf = [0u8; 10];
        match rb.read(&mut buf).await {
            Err(TunnelError::ReadDeadlineExceeded) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_beats_timeout_when_shorter() {
        let rb = buffer();
        rb.set_deadline(Some(Instant::now() + Duration::from_millis(30)));
        rb.set_read_timeout(Some(Duration::from_millis(500)));
        let mut buf = [0u8; 10];
        match rb.read(&mut buf).await {
            Err(TunnelError::ReadDeadlineExceeded) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_drains_then_reports_error() {
        let rb = buffer();
        rb.offer(Bytes::from_static(b"tail"), 8192);
        rb.close(Some(TunnelError::TunnelDisconnect));

        let mut buf = [0u8; 2];
        let (n, _) = rb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ta");
        let (n, _) = rb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"il");
        for _ in 0..2 {
            match rb.read(&mut buf).await {
                Err(TunnelError::TunnelDisconnect) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn clean_close_is_eof() {
        let rb = buffer();
        rb.close(None);
        let mut buf = [0u8; 4];
        let (n, _) = rb.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn offer_after_close_is_dropped() {
        let rb = buffer();
        rb.close(None);
        assert!(rb.offer(Bytes::from_static(b"late"), 8192).is_none());
        assert_eq!(rb.len(), 0);
    }

    #[tokio::test]
    async fn second_close_keeps_first_error() {
        let rb = buffer();
        rb.close(Some(TunnelError::SyncReclaimed));
        rb.close(Some(TunnelError::TunnelDisconnect));
        let mut buf = [0u8; 1];
        match rb.read(&mut buf).await {
            Err(TunnelError::SyncReclaimed) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn watermarks_are_edge_triggered() {
        let rb = ReadBuffer::new(8, 2);

        // Crossing upward fires exactly once.
        assert_eq!(rb.offer(Bytes::from_static(b"12345678"), 8192), Some(FlowSignal::Pause));
        assert_eq!(rb.offer(Bytes::from_static(b"more"), 8192), None);

        // Draining to the low watermark fires Resume exactly once.
        let mut buf = [0u8; 9];
        let (n, signal) = rb.read(&mut buf).await.unwrap();
        assert_eq!(n, 9);
        assert!(signal.is_none()); // 3 bytes left, still above low

        let mut small = [0u8; 1];
        let (_, signal) = rb.read(&mut small).await.unwrap();
        assert_eq!(signal, Some(FlowSignal::Resume)); // 2 left == low
        let (_, signal) = rb.read(&mut small).await.unwrap();
        assert!(signal.is_none());
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_offer() {
        let rb = std::sync::Arc::new(buffer());
        let reader = {
            let rb = rb.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let (n, _) = rb.read(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rb.offer(Bytes::from_static(b"wake"), 8192);
        assert_eq!(reader.await.unwrap(), b"wake");
    }
}
