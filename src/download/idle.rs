// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Idle-timeout reader.
//!
//! Wraps an upstream byte source and fails if no byte arrives within the idle
//! window, or as soon as the job's cancellation token fires. Both failures
//! are sticky: once armed, every later read returns the same error.
//!
//! Instead of a polling watcher the reader keeps a single timer whose
//! deadline is pushed forward on every read that delivers bytes. The timer,
//! the token and the upstream read are polled together, so a stalled
//! upstream that is not itself cancellation-aware still unblocks the caller.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::ReadError;

/// Readers that own a releasable upstream.
pub trait CloseReader {
    /// Release the upstream. Idempotent; later reads fail with
    /// [`ReadError::Closed`] unless an earlier error is already armed.
    fn close(&mut self);
}

/// An `AsyncRead` adapter enforcing a maximum gap between byte arrivals.
pub struct IdleTimeoutReader<R> {
    inner: Option<R>,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    sticky: Option<ReadError>,
}

impl<R> IdleTimeoutReader<R> {
    /// Wrap `inner`; the idle window starts now.
    pub fn new(inner: R, idle: Duration, token: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            inner: Some(inner),
            idle,
            deadline: Box::pin(tokio::time::sleep_until(now + idle)),
            cancelled: Box::pin(token.cancelled_owned()),
            sticky: None,
        }
    }

    /// The armed sticky error, if any.
    pub fn armed(&self) -> Option<ReadError> {
        self.sticky
    }

    fn arm(&mut self, err: ReadError) -> io::Error {
        let err = *self.sticky.get_or_insert(err);
        // The upstream is useless once an error is armed.
        self.inner = None;
        err.into()
    }
}

impl<R> CloseReader for IdleTimeoutReader<R> {
    fn close(&mut self) {
        if self.sticky.is_none() {
            self.sticky = Some(ReadError::Closed);
        }
        self.inner = None;
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for IdleTimeoutReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.sticky {
            return Poll::Ready(Err(err.into()));
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(this.arm(ReadError::Cancelled)));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(this.arm(ReadError::Closed)));
        };

        let before = buf.filled().len();
        match Pin::new(inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.deadline.as_mut().reset(Instant::now() + this.idle);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    let idle = this.idle;
                    return Poll::Ready(Err(this.arm(ReadError::IdleTimeout(idle))));
                }
                Poll::Pending
            }
        }
    }
}
