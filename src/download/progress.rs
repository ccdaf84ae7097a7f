// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte-counting reader with progress and end-of-stream callbacks.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use super::idle::CloseReader;

type ProgressFn = Box<dyn FnMut(u64) + Send>;
type CompleteFn = Box<dyn FnOnce(u64) + Send>;

/// Tallies bytes read from `inner`.
///
/// `on_progress` is called with the running total after every read that
/// returned bytes; `on_complete` fires once when the upstream reports
/// end-of-stream. Callbacks run inline on the reading task and must not block.
pub struct ProgressReader<R> {
    inner: R,
    downloaded: Arc<AtomicU64>,
    on_progress: ProgressFn,
    on_complete: Option<CompleteFn>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, on_progress: impl FnMut(u64) + Send + 'static) -> Self {
        Self {
            inner,
            downloaded: Arc::new(AtomicU64::new(0)),
            on_progress: Box::new(on_progress),
            on_complete: None,
        }
    }

    /// Register a callback for end-of-stream.
    pub fn on_complete(mut self, on_complete: impl FnOnce(u64) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }
}

impl<R: CloseReader> CloseReader for ProgressReader<R> {
    fn close(&mut self) {
        self.inner.close();
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;

        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                let total = this.downloaded.fetch_add(n, Ordering::AcqRel) + n;
                (this.on_progress)(total);
            } else if wanted {
                if let Some(on_complete) = this.on_complete.take() {
                    on_complete(this.downloaded.load(Ordering::Acquire));
                }
            }
        }
        result
    }
}
