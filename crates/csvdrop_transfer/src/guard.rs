use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("request body exceeded the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("failed to read request body: {0}")]
    Transport(#[source] BoxError),
}

/// Caps the number of body bytes handed downstream.
///
/// The chunk that pushes the running total past `limit` is never yielded;
/// the caller sees [`GuardError::PayloadTooLarge`] in its place and the
/// stream ends afterwards.
#[derive(Debug)]
pub struct SizeGuard<S> {
    inner: S,
    limit: u64,
    consumed: u64,
    tripped: bool,
}

impl<S> SizeGuard<S> {
    pub fn new(inner: S, limit: u64) -> Self {
        Self {
            inner,
            limit,
            consumed: 0,
            tripped: false,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}

impl<S, B, E> Stream for SizeGuard<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: Into<Bytes>,
    E: Into<BoxError>,
{
    type Item = Result<Bytes, GuardError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.tripped {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                let chunk: Bytes = chunk.into();
                this.consumed = this.consumed.saturating_add(chunk.len() as u64);
                if this.consumed > this.limit {
                    this.tripped = true;
                    return Poll::Ready(Some(Err(GuardError::PayloadTooLarge {
                        limit: this.limit,
                    })));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(GuardError::Transport(err.into())))),
            None => Poll::Ready(None),
        }
    }
}
