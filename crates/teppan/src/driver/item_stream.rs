use std::pin::Pin;
use std::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;

/// # ItemStream
///
/// The tokens of one generation request, in the order they were emitted.
///
/// Backed by an unbounded channel whose sender lives in the session; the
/// stream ends when the session is released. Dropping the stream does not
/// stop generation, it only discards the remaining tokens.
pub struct ItemStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> ItemStream<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>) -> Self {
        Self { receiver }
    }
}

impl<T> Stream for ItemStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}
