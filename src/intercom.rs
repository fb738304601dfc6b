//! Messages exchanged between the service tasks.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::channel::oneshot;
use thiserror::Error as ThisError;

use crate::{
    blockcfg::Block,
    blockchain::{self, Admission},
};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] blockchain::Error),
    #[error("request canceled by the processing task")]
    Canceled,
}

type ReplySender<T> = oneshot::Sender<Result<T, Error>>;

/// The processing side of a request: reply exactly once.
#[derive(Debug)]
pub struct ReplyHandle<T> {
    sender: ReplySender<T>,
}

impl<T> ReplyHandle<T> {
    pub fn reply(self, result: Result<T, Error>) {
        // ignoring a send error: the result is no longer needed
        let _ = self.sender.send(result);
    }

    pub fn reply_ok(self, response: T) {
        self.reply(Ok(response))
    }

    pub fn reply_error(self, error: Error) {
        self.reply(Err(error))
    }
}

/// The requesting side: resolves with the processing outcome.
pub struct ReplyFuture<T> {
    receiver: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Future for ReplyFuture<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Canceled)),
        }
    }
}

pub fn unary_reply<T>() -> (ReplyHandle<T>, ReplyFuture<T>) {
    let (sender, receiver) = oneshot::channel();
    (ReplyHandle { sender }, ReplyFuture { receiver })
}

/// Input of the block task.
pub enum BlockMsg {
    /// A block received from the outside; the submitter awaits the
    /// admission outcome.
    External {
        block: Box<Block>,
        with_check: bool,
        reply: ReplyHandle<Admission>,
    },
    /// A block this node just mined.
    Mined(Box<Block>),
}
