//! The block task: consumes submissions from the service queue and feeds
//! them through the fork manager, one at a time.

use futures::prelude::*;

use crate::{
    intercom::BlockMsg,
    service::BlockchainService,
    utils::async_msg::MessageQueue,
};

pub struct Process {
    service: BlockchainService,
}

impl Process {
    pub fn new(service: BlockchainService) -> Self {
        Process { service }
    }

    /// Drain the queue until every sender is gone.
    pub async fn start(self, mut input: MessageQueue<BlockMsg>) {
        while let Some(message) = input.next().await {
            self.handle(message).await;
        }
        tracing::debug!("block queue closed, task terminating");
    }

    async fn handle(&self, message: BlockMsg) {
        match message {
            BlockMsg::External {
                block,
                with_check,
                reply,
            } => match self.service.submit_block(&block, with_check).await {
                Ok(admission) => {
                    tracing::info!(block = %admission.stamp, "external block accepted");
                    reply.reply_ok(admission);
                }
                Err(crate::service::Error::Chain(err)) => {
                    tracing::warn!(code = err.code(), reason = %err, "external block rejected");
                    reply.reply_error(err.into());
                }
                Err(err) => {
                    tracing::warn!(reason = %err, "external block rejected");
                    drop(reply);
                }
            },
            BlockMsg::Mined(block) => {
                // a stale self-mined block simply fails revalidation here
                if let Err(err) = self.service.submit_mined(&block).await {
                    tracing::warn!(reason = %err, "mined block rejected");
                }
            }
        }
    }
}
