//! Handler executor that logs every invocation instead of running code.

use async_trait::async_trait;
use nearindex_core::{HandlerArgs, HandlerContext, HandlerExecutor, IndexerError};
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExecutor;

#[async_trait]
impl HandlerExecutor for LoggingExecutor {
    async fn execute(
        &self,
        ctx: &mut HandlerContext,
        handler: &str,
        args: HandlerArgs<'_>,
    ) -> Result<(), IndexerError> {
        info!(
            handler,
            height = ctx.block_height(),
            args = %args.to_json(),
            "handler invoked"
        );
        Ok(())
    }
}
