//! KF-015: Local and output blocks: render `value`, store the result.

use super::{BlockRunner, InstanceContext};
use crate::core::error::Result;
use async_trait::async_trait;

pub struct ValueRunner;

#[async_trait]
impl BlockRunner for ValueRunner {
    async fn run(&self, ctx: &InstanceContext) -> Result<()> {
        let value = ctx.render(ctx.vertex.block_context.value.as_ref())?;
        ctx.commit(value)
    }
}
