//! Root vertex: the scheduler's start point, nothing to do.

use super::{BlockRunner, InstanceContext};
use crate::core::error::Result;
use async_trait::async_trait;

pub struct RootRunner;

#[async_trait]
impl BlockRunner for RootRunner {
    async fn run(&self, _ctx: &InstanceContext) -> Result<()> {
        Ok(())
    }
}
