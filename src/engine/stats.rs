// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async queue inspection.

use tracing::info;

use crate::error::OrmError;

use super::consumer::error_queue;
use super::{AsyncError, Engine, QueueStatistics};

impl Engine {
    /// Pending and shelved counts for every async queue.
    pub async fn async_queue_statistics(&self) -> Result<Vec<QueueStatistics>, OrmError> {
        let redis = self.default_redis()?;
        let mut stats = Vec::new();
        for queue in self.registry().async_queues().into_keys() {
            let pending = redis.llen(&queue).await?;
            let errors = redis.llen(&error_queue(&queue)).await? / 2;
            stats.push(QueueStatistics { queue, pending, errors });
        }
        Ok(stats)
    }

    /// The first `limit` shelved actions of `queue`, oldest first.
    pub async fn read_async_errors(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<AsyncError>, OrmError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let items = self
            .default_redis()?
            .lrange_strings(&error_queue(queue), 0, (limit * 2) as i64 - 1)
            .await?;
        Ok(items
            .chunks_exact(2)
            .map(|pair| AsyncError {
                payload: pair[0].clone(),
                error: pair[1].clone(),
            })
            .collect())
    }

    /// Drop every shelved action of `queue`.
    pub async fn clear_async_errors(&self, queue: &str) -> Result<(), OrmError> {
        let key = error_queue(queue);
        let removed = self.default_redis()?.del(&[key.as_str()]).await?;
        info!(queue, removed, "async errors cleared");
        Ok(())
    }
}
