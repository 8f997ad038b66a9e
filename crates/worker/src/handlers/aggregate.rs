//! Join continuation of a batch: merges the unit results into the final
//! artifact once every member has settled.

use async_trait::async_trait;
use jokbo_core::progress::MSG_COMPLETED;
use jokbo_core::task::TaskState;
use serde_json::{json, Value};

use super::{TaskContext, TaskHandler};
use crate::error::TaskError;

pub struct AggregateBatchHandler;

#[async_trait]
impl TaskHandler for AggregateBatchHandler {
    async fn run(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        ctx.probe.checkpoint().await?;
        let deps = &ctx.deps;
        let members = &ctx.task.group_results;
        if members.is_empty() {
            return Err(TaskError::Failed("Aggregation has no group results".into()));
        }

        let mut units = Vec::new();
        let mut failed = Vec::new();
        for member in members {
            let index = member.member_index;
            // The store copy is authoritative: it survives a member that
            // recorded its result and then lost its lease.
            let recorded = deps.store.get_partial(&ctx.job_id, index).await?;
            match (recorded, member.state) {
                (Some(result), _) => units.push(json!({ "unit": index, "result": result })),
                (None, TaskState::Succeeded) => {
                    let result = member.result.clone().unwrap_or(Value::Null);
                    units.push(json!({ "unit": index, "result": result }));
                }
                (None, state) => failed.push(json!({
                    "unit": index,
                    "state": state,
                    "error": member.error,
                })),
            }
        }

        if units.is_empty() {
            let message = format!("All {} units failed", members.len());
            if let Err(e) = deps.progress.set_message(&ctx.job_id, &message).await {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Progress update failed");
            }
            return Err(TaskError::Failed(message));
        }

        let artifact = json!({
            "mode": "batch",
            "units": units,
            "failed": failed,
        });
        deps.store.record_final(&ctx.job_id, &artifact).await?;
        if let Err(e) = deps.progress.finalize(&ctx.job_id, MSG_COMPLETED).await {
            tracing::warn!(job_id = %ctx.job_id, error = %e, "Progress finalize failed");
        }

        tracing::info!(
            job_id = %ctx.job_id,
            succeeded = units.len(),
            failed = failed.len(),
            "Batch aggregated"
        );
        Ok(json!({
            "status": "Complete",
            "succeeded": units.len(),
            "failed": failed.len(),
        }))
    }
}
