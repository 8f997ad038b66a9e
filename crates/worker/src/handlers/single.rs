//! Non-batch analysis: one task runs every primary file of the job.

use async_trait::async_trait;
use jokbo_core::progress::{ProgressUpdate, MSG_COMPLETED};
use serde_json::{json, Value};

use super::{TaskContext, TaskHandler};
use crate::analyzer::{AnalysisOptions, AnalysisRequest};
use crate::error::TaskError;

pub struct SingleAnalysisHandler;

#[async_trait]
impl TaskHandler for SingleAnalysisHandler {
    async fn run(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let deps = &ctx.deps;
        let job = deps.registry.get_metadata(&ctx.job_id).await?;
        ctx.probe.checkpoint().await?;

        let options = AnalysisOptions {
            mode: job.mode,
            model_tier: job.model_tier,
            multi_api: job.multi_api,
            min_relevance: job.min_relevance,
        };

        let mut counterparts = Vec::with_capacity(job.input_refs.counterpart.len());
        for key in &job.input_refs.counterpart {
            counterparts.push(deps.document(key).await?);
        }

        let total = job.input_refs.primary.len();
        let mut outputs = Vec::with_capacity(total);
        for (index, key) in job.input_refs.primary.iter().enumerate() {
            ctx.probe.checkpoint().await?;

            let request = AnalysisRequest {
                job_id: ctx.job_id.clone(),
                options: options.clone(),
                primary: deps.document(key).await?,
                counterparts: counterparts.clone(),
            };
            let result = deps.analyzer.analyze(&request, &ctx.probe).await?;
            outputs.push(json!({ "key": key, "result": result }));

            // Absolute counts keep a retried execution from double counting.
            let done = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let message = format!("Analyzed {done}/{total}: {key}");
            if let Err(e) = deps
                .progress
                .update(&ctx.job_id, ProgressUpdate::Absolute(done), Some(message.as_str()))
                .await
            {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Progress update failed");
            }
        }

        ctx.probe.checkpoint().await?;
        let artifact = json!({
            "mode": job.mode,
            "outputs": outputs,
        });
        deps.store.record_final(&ctx.job_id, &artifact).await?;
        if let Err(e) = deps.progress.finalize(&ctx.job_id, MSG_COMPLETED).await {
            tracing::warn!(job_id = %ctx.job_id, error = %e, "Progress finalize failed");
        }

        tracing::info!(job_id = %ctx.job_id, files = total, mode = %job.mode, "Analysis complete");
        Ok(json!({
            "status": "Complete",
            "files_generated": total,
        }))
    }
}
