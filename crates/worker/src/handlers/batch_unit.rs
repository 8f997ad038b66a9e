//! One member of a batch fan-out.
//!
//! Arguments: `[job_id, unit_mode, index, primary_key, counterpart_keys]`,
//! keyword arguments `model_type`, `multi_api`, `min_relevance`.

use async_trait::async_trait;
use jokbo_core::mode::{AnalysisMode, ModelTier};
use jokbo_core::progress::ProgressUpdate;
use serde_json::{json, Value};

use super::{TaskContext, TaskHandler};
use crate::analyzer::{AnalysisOptions, AnalysisRequest};
use crate::error::TaskError;

pub struct BatchUnitHandler;

struct UnitArgs {
    mode: AnalysisMode,
    index: u32,
    primary_key: String,
    counterpart_keys: Vec<String>,
    options: AnalysisOptions,
}

fn parse_args(ctx: &TaskContext) -> Result<UnitArgs, TaskError> {
    let mode: AnalysisMode = ctx.str_arg(1)?.parse()?;
    let index = ctx
        .arg(2)?
        .as_u64()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| TaskError::Failed("Unit index must be a non-negative integer".into()))?;
    let primary_key = ctx.str_arg(3)?.to_string();
    let counterpart_keys: Vec<String> = serde_json::from_value(ctx.arg(4)?.clone())
        .map_err(|e| TaskError::Failed(format!("Invalid counterpart keys: {e}")))?;

    let kwargs = &ctx.task.kwargs;
    let model_tier = match kwargs.get("model_type").and_then(Value::as_str) {
        Some(raw) => raw.parse::<ModelTier>()?,
        None => ModelTier::default(),
    };
    let multi_api = kwargs
        .get("multi_api")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let min_relevance = kwargs
        .get("min_relevance")
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok());

    Ok(UnitArgs {
        mode,
        index,
        primary_key,
        counterpart_keys,
        options: AnalysisOptions {
            mode,
            model_tier,
            multi_api,
            min_relevance,
        },
    })
}

#[async_trait]
impl TaskHandler for BatchUnitHandler {
    async fn run(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let args = parse_args(ctx)?;
        let deps = &ctx.deps;

        // A previous execution may have recorded the unit before losing
        // its lease.
        if let Some(existing) = deps.store.get_partial(&ctx.job_id, args.index).await? {
            tracing::info!(job_id = %ctx.job_id, unit = args.index, "Unit already recorded");
            return Ok(unit_result(&args, existing));
        }

        ctx.probe.checkpoint().await?;
        let primary = deps.document(&args.primary_key).await?;
        let mut counterparts = Vec::with_capacity(args.counterpart_keys.len());
        for key in &args.counterpart_keys {
            counterparts.push(deps.document(key).await?);
        }

        let request = AnalysisRequest {
            job_id: ctx.job_id.clone(),
            options: args.options.clone(),
            primary,
            counterparts,
        };
        let result = deps.analyzer.analyze(&request, &ctx.probe).await?;
        ctx.probe.checkpoint().await?;

        let inserted = deps
            .store
            .record_partial(&ctx.job_id, args.index, &result)
            .await?;
        if inserted {
            let message = format!("Unit {} done: {}", args.index, args.primary_key);
            if let Err(e) = deps
                .progress
                .update(&ctx.job_id, ProgressUpdate::Increment(1), Some(message.as_str()))
                .await
            {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Progress update failed");
            }
        }

        tracing::info!(
            job_id = %ctx.job_id,
            unit = args.index,
            mode = %args.mode,
            "Batch unit complete"
        );
        Ok(unit_result(&args, result))
    }
}

fn unit_result(args: &UnitArgs, result: Value) -> Value {
    json!({
        "unit": args.index,
        "key": args.primary_key,
        "result": result,
    })
}
