//! Job handlers and orchestrator assembly for declared configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cadence_core::{
    ExecutionContext, JobBuilder, JobHandler, Orchestrator, TimerTrigger, TriggerBuilder,
};
use futures::future::BoxFuture;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AppConfig, JobKind, JobSpec, TriggerSpec};

/// Logs the trigger context
pub struct LogJob {
    name: String,
    message: String,
}

impl LogJob {
    pub fn new(name: impl Into<String>, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            message: message.unwrap_or_else(|| "job executed".to_string()),
        }
    }
}

#[async_trait]
impl JobHandler for LogJob {
    async fn handle(
        &self,
        context: Option<ExecutionContext>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let context = serde_json::to_string(&context)?;
        info!(job = %self.name, context = %context, "{}", self.message);
        Ok(())
    }
}

/// Runs an external program; a non-zero exit status is a failure
pub struct CommandJob {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandJob {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        debug!(
            job = %self.name,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Command finished"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for CommandJob {
    async fn handle(
        &self,
        _context: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let run = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.run()).await {
                    Ok(result) => result,
                    Err(_) => bail!("'{}' timed out after {:?}", self.program, limit),
                },
                None => self.run().await,
            }
        };

        tokio::select! {
            result = run => result,
            _ = cancel.cancelled() => bail!("'{}' canceled", self.program),
        }
    }
}

/// Fire only while `path` exists, or always when unset
fn fire_condition(
    path: Option<PathBuf>,
) -> impl Fn(Option<ExecutionContext>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync
{
    move |_| {
        let path = path.clone();
        Box::pin(async move {
            match path {
                Some(path) => Ok(tokio::fs::try_exists(&path).await?),
                None => Ok(true),
            }
        })
    }
}

/// Build a trigger from its declaration
pub fn build_trigger(spec: &TriggerSpec, config: &AppConfig) -> Result<TimerTrigger> {
    let mut builder = TriggerBuilder::new(&spec.name)
        .every(Duration::from_millis(spec.interval_ms))
        .fire_action(fire_condition(spec.fire_if_exists.clone()));
    if let Some(group) = &spec.group {
        builder = builder.group(group);
    }
    if let Some(max) = spec.max_concurrents {
        builder = builder.max_concurrents(max);
    }
    if let Some(max) = spec.max_occurrences {
        builder = builder.max_occurrences(max);
    }
    if let Some(spacing) = spec.rate_limit_ms {
        let max = spec
            .max_concurrents
            .unwrap_or(config.scheduler.trigger.max_concurrents);
        builder = builder.rate_limit(Duration::from_millis(spacing), max);
    }
    builder
        .with_defaults(&config.scheduler.trigger)
        .build()
        .with_context(|| format!("invalid trigger '{}'", spec.name))
}

/// Build a job from its declaration
pub fn build_job(spec: &JobSpec, config: &AppConfig) -> Result<cadence_core::ScheduledJob> {
    let handler: Arc<dyn JobHandler> = match spec.kind {
        JobKind::Log => Arc::new(LogJob::new(&spec.name, spec.message.clone())),
        JobKind::Command => {
            let program = spec
                .command
                .clone()
                .with_context(|| format!("job '{}' has no command", spec.name))?;
            Arc::new(CommandJob::new(
                &spec.name,
                program,
                spec.args.clone(),
                spec.timeout_ms.map(Duration::from_millis),
            ))
        }
    };

    let mut builder = JobBuilder::new(&spec.name)
        .handler(handler)
        .enabled(spec.enabled);
    if let Some(group) = &spec.group {
        builder = builder.group(group);
    }
    if let Some(max) = spec.max_concurrents {
        builder = builder.max_concurrents(max);
    }
    if let Some(spacing) = spec.rate_limit_ms {
        let max = spec
            .max_concurrents
            .unwrap_or(config.scheduler.job.max_concurrents);
        builder = builder.rate_limit(Duration::from_millis(spacing), max);
    }
    builder
        .with_defaults(&config.scheduler.job)
        .build()
        .with_context(|| format!("invalid job '{}'", spec.name))
}

/// Assemble an orchestrator holding every declared trigger and job
pub fn build_orchestrator(config: &AppConfig) -> Result<(Orchestrator, Vec<Arc<TimerTrigger>>)> {
    let orchestrator = Orchestrator::with_config(config.scheduler.clone());

    let mut triggers = Vec::with_capacity(config.triggers.len());
    for spec in &config.triggers {
        let trigger = Arc::new(build_trigger(spec, config)?);
        orchestrator.add_trigger(trigger.clone())?;
        triggers.push(trigger);
    }
    for spec in &config.jobs {
        orchestrator.add_job(Arc::new(build_job(spec, config)?))?;
    }

    Ok((orchestrator, triggers))
}

#[cfg(test)]
mod tests;
