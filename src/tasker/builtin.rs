//! Demo task types shipped with the binary.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TaskerError};
use crate::tasker::factory::{config_u64, config_u64_or, TaskRegistry};
use crate::tasker::info::TaskConfig;
use crate::tasker::task::{Task, TaskContext, TaskError};

pub const NOOP_TASK: &str = "noop";
pub const SLEEP_TASK: &str = "sleep";

/// Finishes at once.
pub struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    async fn perform_task(&self, ctx: &TaskContext) -> std::result::Result<(), TaskError> {
        ctx.write_task_log("Nothing to do").await;
        Ok(())
    }
}

/// Sleeps for `duration_ms` in `steps` slices, logging progress after each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepTask {
    pub duration: Duration,
    pub steps: u64,
}

impl SleepTask {
    pub fn from_config(task_config: Option<&TaskConfig>) -> Result<Self> {
        let duration_ms = config_u64(task_config, "duration_ms")?;
        let steps = config_u64_or(task_config, "steps", 1)?;
        if steps == 0 {
            return Err(TaskerError::TaskConfiguration(
                "steps must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            duration: Duration::from_millis(duration_ms),
            steps,
        })
    }
}

#[async_trait]
impl Task for SleepTask {
    async fn perform_task(&self, ctx: &TaskContext) -> std::result::Result<(), TaskError> {
        let step = self.duration / u32::try_from(self.steps).unwrap_or(u32::MAX);
        for done in 1..=self.steps {
            if ctx.is_canceled_or_interrupted() {
                ctx.write_task_log(&format!("Stopped after {} of {} steps", done - 1, self.steps))
                    .await;
                return Ok(());
            }
            ctx.sleep(step).await?;
            ctx.write_task_log(&format!("Step {}/{} done", done, self.steps))
                .await;
        }
        Ok(())
    }
}

/// Registry with all demo task types.
pub fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .with(NOOP_TASK, |_| Ok(Box::new(NoopTask) as Box<dyn Task>))
        .with(SLEEP_TASK, |cfg| {
            Ok(Box::new(SleepTask::from_config(cfg)?) as Box<dyn Task>)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasker::factory::TaskFactory;
    use serde_json::json;

    #[test]
    fn registry_lists_demo_types() {
        assert_eq!(registry().list_supported_task_types(), vec!["noop", "sleep"]);
    }

    #[test]
    fn sleep_config() {
        let cfg = json!({"duration_ms": 1000, "steps": 4});
        let task = SleepTask::from_config(cfg.as_object()).unwrap();
        assert_eq!(task.duration, Duration::from_secs(1));
        assert_eq!(task.steps, 4);

        let cfg = json!({"duration_ms": 10});
        assert_eq!(SleepTask::from_config(cfg.as_object()).unwrap().steps, 1);

        assert!(SleepTask::from_config(None).is_err());
        let cfg = json!({"duration_ms": "10"});
        assert!(SleepTask::from_config(cfg.as_object()).is_err());
        let cfg = json!({"duration_ms": 10, "steps": 0});
        assert!(SleepTask::from_config(cfg.as_object()).is_err());
    }

    #[test]
    fn sleep_config_is_validated_by_registry() {
        let err = registry().create_task(SLEEP_TASK, None).err().unwrap();
        assert!(matches!(err, TaskerError::TaskConfiguration(_)));
    }
}
