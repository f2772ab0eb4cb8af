use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};

use crate::config::{ScheduleFile, StatsConfig};
use crate::jobs::StatsEngine;

/// One cron job per enabled schedule entry; each tick runs the named stats job.
pub async fn build_scheduler(engine: Arc<StatsEngine>, schedule: &ScheduleFile) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (job, cron) in schedule.enabled() {
        let engine = engine.clone();
        let cron_job = CronJob::new_async(cron, move |_uuid, _lock| {
            let engine = engine.clone();
            Box::pin(async move {
                match engine.run(job).await {
                    Ok(summary) => info!(%job, "{}", summary.acknowledgment()),
                    Err(err) => error!(%job, error = %err, "scheduled job failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job {job} for cron {cron}"))?;
        sched.add(cron_job).await.context("adding scheduler job")?;
        info!(%job, cron, "scheduled");
    }
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &StatsConfig,
    engine: Arc<StatsEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let schedule = ScheduleFile::load(&config.schedule_file).await?;
    build_scheduler(engine, &schedule).await.map(Some)
}
