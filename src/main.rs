use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;

use qpass::{BatchScheduler, Job, JobFailure, SchedulerConfig, SchedulerOptions, SchedulerPhase};

type DemoJob = Job<String, anyhow::Error>;

/// A job that sleeps for `duration` (plus jitter) and fails when asked to.
fn make_job(id: usize, duration: Duration, should_fail: bool) -> DemoJob {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..200));
    Job::new(move || async move {
        tokio::time::sleep(duration + jitter).await;
        if should_fail {
            Err(anyhow!("Job {id} failed"))
        } else {
            Ok(format!("Job {id} completed"))
        }
    })
}

fn describe(outcome: &Result<String, JobFailure<anyhow::Error>>) -> String {
    match outcome {
        Ok(value) => value.clone(),
        Err(failure) => format!("Error: {failure}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SchedulerConfig::default().with_batch_size(3).apply_env()?;

    let job_count: usize = std::env::var("QPASS_DEMO_JOBS")
        .unwrap_or_else(|_| "14".to_string())
        .parse()
        .unwrap_or(14);

    eprintln!("🚀 qpass v{} demo", qpass::VERSION);
    eprintln!("   Batch size: {}", config.batch_size);
    eprintln!("   Break when error: {}", config.break_when_error);
    eprintln!("   Jobs: {job_count} (every third fails)\n");

    let options = SchedulerOptions::from_config(config).on_progress(
        |progress: qpass::Progress<String, anyhow::Error>, scheduler: &BatchScheduler<String, anyhow::Error>| {
            println!("Remaining batches: {}", progress.batches_remaining);
            println!("Remaining jobs: {}", progress.items_remaining);
            if progress.items_remaining > 0 && progress.items_remaining <= 4 {
                println!("Terminating the queue...");
                let discarded = scheduler.terminate();
                println!("Discarded {discarded} queued jobs");
            }
            let lines: Vec<String> = progress.completed.iter().map(describe).collect();
            println!("Completed: {lines:?}");
            println!("---");
        },
    );

    let scheduler = BatchScheduler::new(options)?;

    for id in 1..=job_count {
        scheduler.add_one(make_job(id, Duration::from_millis(800), id % 3 == 0));
    }

    match scheduler.wait_idle().await {
        SchedulerPhase::Stopped => eprintln!("🛑 qpass demo stopped on first failure"),
        _ => eprintln!("🚀 qpass demo completed"),
    }

    Ok(())
}
