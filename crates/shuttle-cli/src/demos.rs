//! Small programs built on the scheduler.

use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::Value;
use shuttle_core::{
    CancellationSource, ResumeInput, Scheduler, Step, Task, TaskError, TaskHandle,
};
use tokio::time::Instant;

use crate::FetchMode;

pub(crate) async fn sum(scheduler: &Scheduler, a: i64, b: i64, delay_ms: u64) -> anyhow::Result<()> {
    let handle = scheduler
        .submit(Task::delayed(Duration::from_millis(delay_ms), a + b).named("sum"))
        .await?;

    println!("Computing {a} + {b}...");
    let value = scheduler.await_result(handle).await?;
    println!("Result: {value}");
    Ok(())
}

pub(crate) async fn numbers(
    scheduler: &Scheduler,
    count: u32,
    step_ms: u64,
    timeout_ms: u64,
) -> anyhow::Result<()> {
    let source = CancellationSource::new();
    let timeout = scheduler.timeout(&source, Duration::from_millis(timeout_ms));

    let period = Duration::from_millis(step_ms);
    let mut next = 0;
    let task = Task::new(move |_input: ResumeInput| {
        if next == count {
            return Step::complete(next);
        }
        next += 1;
        println!("Processing {next}");
        Step::sleep(period)
    })
    .named("numbers")
    .with_cancellation(source.token());

    let handle = scheduler.submit(task).await?;
    match scheduler.await_result(handle).await {
        Ok(processed) => {
            timeout.dispose();
            println!("Processed {processed} numbers.");
            Ok(())
        }
        Err(TaskError::Cancelled) => {
            println!("Operation cancelled.");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

fn fetch(page: u32, latency: Duration) -> Task {
    Task::new(move |input: ResumeInput| match input {
        ResumeInput::Start => Step::sleep(latency),
        _ => Step::complete(format!("page {page}: {} bytes", 512 * page)),
    })
    .named(format!("fetch-{page}"))
}

pub(crate) async fn pages(
    scheduler: &Scheduler,
    mode: FetchMode,
    pages: u32,
    latency_ms: u64,
) -> anyhow::Result<()> {
    if pages == 0 {
        bail!("--pages must be at least 1");
    }
    let latency = Duration::from_millis(latency_ms);
    let start = Instant::now();

    let bodies: Vec<Value> = match mode {
        FetchMode::Sequential => {
            let mut bodies = Vec::with_capacity(pages as usize);
            for page in 1..=pages {
                let handle = scheduler.submit(fetch(page, latency)).await?;
                bodies.push(scheduler.await_result(handle).await?);
            }
            bodies
        }
        FetchMode::Parallel => {
            let mut handles: Vec<TaskHandle> = Vec::with_capacity(pages as usize);
            for page in 1..=pages {
                handles.push(scheduler.submit(fetch(page, latency)).await?);
            }
            let all = scheduler.when_all(&handles).await?;
            match scheduler.await_result(all).await? {
                Value::Array(bodies) => bodies,
                other => bail!("when_all produced {other}"),
            }
        }
    };

    for body in &bodies {
        let line = body.as_str().context("page body is not a string")?;
        println!("{line}");
    }
    println!(
        "Fetched {} pages {:?} in {:?}",
        bodies.len(),
        mode,
        start.elapsed()
    );
    Ok(())
}
