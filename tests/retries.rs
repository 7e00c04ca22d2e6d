#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::assert_some;
use conveyor::{
    BackoffStrategy, Job, JobContext, RetryPolicy, Runner, dead_job_count, list_dead_jobs,
    retry_dead_job, setup_database,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;
use tokio::time::{Instant, sleep};

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// Wait until `condition` reports true, failing the test after 10 seconds.
    pub(super) async fn wait_until<F, Fut>(condition: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition().await {
            assert!(
                Instant::now() < deadline,
                "condition was not reached within 10 seconds"
            );
            sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn remaining_jobs(pool: &PgPool) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[tokio::test]
async fn failed_jobs_are_requeued_with_a_bumped_attempt() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl Job for TestJob {
        const JOB_TYPE: &'static str = "test";
        type Context = ();

        // A long retry delay keeps the requeued job invisible, so the
        // worker shuts down after the first failed attempt.
        fn retry_policy() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 3,
                strategy: BackoffStrategy::Fixed,
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
            }
        }

        async fn run(&self, _ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            anyhow::bail!("boom");
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ())
        .register::<TestJob>()?
        .shutdown_when_queue_empty();

    let job_id = assert_some!(TestJob.enqueue(&pool).await?);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let (attempt, last_error) = sqlx::query_as::<_, (i32, Option<String>)>(
        "SELECT attempt, last_error FROM background_jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(&pool)
    .await?;

    assert_eq!(attempt, 2);
    assert!(last_error.unwrap().contains("boom"));
    assert_eq!(dead_job_count(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn panicking_jobs_count_as_failed_attempts() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl Job for TestJob {
        const JOB_TYPE: &'static str = "test";
        type Context = ();

        fn retry_policy() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 3,
                strategy: BackoffStrategy::Fixed,
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
            }
        }

        async fn run(&self, _ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            panic!("kaboom");
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ())
        .register::<TestJob>()?
        .shutdown_when_queue_empty();

    let job_id = assert_some!(TestJob.enqueue(&pool).await?);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let (attempt, last_error) = sqlx::query_as::<_, (i32, Option<String>)>(
        "SELECT attempt, last_error FROM background_jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(&pool)
    .await?;

    assert_eq!(attempt, 2);
    assert!(last_error.unwrap().contains("kaboom"));

    Ok(())
}

#[tokio::test]
async fn failed_jobs_do_not_release_lock_before_updating_retry_time() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl Job for TestJob {
        const JOB_TYPE: &'static str = "test";
        type Context = TestContext;

        fn retry_policy() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 3,
                strategy: BackoffStrategy::Fixed,
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
            }
        }

        async fn run(&self, ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            ctx.app.job_started_barrier.wait().await;
            panic!();
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), test_context.clone())
        .register::<TestJob>()?
        .configure_default_queue(|queue| queue.num_workers(2))
        .shutdown_when_queue_empty();

    TestJob.enqueue(&pool).await?;

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    // `SKIP LOCKED` is intentionally omitted here, so we block until
    // the lock on the first job is released.
    // If there is any point where the row is unlocked, but the attempt
    // counter is not updated, we will get a row here.
    let available_jobs =
        sqlx::query_scalar::<_, i64>("SELECT id FROM background_jobs WHERE attempt = 1 FOR UPDATE")
            .fetch_all(&pool)
            .await?;
    assert_eq!(available_jobs.len(), 0);

    // Sanity check to make sure the job actually is there
    let total_jobs_including_failed =
        sqlx::query_scalar::<_, i64>("SELECT id FROM background_jobs FOR UPDATE")
            .fetch_all(&pool)
            .await?;
    assert_eq!(total_jobs_including_failed.len(), 1);

    runner.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn delayed_jobs_stay_invisible_until_ready() -> anyhow::Result<()> {
    type Runs = Arc<AtomicU8>;

    #[derive(Serialize, Deserialize)]
    struct DelayedJob;

    impl Job for DelayedJob {
        const JOB_TYPE: &'static str = "delayed";
        type Context = Runs;

        async fn run(&self, ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            ctx.app.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runs: Runs = Arc::new(AtomicU8::new(0));

    let runner = Runner::new(pool.clone(), runs.clone()).register_with::<DelayedJob, _>(|queue| {
        queue
            .num_workers(1)
            .poll_interval(Duration::from_millis(20))
            .jitter(Duration::ZERO)
    })?;

    DelayedJob.enqueue_delayed(&pool, Duration::from_millis(600)).await?;

    let handle = runner.start();

    // Well before the readiness gate the job must not have run.
    sleep(Duration::from_millis(250)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(handle.status().await?.queue_size, 1);

    // After the gate elapses the job is picked up.
    test_utils::wait_until(|| {
        let runs = runs.clone();
        async move { runs.load(Ordering::SeqCst) == 1 }
    })
    .await;

    handle.stop();
    handle.wait_for_shutdown().await;

    assert_eq!(remaining_jobs(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn exhausted_jobs_are_dead_lettered_exactly_once() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct AlwaysFails;

    impl Job for AlwaysFails {
        const JOB_TYPE: &'static str = "always_fails";
        type Context = ();

        // Tiny delays make all three attempts run back to back.
        fn retry_policy() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 3,
                strategy: BackoffStrategy::Fixed,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            }
        }

        async fn run(&self, _ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            anyhow::bail!("boom");
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ()).register_with::<AlwaysFails, _>(|queue| {
        queue
            .num_workers(1)
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
    })?;

    AlwaysFails.enqueue(&pool).await?;

    let handle = runner.start();

    test_utils::wait_until(|| {
        let pool = pool.clone();
        async move { dead_job_count(&pool).await.unwrap_or(0) == 1 }
    })
    .await;

    handle.stop();
    handle.wait_for_shutdown().await;

    assert_eq!(dead_job_count(&pool).await?, 1);
    assert_eq!(remaining_jobs(&pool).await?, 0);

    let dead = list_dead_jobs(&pool, Some("always_fails"), None).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
    assert_eq!(dead[0].max_attempts, 3);
    assert!(dead[0].final_error.contains("boom"));

    Ok(())
}

#[tokio::test]
async fn timed_out_jobs_fail_without_hanging_the_loop() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct SleepyJob;

    impl Job for SleepyJob {
        const JOB_TYPE: &'static str = "sleepy";
        const TIMEOUT: Option<Duration> = Some(Duration::from_millis(100));
        type Context = ();

        fn retry_policy() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 1,
                strategy: BackoffStrategy::Fixed,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            }
        }

        async fn run(&self, _ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            // Far longer than the configured timeout.
            sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ()).register_with::<SleepyJob, _>(|queue| {
        queue
            .num_workers(1)
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
    })?;

    SleepyJob.enqueue(&pool).await?;

    let handle = runner.start();

    test_utils::wait_until(|| {
        let pool = pool.clone();
        async move { dead_job_count(&pool).await.unwrap_or(0) == 1 }
    })
    .await;

    handle.stop();
    handle.wait_for_shutdown().await;

    let dead = list_dead_jobs(&pool, Some("sleepy"), None).await?;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].final_error.contains("timeout"));
    assert_eq!(remaining_jobs(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn dead_lettered_jobs_can_be_re_admitted() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct FlakyJob;

    impl Job for FlakyJob {
        const JOB_TYPE: &'static str = "flaky";
        type Context = ();

        fn retry_policy() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 1,
                strategy: BackoffStrategy::Fixed,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            }
        }

        async fn run(&self, _ctx: JobContext<Self::Context>) -> anyhow::Result<Value> {
            anyhow::bail!("dependency offline");
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = Runner::new(pool.clone(), ()).register_with::<FlakyJob, _>(|queue| {
        queue
            .num_workers(1)
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
    })?;

    FlakyJob.enqueue(&pool).await?;

    let handle = runner.start();

    test_utils::wait_until(|| {
        let pool = pool.clone();
        async move { dead_job_count(&pool).await.unwrap_or(0) == 1 }
    })
    .await;

    handle.stop();
    handle.wait_for_shutdown().await;

    let dead = list_dead_jobs(&pool, Some("flaky"), None).await?;
    let dead_id = dead[0].id;

    assert!(retry_dead_job(&pool, dead_id).await?);
    assert_eq!(dead_job_count(&pool).await?, 0);

    let (attempt, max_attempts) = sqlx::query_as::<_, (i32, i32)>(
        "SELECT attempt, max_attempts FROM background_jobs WHERE job_type = 'flaky'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(attempt, 1);
    assert_eq!(max_attempts, 1);

    // Re-admitting a job that is not dead-lettered reports false.
    assert!(!retry_dead_job(&pool, dead_id).await?);

    Ok(())
}
