use anyhow::Result;
use async_workpool::{worker, Config, JoinOrdering, WorkerPool};
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};


fn square(x: i64) -> Result<i64, String> {
    if x < 0 {
        return Err(format!("negative input: {x}"));
    }
    std::thread::sleep(Duration::from_millis(200));
    Ok(x * x)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "async_workpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let rt = Builder::new_multi_thread()
        .worker_threads(config.worker_count)
        .enable_all()
        .build()?;

    rt.block_on(async {
        let pool = WorkerPool::with_config(config.clone())?;
        println!("process {} running {} workers", std::process::id(), config.worker_count);

        // Non-blocking submission, polled with ready().
        let handle = pool.apply_async(square, 7)?;
        while !handle.ready() {
            println!("{} still {:?}", handle.id(), handle.state());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        println!("{} on {:?} -> {:?}", handle.id(), handle.worker(), handle.get(None).await);

        // Blocking retrieval through apply().
        println!("apply(square, 12) = {}", pool.apply(square, 12).await?);

        // Failures stay inside the handle until get().
        let good = pool.apply_async(square, 3)?;
        let bad = pool.apply_async(square, -3)?;
        good.wait(None).await;
        bad.wait(None).await;
        println!("good successful: {}, bad successful: {}", good.successful()?, bad.successful()?);
        if let Err(err) = bad.get(None).await {
            println!("bad raised: {err}");
        }

        // Workers are reused across tasks.
        let now = Instant::now();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                pool.spawn_blocking(move || {
                    std::thread::sleep(Duration::from_millis(200));
                    (i, worker::current())
                })
            })
            .collect::<Result<_, _>>()?;
        for handle in handles {
            let (i, worker) = handle.await?;
            println!("task {i} ran on {worker:?}");
        }
        println!("10 tasks elapsed: {:?}", now.elapsed());

        pool.shutdown(false).await?;
        anyhow::Ok(())
    })?;

    // Scoped pool: shut down when the closure's future completes.
    rt.block_on(async {
        let squares = WorkerPool::scope(Config::with_workers(4), |pool| async move {
            pool.map(square, 0..8, JoinOrdering::Ordered).await
        })
        .await??;
        let squares: Vec<_> = squares.into_iter().collect::<Result<_, _>>()?;
        println!("scoped map: {squares:?}");
        anyhow::Ok(())
    })?;

    Ok(())
}
