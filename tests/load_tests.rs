#[cfg(test)]
mod tests {
    use async_workpool::{
        model::JoinOrdering,
        pool::{join_handles, Config, WorkerPool},
    };
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    async fn measure<F, Fut, T>(name: &str, f: F) -> (T, Duration)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let result = f().await;
        let elapsed = start.elapsed();
        println!("✓ {}: {:?}", name, elapsed);
        (result, elapsed)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_1_parallel_speedup_blocking() {
        println!("\n=== LOAD TEST 1: 10 blocking tasks x 200ms on 4 workers ===");
        let pool = WorkerPool::open(4).unwrap();
        let unit = Duration::from_millis(200);

        let (results, elapsed) = measure("10 tasks", || async {
            let handles: Vec<_> = (0..10)
                .map(|i| {
                    pool.spawn_blocking(move || {
                        std::thread::sleep(unit);
                        i
                    })
                    .unwrap()
                })
                .collect();
            join_handles(handles, JoinOrdering::Ordered).await
        })
        .await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.is_ok()));
        // ceil(10 / 4) = 3 rounds, far from 10 sequential units.
        assert!(elapsed >= unit * 3, "too fast: {elapsed:?}");
        assert!(elapsed < unit * 6, "no parallel speedup: {elapsed:?}");

        pool.shutdown(false).await.unwrap();
        assert!(pool.metrics().peak_running <= 4);
    }

    #[tokio::test]
    async fn load_test_2_parallel_speedup_async() {
        println!("\n=== LOAD TEST 2: 10 async tasks x 100ms on 4 workers ===");
        let pool = WorkerPool::open(4).unwrap();
        let unit = Duration::from_millis(100);

        let (results, elapsed) = measure("10 tasks", || async {
            let handles: Vec<_> = (0..10)
                .map(|_| pool.spawn(tokio::time::sleep(unit)).unwrap())
                .collect();
            join_handles(handles, JoinOrdering::UnOrdered).await
        })
        .await;

        assert_eq!(results.len(), 10);
        assert!(elapsed >= unit * 3, "too fast: {elapsed:?}");
        assert!(elapsed < unit * 6, "no parallel speedup: {elapsed:?}");

        pool.shutdown(false).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_3_running_never_exceeds_workers() {
        println!("\n=== LOAD TEST 3: concurrency bound ===");
        for workers in [1usize, 3, 8] {
            let pool = WorkerPool::open(workers).unwrap();
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..200)
                .map(|i| {
                    let running = running.clone();
                    let peak = peak.clone();
                    pool.spawn(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_micros(200 + (i % 7) * 50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap()
                })
                .collect();

            let results = join_handles(handles, JoinOrdering::UnOrdered).await;
            assert!(results.iter().all(|r| r.is_ok()));

            pool.shutdown(false).await.unwrap();
            let metrics = pool.metrics();
            println!(
                "  workers={} observed peak={} pool peak={}",
                workers,
                peak.load(Ordering::SeqCst),
                metrics.peak_running
            );
            assert!(peak.load(Ordering::SeqCst) <= workers);
            assert!(metrics.peak_running <= workers);
            assert_eq!(metrics.succeeded_tasks, 200);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_4_many_small_tasks() {
        println!("\n=== LOAD TEST 4: 10k small tasks ===");
        let pool = WorkerPool::with_config(Config::io_bound()).unwrap();

        let (results, _) = measure("10k tasks", || async {
            pool.map(|x: u64| Ok::<_, String>(x * 2), 0..10_000, JoinOrdering::UnOrdered)
                .await
                .unwrap()
        })
        .await;

        assert_eq!(results.len(), 10_000);
        let sum: u64 = results.into_iter().map(|r| r.unwrap()).sum();
        assert_eq!(sum, (0..10_000u64).map(|x| x * 2).sum());

        pool.shutdown(false).await.unwrap();
        let metrics = pool.metrics();
        println!("  Success rate: {:.1}%", metrics.success_rate() * 100.0);
        assert_eq!(metrics.total_submitted, 10_000);
        assert_eq!(metrics.finished(), 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_5_shutdown_timeout() {
        println!("\n=== LOAD TEST 5: shutdown timeout ===");
        let pool = WorkerPool::open(2).unwrap();
        for _ in 0..2 {
            pool.spawn(tokio::time::sleep(Duration::from_millis(500))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let res = pool.shutdown_timeout(false, Duration::from_millis(50)).await;
        assert!(res.is_err(), "running tasks outlive the timeout");
        assert!(pool.is_closed());
    }
}
