//! Minimal periodic job runner.
//!
//! Jobs are injected as closures at wiring time (the API binary registers
//! the guardian tick here); the scheduler owns one tokio task per job and
//! stops them cooperatively on shutdown. A job returning an error is
//! logged and the cadence continues; one bad tick must not kill the loop.

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

type JobFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct Job {
    name: String,
    every: Duration,
    run: JobFn,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Scheduler {
            jobs: Vec::new(),
            stop_tx,
            handles: Vec::new(),
        }
    }

    /// Register a periodic job. The first run happens one full interval
    /// after `start()`, not immediately.
    pub fn add_job<F, Fut>(&mut self, name: &str, every: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.jobs.push(Job {
            name: name.to_string(),
            every,
            run: Box::new(move || -> BoxFuture<'static, Result<(), String>> { Box::pin(f()) }),
        });
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name.clone()).collect()
    }

    /// Spawn one task per registered job.
    pub fn start(&mut self) {
        let jobs = std::mem::take(&mut self.jobs);
        for job in jobs {
            let mut stop_rx = self.stop_tx.subscribe();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(job.every);
                // The immediate first tick from `interval` is consumed here
                // so jobs start one period in.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = (job.run)().await {
                                error!(job = %job.name, error = %e, "scheduled job failed");
                            }
                        }
                        _ = stop_rx.changed() => {
                            info!(job = %job.name, "scheduled job stopped");
                            break;
                        }
                    }
                }
            });
            self.handles.push(handle);
        }
    }

    /// Stop all jobs and wait for their tasks to finish.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_on_their_cadence() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let mut sched = Scheduler::new();
        sched.add_job("tick", Duration::from_secs(60), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        sched.start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "fired before first interval");

        tokio::time::sleep(Duration::from_secs(185)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!((3..=4).contains(&fired), "expected ~3 ticks, got {fired}");

        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_stop_the_cadence() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let mut sched = Scheduler::new();
        sched.add_job("flaky", Duration::from_secs(10), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            }
        });
        sched.start();

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_future_ticks() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let mut sched = Scheduler::new();
        sched.add_job("tick", Duration::from_secs(10), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        sched.start();

        tokio::time::sleep(Duration::from_secs(25)).await;
        sched.stop().await;
        let at_stop = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_stop);
    }
}
