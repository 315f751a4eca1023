//! Background reconnection supervisor (API processes only).
//!
//! One task, one loop. The single hard rule: never open a connection while
//! `now < next_retry_at - safety margin`. During a pooler lockout that
//! window is 15-20 minutes, and connecting early restarts the lockout
//! clock, which is exactly the amplification this exists to prevent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state::{DbReadinessState, ErrorClass};

/// Minimum remaining backoff before a retry is allowed (clock-drift margin).
pub const RETRY_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Poll interval while the database is healthy.
const READY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Pause after each attempt before re-reading state.
const POST_ATTEMPT_PAUSE: Duration = Duration::from_secs(1);

/// Waits longer than this get an operator log line (suggests lockout).
const LONG_WAIT_LOG_THRESHOLD: Duration = Duration::from_secs(120);

/// Maximum single sleep so the loop stays responsive to `stop()`.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(60);

pub struct DbSupervisor {
    state: Arc<RwLock<DbReadinessState>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DbSupervisor {
    pub fn new(state: Arc<RwLock<DbReadinessState>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        DbSupervisor {
            state,
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Start the supervisor task. Idempotent: a second call while running
    /// is a no-op.
    ///
    /// `connect_fn` is expected to update the readiness state itself (via
    /// `mark_connected` / `mark_failed`); the supervisor only decides *when*
    /// it may run.
    pub async fn start<F, Fut>(&self, connect_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut st = self.state.write().await;
            if st.supervisor_running {
                debug!("[DB supervisor] already running");
                return;
            }
            st.supervisor_running = true;
        }

        let state = Arc::clone(&self.state);
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(run_loop(state, connect_fn, stop_rx));
        *self.task.lock().await = Some(handle);
        info!("[DB supervisor] started background reconnection supervisor");
    }

    /// Cooperatively stop the supervisor and wait for the task to finish.
    pub async fn stop(&self) {
        {
            let st = self.state.read().await;
            if !st.supervisor_running {
                return;
            }
        }
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.state.write().await.supervisor_running = false;
        info!("[DB supervisor] stopped");
    }
}

async fn run_loop<F, Fut>(
    state: Arc<RwLock<DbReadinessState>>,
    connect_fn: F,
    mut stop: watch::Receiver<bool>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut logged_this_wait = false;

    loop {
        if *stop.borrow() {
            break;
        }

        let (ready, retry_in, class) = {
            let s = state.read().await;
            (s.ready, s.next_retry_in(), s.last_error_class)
        };

        if ready {
            logged_this_wait = false;
            if sleep_or_stop(READY_CHECK_INTERVAL, &mut stop).await {
                break;
            }
            continue;
        }

        // no_config schedules no retry: only a config change (and restart)
        // can fix it, so reconnect attempts would just burn log lines.
        if class == Some(ErrorClass::NoConfig) {
            if sleep_or_stop(READY_CHECK_INTERVAL, &mut stop).await {
                break;
            }
            continue;
        }

        if let Some(retry_in) = retry_in {
            if retry_in > RETRY_SAFETY_MARGIN {
                if retry_in > LONG_WAIT_LOG_THRESHOLD && !logged_this_wait {
                    info!(
                        retry_in_s = retry_in.as_secs(),
                        error_class = class.map(|c| c.as_str()).unwrap_or("unknown"),
                        "[DB supervisor] honoring backoff; no connection attempts until the window expires"
                    );
                    logged_this_wait = true;
                }
                if sleep_or_stop(retry_in.min(MAX_SLEEP_CHUNK), &mut stop).await {
                    break;
                }
                continue;
            }
        }

        logged_this_wait = false;
        info!("[DB supervisor] attempting reconnection");
        connect_fn().await;

        if sleep_or_stop(POST_ATTEMPT_PAUSE, &mut stop).await {
            break;
        }
    }
}

/// Sleep for `d`, returning true if a stop signal arrived first.
async fn sleep_or_stop(d: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = stop.changed() => true,
    }
}
