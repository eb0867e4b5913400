//! A tokio task that drives an [`RxContext`]: runs on interrupts, keeps the
//! deadline timer and trims the freelist periodically.

use std::io;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::rx::RxContext;

/// Handle of the driver task.
///
/// ```no_run
/// # async fn demo(ctx: std::sync::Arc<netfront_rs::RxContext>) -> std::io::Result<()> {
/// use netfront_rs::RxDriver;
///
/// let driver = RxDriver::spawn(ctx);
/// // from the event channel handler:
/// driver.interrupt();
/// // on detach:
/// driver.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct RxDriver {
    ctx: Arc<RxContext>,
    kick: Arc<Notify>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RxDriver {
    /// Spawns the driver on the current tokio runtime.
    pub fn spawn(ctx: Arc<RxContext>) -> RxDriver {
        let kick = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(drive(ctx.clone(), kick.clone(), stop.clone()));
        RxDriver {
            ctx,
            kick,
            stop,
            task,
        }
    }

    pub fn context(&self) -> &Arc<RxContext> {
        &self.ctx
    }

    /// Event channel interrupt.
    pub fn interrupt(&self) {
        if self.ctx.interrupt() {
            self.kick.notify_one();
        }
    }

    /// Stops the task, then shuts the receive path down once the host has
    /// returned every packet.
    pub async fn stop(self) -> io::Result<()> {
        self.stop.notify_one();
        self.task.await.map_err(io::Error::other)?;
        self.ctx.shutdown_async().await;
        Ok(())
    }
}

async fn drive(ctx: Arc<RxContext>, kick: Arc<Notify>, stop: Arc<Notify>) {
    let mut trim = time::interval(ctx.config().trim_interval());
    trim.set_missed_tick_behavior(MissedTickBehavior::Delay);
    trim.tick().await;
    let mut deadline: Option<Instant> = None;

    loop {
        let armed = deadline;
        let timer = async move {
            match armed {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = stop.notified() => break,
            _ = kick.notified() => {}
            _ = timer => {
                deadline = None;
                if !ctx.timer_expired() {
                    continue;
                }
            }
            _ = trim.tick() => {
                let freed = ctx.trim_freelist();
                if freed > 0 {
                    log::debug!("trimmed {freed} pages");
                }
                continue;
            }
        }

        let outcome = ctx.run();
        if outcome.cancel_deadline {
            deadline = None;
        }
        if let Some(after) = outcome.arm_deadline {
            deadline = Some(Instant::now() + after);
        }
        if outcome.reschedule {
            kick.notify_one();
        }
    }
    log::debug!("rx driver stopped");
}
