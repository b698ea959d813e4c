use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Every task the controller starts for a session, stopped from one place.
#[derive(Default)]
pub struct SessionTimers {
    /// Frame capture ticks
    pub capture: Option<JoinHandle<()>>,
    /// One-second elapsed ticks
    pub elapsed: Option<JoinHandle<()>>,
    /// Liveness ping ticks
    pub keepalive: Option<JoinHandle<()>>,
    /// Session creation + socket open
    pub connect: Option<JoinHandle<()>>,
    /// Fires once when connecting takes too long
    pub connect_deadline: Option<JoinHandle<()>>,
    /// Forwards socket events into the controller queue
    pub socket_pump: Option<JoinHandle<()>>,
}

fn abort(slot: &mut Option<JoinHandle<()>>) -> bool {
    match slot.take() {
        Some(handle) => {
            handle.abort();
            true
        }
        None => false,
    }
}

impl SessionTimers {
    /// Capture, elapsed and keep-alive. They only ever run together.
    pub fn stop_session_clocks(&mut self) -> usize {
        [&mut self.capture, &mut self.elapsed, &mut self.keepalive]
            .into_iter()
            .filter_map(|slot| abort(slot).then_some(()))
            .count()
    }

    pub fn stop_connect(&mut self) -> usize {
        [&mut self.connect, &mut self.connect_deadline]
            .into_iter()
            .filter_map(|slot| abort(slot).then_some(()))
            .count()
    }

    pub fn stop_socket_pump(&mut self) -> bool {
        abort(&mut self.socket_pump)
    }

    /// Stops everything; returns how many tasks were still held.
    pub fn stop_all(&mut self) -> usize {
        self.stop_session_clocks() + self.stop_connect() + usize::from(self.stop_socket_pump())
    }

    pub fn clocks_running(&self) -> bool {
        self.capture.is_some() || self.elapsed.is_some() || self.keepalive.is_some()
    }

    pub fn is_idle(&self) -> bool {
        !self.clocks_running()
            && self.connect.is_none()
            && self.connect_deadline.is_none()
            && self.socket_pump.is_none()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Posts `make()` every `period`, first after one period. Missed ticks are
/// skipped rather than bunched. Ends when the receiver is gone.
pub fn spawn_ticker<E, F>(period: Duration, tx: UnboundedSender<E>, make: F) -> JoinHandle<()>
where
    E: Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if tx.send(make()).is_err() {
                break;
            }
        }
    })
}

/// Posts `event` once after `delay`.
pub fn spawn_after<E>(delay: Duration, tx: UnboundedSender<E>, event: E) -> JoinHandle<()>
where
    E: Send + 'static,
{
    tokio::spawn(async move {
        time::sleep(delay).await;
        let _ = tx.send(event);
    })
}

/// Runs `fut` and posts its result.
pub fn spawn_posting<E, Fut>(tx: UnboundedSender<E>, fut: Fut) -> JoinHandle<()>
where
    E: Send + 'static,
    Fut: Future<Output = E> + Send + 'static,
{
    tokio::spawn(async move {
        let event = fut.await;
        let _ = tx.send(event);
    })
}
