//! The top-level single-threaded I/O loop (section 4.H), grounded in the
//! teacher's `Connection::_f` task scaffold: a `tokio::spawn`ed loop
//! driven by `tokio::select!` against a kill channel the host can close
//! to stop the background task.
//!
//! When `Config::handle_io` is set the library drives a connection
//! itself via [`Driver::spawn`]; otherwise the host calls
//! [`Driver::step`] explicitly whenever it wants to advance one tick
//! (section 4.H step 4: the driver signals `Event::Io` and returns
//! control rather than looping on its own).

use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::result::QuicheResult;

use super::config::Event;
use super::connection::Connection;

/// Cadence at which the background loop advances timers and flushes
/// outgoing queues when no datagram wakes it first (section 4.H steps
/// 2-3). Real congestion control is out of scope (section 1); this is
/// just a coarse wakeup so the retransmit/give-up timers (section 5) are
/// serviced promptly.
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Owns the background task driving one connection's I/O loop, and the
/// kill switch used to stop it (section 5: cancellation is closed-form).
pub struct Driver {
    kill: Option<Sender<()>>,
}

impl Driver {
    pub fn new() -> Self {
        Self { kill: None }
    }

    /// Spawns the background task. `on_event` is invoked for every event
    /// the connection emits (section 6); the connection itself is handed
    /// back to the caller when the task stops, via the returned
    /// `JoinHandle`.
    pub fn spawn<F>(&mut self, mut connection: Connection, mut on_event: F) -> JoinHandle<Connection>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        self.kill = Some(kill_tx);

        tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = kill_rx.recv() => {
                        debug!("driver stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = connection.drive_tick(Instant::now()).await {
                            warn!(%err, "drive_tick failed");
                        }
                        for event in connection.drain_events() {
                            on_event(event);
                        }
                    }
                }
            }
            connection
        })
    }

    /// Signals the spawned task to stop and waits for it to observe the
    /// signal. A no-op if nothing was spawned, or if a prior call already
    /// consumed the kill switch.
    pub async fn stop(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(()).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.kill.is_some()
    }

    /// Drives exactly one tick of `connection` when the host owns the
    /// loop (`Config::handle_io == false`): intake, timers, flush
    /// (section 4.H steps 1-3), then return control to the caller.
    pub async fn step(connection: &mut Connection, now: Instant) -> QuicheResult<()> {
        connection.drive_tick(now).await
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::config::Config;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn step_advances_a_client_through_its_first_handshake_tick() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Connection::new_client(local, peer, &config).await.unwrap();
        client.start_client();

        Driver::step(&mut client, Instant::now()).await.unwrap();

        assert!(client.next_transmit_packet_number() > 0);
    }

    #[tokio::test]
    async fn spawn_drives_ticks_until_stopped() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Connection::new_client(local, peer, &config).await.unwrap();
        client.start_client();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);

        let mut driver = Driver::new();
        assert!(!driver.is_running());
        let handle = driver.spawn(client, move |event| {
            events_clone.lock().unwrap().push(event);
        });
        assert!(driver.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        driver.stop().await;
        let client = handle.await.unwrap();

        assert!(client.next_transmit_packet_number() > 0);
    }
}
