use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{SimError, World};
use crate::executor::MainThreadQueue;

/// The designated thread: the only place the [`World`] is touched.
///
/// Each tick drains the executor queue, then advances the world, then sleeps
/// until the next tick boundary.
pub struct SimulationThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<World>>,
}

impl SimulationThread {
    pub fn spawn(
        world: World,
        queue: MainThreadQueue<World>,
        tick: Duration,
    ) -> Result<Self, SimError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("simulation".into())
            .spawn(move || run(world, queue, tick, flag))
            .map_err(SimError::Spawn)?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop ticking and hand the world back. Submissions still queued resolve
    /// to `ExecutorError::Closed`.
    pub fn stop(mut self) -> Result<World, SimError> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| SimError::ThreadPanicked),
            None => Err(SimError::ThreadPanicked),
        }
    }
}

impl Drop for SimulationThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    mut world: World,
    mut queue: MainThreadQueue<World>,
    tick: Duration,
    stop: Arc<AtomicBool>,
) -> World {
    tracing::info!(tick_ms = tick.as_millis() as u64, "simulation thread started");
    let mut last = Instant::now();
    let mut next = last + tick;

    while !stop.load(Ordering::SeqCst) {
        let report = queue.run_pending(&mut world);
        if report.panicked > 0 {
            tracing::warn!(ran = report.ran, panicked = report.panicked, "main-thread jobs panicked");
        }

        let now = Instant::now();
        world.tick(now - last);
        last = now;

        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
            next += tick;
        } else {
            // Fell behind; don't try to catch up with a burst of ticks.
            next = now + tick;
        }
    }

    // Dropping the queue closes it for any submitter still waiting.
    drop(queue);
    tracing::info!("simulation thread stopped");
    world
}
