/*!
 * Periodic maintenance timer
 *
 * One background thread wakes about once a second and invokes every
 * registered handler in registration order. Handlers drive idle-connection
 * reaping and cache expiry; they are expected not to block for long, though
 * no deadline is enforced.
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, RwLock};

pub type TickHandler = Arc<dyn Fn() + Send + Sync>;

const TICK_PERIOD: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(100);

pub struct Timer {
    handlers: Arc<RwLock<Vec<(u64, TickHandler)>>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Register a handler; returns an id usable with `remove_handler`.
    pub fn add_handler(&self, handler: TickHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().push((id, handler));
        id
    }

    pub fn remove_handler(&self, id: u64) {
        self.handlers.write().retain(|(hid, _)| *hid != id);
    }

    /// Spawn the tick thread. Must be called after mount setup so handlers
    /// never run against half-initialized subsystems.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let handlers = self.handlers.clone();
        let handle = thread::Builder::new()
            .name("irodsfs-timer".into())
            .spawn(move || {
                debug!("timer thread running");
                while running.load(Ordering::SeqCst) {
                    let mut slept = Duration::ZERO;
                    while slept < TICK_PERIOD && running.load(Ordering::SeqCst) {
                        thread::sleep(STOP_POLL);
                        slept += STOP_POLL;
                    }
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    for (_, handler) in handlers.read().iter() {
                        handler();
                    }
                }
                debug!("timer thread stopped");
            })
            .expect("failed to spawn timer thread");
        *worker = Some(handle);
    }

    /// Stop the tick thread and join it.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_fire_in_order() {
        let timer = Timer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            timer.add_handler(Arc::new(move || seen.lock().push(tag)));
        }

        timer.start();
        // one tick takes about a second
        thread::sleep(Duration::from_millis(1500));
        timer.stop();

        let seen = seen.lock();
        assert!(seen.len() >= 2);
        assert_eq!(seen[0], "first");
        assert_eq!(seen[1], "second");
    }

    #[test]
    fn test_removed_handler_does_not_fire() {
        let timer = Timer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let id = {
            let hits = hits.clone();
            timer.add_handler(Arc::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
        };
        timer.remove_handler(id);

        timer.start();
        thread::sleep(Duration::from_millis(1200));
        timer.stop();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_without_start() {
        let timer = Timer::new();
        timer.stop();
    }
}
