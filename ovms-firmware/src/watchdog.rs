//! Software task watchdog for monitoring thread health.
//!
//! Long-running tasks register a handle and feed it from their main loop.
//! A monitor thread reports tasks that stop feeding; it never kills
//! anything, a starved task is a bug to fix, not a condition to mask.

use log::{debug, error};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// A task is reported once it has not fed for this long.
const STARVATION_TIMEOUT: Duration = Duration::from_secs(10);

struct Registry {
    users: Mutex<HashMap<u32, (String, Instant)>>,
    next_id: AtomicU32,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        crate::thread_util::spawn_named("watchdog", monitor_task);
        Registry {
            users: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    })
}

fn monitor_task() {
    loop {
        std::thread::sleep(Duration::from_secs(5));
        let users = registry().users.lock().unwrap();
        for (name, last_fed) in users.values() {
            if last_fed.elapsed() > STARVATION_TIMEOUT {
                error!(
                    "Watchdog: task '{}' has not fed for {}s",
                    name,
                    last_fed.elapsed().as_secs()
                );
            }
        }
    }
}

/// A handle to a registered watchdog user. Automatically unregisters on drop.
pub struct WatchdogHandle {
    id: u32,
    name: String,
}

impl WatchdogHandle {
    /// Register a new watchdog user with the given name.
    ///
    /// The name should be descriptive (e.g. `"wifi_mgr"`, `"poller"`).
    pub fn register(name: &str) -> Self {
        let reg = registry();
        let id = reg.next_id.fetch_add(1, Ordering::Relaxed);
        reg.users
            .lock()
            .unwrap()
            .insert(id, (name.to_string(), Instant::now()));
        debug!("Watchdog: registered user '{name}'");
        Self {
            id,
            name: name.to_string(),
        }
    }

    /// Feed the watchdog to mark the task alive.
    pub fn feed(&self) {
        if let Some(entry) = registry().users.lock().unwrap().get_mut(&self.id) {
            entry.1 = Instant::now();
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        debug!("Watchdog: unregistering user '{}'", self.name);
        registry().users.lock().unwrap().remove(&self.id);
    }
}
