//! Helper for spawning named worker threads.
//!
//! Task names show up in logs and in the software watchdog's starvation
//! reports, so every long-running task gets one. Names are kept short in
//! the FreeRTOS tradition (16 characters) even though the host does not
//! enforce it.

use std::thread::JoinHandle;

/// Spawn a thread with a task name.
///
/// # Example
/// ```ignore
/// spawn_named("modem", || { /* ... */ });
/// ```
pub fn spawn_named<F, T>(name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("Failed to spawn thread")
}
