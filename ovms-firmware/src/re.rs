//! Reverse engineering tools: CAN frame recorder and change analyser.
//!
//! While running, every received frame is folded into a keyed map. Keys
//! are `can<bus>/<id>`; ids inside the configured OBD-II windows get the
//! request service and PID appended so polls and their responses separate
//! cleanly, and ids with a key-byte mask append the selected data bytes
//! (multiplexed frames).
//!
//! Record mode tracks which bytes of each id ever change; discover mode
//! additionally marks bytes that change for the first time since the
//! mode was entered, which is what you watch while pressing buttons.

use enumset::{enum_set, EnumSet, EnumSetType};
use indexmap::IndexMap;
use log::info;
use ovms_capture_format::{CaptureHeader, FrameRecord};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::can::CanFrame;
use crate::monotonic_secs;
use crate::poller::PollerHandle;
use crate::thread_util;
use crate::watchdog::WatchdogHandle;

#[derive(EnumSetType, Debug)]
pub enum ReFlag {
    /// Key excluded from listings.
    Ignore,
    /// Something in this id changed since the last clear.
    Changed,
    /// Newly changed since discover mode was entered.
    Discovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReMode {
    Record,
    Discover,
}

/// Accumulated state for one key.
pub struct ReRecord {
    pub last: CanFrame,
    pub rxcount: u32,
    pub flags: EnumSet<ReFlag>,
    /// Bitmask of data bytes that changed at least once.
    pub changed_bytes: u8,
    /// Bitmask of data bytes discovered in discover mode.
    pub discovered_bytes: u8,
}

struct ReInner {
    records: IndexMap<String, ReRecord>,
    mode: ReMode,
    obdii_std: Option<(u32, u32)>,
    obdii_ext: Option<(u32, u32)>,
    key_bytes: HashMap<u32, u8>,
    started: u64,
    finished: u64,
}

impl ReInner {
    /// Derive the map key for a frame (bus, id, OBD-II request, key bytes).
    fn get_key(&self, frame: &CanFrame) -> String {
        let mut key = if frame.extended {
            format!("can{}/{:08x}", frame.bus, frame.id)
        } else {
            format!("can{}/{:03x}", frame.bus, frame.id)
        };

        let in_std = !frame.extended
            && self
                .obdii_std
                .is_some_and(|(min, max)| frame.id >= min && frame.id <= max);
        let in_ext = frame.extended
            && self
                .obdii_ext
                .is_some_and(|(min, max)| frame.id >= min && frame.id <= max);
        if in_std || in_ext {
            // It is an OBDII request
            if frame.data.first().copied().unwrap_or(0) > 8 {
                // Probably just a continuation frame. Ignore it.
                return key;
            }
            if frame.data.len() >= 3 {
                let mode = frame.data[1];
                let pid8 = u32::from(frame.data[2]);
                let pid16 = (pid8 << 8) | u32::from(frame.data.get(3).copied().unwrap_or(0));
                let req = if mode > 0x4a {
                    format!(":O2Pm{}:{}", mode - 0x40, pid16)
                } else if mode > 0x40 {
                    format!(":O2Pm{}:{}", mode - 0x40, pid8)
                } else if mode > 0x0a {
                    format!(":O2Qm{mode}:{pid16}")
                } else {
                    format!(":O2Qm{mode}:{pid8}")
                };
                key.push_str(&req);
            }
            return key;
        }

        if let Some(&bytes) = self.key_bytes.get(&frame.id) {
            for j in 0..8 {
                if bytes & (1 << j) != 0 {
                    if let Some(&b) = frame.data.get(j) {
                        key.push_str(&format!(":{b:02x}"));
                    }
                }
            }
        }
        key
    }

    fn process(&mut self, frame: &CanFrame) {
        if self.records.is_empty() {
            self.started = monotonic_secs();
        }
        let key = self.get_key(frame);
        let mode = self.mode;
        match self.records.get_mut(&key) {
            None => {
                let mut record = ReRecord {
                    last: frame.clone(),
                    rxcount: 1,
                    // Mark the whole ID as changed
                    flags: enum_set!(ReFlag::Changed),
                    changed_bytes: 0xFF,
                    discovered_bytes: 0,
                };
                if mode == ReMode::Discover {
                    record.flags |= ReFlag::Discovered;
                    record.discovered_bytes = 0xFF;
                }
                self.records.insert(key, record);
            }
            Some(record) => {
                match mode {
                    ReMode::Record => {
                        for (k, (&old, &new)) in
                            record.last.data.iter().zip(frame.data.iter()).enumerate()
                        {
                            if old != new {
                                record.changed_bytes |= 1 << k;
                                record.flags |= ReFlag::Changed;
                            }
                        }
                    }
                    ReMode::Discover => {
                        for (j, (&old, &new)) in
                            record.last.data.iter().zip(frame.data.iter()).enumerate()
                        {
                            if record.changed_bytes & (1 << j) == 0 && old != new {
                                record.changed_bytes |= 1 << j;
                                record.discovered_bytes |= 1 << j;
                                record.flags |= ReFlag::Changed | ReFlag::Discovered;
                            }
                        }
                    }
                }
                record.last = frame.clone();
                record.rxcount += 1;
            }
        }
        self.finished = monotonic_secs();
    }
}

/// The RE tools engine; commands come from the shell, frames from a
/// poller tap.
pub struct ReTools {
    inner: Mutex<ReInner>,
    running: AtomicBool,
}

impl Default for ReTools {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ReInner {
                records: IndexMap::new(),
                mode: ReMode::Record,
                obdii_std: None,
                obdii_ext: None,
                key_bytes: HashMap::new(),
                started: 0,
                finished: 0,
            }),
            running: AtomicBool::new(false),
        }
    }
}

impl ReTools {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start collecting: register a frame tap and spawn the analyser task.
    pub fn start(self: &Arc<Self>, poller: &PollerHandle) -> bool {
        if self.running.swap(true, Ordering::Relaxed) {
            return false;
        }
        let (tap_tx, tap_rx) = mpsc::channel();
        poller.add_tap(tap_tx);
        let tools = self.clone();
        thread_util::spawn_named("re_tools", move || tools.task(&tap_rx));
        info!("RE tools started");
        true
    }

    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::Relaxed) {
            return false;
        }
        info!("RE tools stopped");
        true
    }

    fn task(&self, rx: &Receiver<CanFrame>) {
        let watchdog = WatchdogHandle::register("re_tools");
        while self.running.load(Ordering::Relaxed) {
            watchdog.feed();
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(frame) => self.inner.lock().unwrap().process(&frame),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        // dropping the receiver detaches the poller tap
    }

    /// Feed one frame directly (tests and replays).
    pub fn process(&self, frame: &CanFrame) {
        self.inner.lock().unwrap().process(frame);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.clear();
        inner.started = monotonic_secs();
        inner.finished = inner.started;
    }

    pub fn set_mode(&self, mode: ReMode) {
        let mut inner = self.inner.lock().unwrap();
        if mode == ReMode::Discover {
            for record in inner.records.values_mut() {
                record.flags -= ReFlag::Discovered;
                record.discovered_bytes = 0;
            }
        }
        inner.mode = mode;
    }

    pub fn set_obdii_std(&self, min: u32, max: u32) {
        self.inner.lock().unwrap().obdii_std = Some((min, max));
    }

    pub fn set_obdii_ext(&self, min: u32, max: u32) {
        self.inner.lock().unwrap().obdii_ext = Some((min, max));
    }

    pub fn key_set(&self, id: u32, bytes: u8) {
        self.inner.lock().unwrap().key_bytes.insert(id, bytes);
    }

    pub fn key_clear(&self, id: u32) -> bool {
        self.inner.lock().unwrap().key_bytes.remove(&id).is_some()
    }

    /// List records matching `filter`; `which` restricts to changed or
    /// discovered entries.
    pub fn list(&self, filter: Option<&str>, which: Option<ReFlag>, out: &mut dyn Write) {
        let inner = self.inner.lock().unwrap();
        let mut tdiff_ms = inner.finished.saturating_sub(inner.started) * 1000;
        if tdiff_ms == 0 {
            tdiff_ms = 1000;
        }
        let _ = writeln!(out, "{:<24} {:>10} {:>6} last", "key", "records", "ms");
        for (key, record) in &inner.records {
            if record.flags.contains(ReFlag::Ignore) {
                continue;
            }
            if let Some(flag) = which {
                if !record.flags.contains(flag) {
                    continue;
                }
            }
            if let Some(filter) = filter {
                if !key.contains(filter) {
                    continue;
                }
            }
            let highlight = match which {
                Some(ReFlag::Discovered) => record.discovered_bytes,
                _ => record.changed_bytes,
            };
            let _ = writeln!(
                out,
                "{:<24} {:>10} {:>6} {}",
                key,
                record.rxcount,
                tdiff_ms / u64::from(record.rxcount),
                highlight_dump(&record.last.data, highlight)
            );
        }
    }

    pub fn status(&self, out: &mut dyn Write) {
        let inner = self.inner.lock().unwrap();
        let _ = writeln!(
            out,
            "RE tools {} ({} keys, {}s window, mode {:?})",
            if self.is_running() { "running" } else { "stopped" },
            inner.records.len(),
            inner.finished.saturating_sub(inner.started),
            inner.mode
        );
    }

    /// Write a capture snapshot: one record per key with its last frame.
    pub fn save(&self, path: &str) -> std::io::Result<u32> {
        let inner = self.inner.lock().unwrap();
        let mut body = Vec::new();
        let mut count = 0u32;
        for record in inner.records.values() {
            let frame = &record.last;
            let mut flags = 0;
            if frame.extended {
                flags |= FrameRecord::FLAG_EXTENDED;
            }
            body.extend_from_slice(
                &FrameRecord {
                    timestamp_ms: (inner.finished.saturating_sub(inner.started) * 1000) as u32,
                    bus: frame.bus,
                    flags,
                    id: frame.id,
                    data: frame.data.to_vec(),
                }
                .to_bytes(),
            );
            count += 1;
        }

        let mut header = CaptureHeader::new();
        header.record_count = count;
        header.data_length = body.len() as u32;
        header.set_firmware_version(env!("CARGO_PKG_VERSION"));

        let mut file = std::fs::File::create(path)?;
        file.write_all(&header.to_bytes())?;
        file.write_all(&body)?;
        Ok(count)
    }
}

/// Hex dump with changed bytes marked by a trailing `*`.
fn highlight_dump(data: &[u8], mask: u8) -> String {
    let mut out = String::new();
    for (k, &b) in data.iter().enumerate() {
        if k > 0 {
            out.push(' ');
        }
        out.push_str(&hex::encode([b]));
        if mask & (1 << k) != 0 {
            out.push('*');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(1, id, false, data)
    }

    #[test]
    fn plain_keys() {
        let tools = ReTools::default();
        tools.process(&frame(0x100, &[1, 2, 3]));
        tools.process(&CanFrame::new(2, 0x18DB33F1, true, &[1]));

        let inner = tools.inner.lock().unwrap();
        assert!(inner.records.contains_key("can1/100"));
        assert!(inner.records.contains_key("can2/18db33f1"));
    }

    #[test]
    fn obdii_window_keys() {
        let tools = ReTools::default();
        tools.set_obdii_std(0x700, 0x7FF);

        // mode 01 query, 8-bit pid
        tools.process(&frame(0x7DF, &[0x02, 0x01, 0x0C, 0, 0, 0, 0, 0]));
        // mode 22 query, 16-bit pid
        tools.process(&frame(0x7E0, &[0x03, 0x22, 0xDD, 0xBC, 0, 0, 0, 0]));
        // mode 41 response, 8-bit pid
        tools.process(&frame(0x7E8, &[0x04, 0x41, 0x0C, 0x1A, 0xF8, 0, 0, 0]));
        // continuation frame keeps the plain key
        tools.process(&frame(0x7E8, &[0x21, 1, 2, 3, 4, 5, 6, 7]));

        let inner = tools.inner.lock().unwrap();
        assert!(inner.records.contains_key("can1/7df:O2Qm1:12"));
        assert!(inner.records.contains_key("can1/7e0:O2Qm34:56764"));
        assert!(inner.records.contains_key("can1/7e8:O2Pm1:12"));
        assert!(inner.records.contains_key("can1/7e8"));
    }

    #[test]
    fn key_bytes_split_multiplexed_ids() {
        let tools = ReTools::default();
        tools.key_set(0x2F0, 0b0000_0001); // key on byte 1
        tools.process(&frame(0x2F0, &[0x10, 1]));
        tools.process(&frame(0x2F0, &[0x20, 2]));

        let inner = tools.inner.lock().unwrap();
        assert!(inner.records.contains_key("can1/2f0:10"));
        assert!(inner.records.contains_key("can1/2f0:20"));
        drop(inner);

        assert!(tools.key_clear(0x2F0));
        assert!(!tools.key_clear(0x2F0));
    }

    #[test]
    fn record_mode_tracks_changed_bytes() {
        let tools = ReTools::default();
        tools.process(&frame(0x100, &[1, 2, 3]));
        tools.process(&frame(0x100, &[1, 9, 3]));

        let inner = tools.inner.lock().unwrap();
        let record = &inner.records["can1/100"];
        assert_eq!(record.rxcount, 2);
        // new keys start fully marked; byte 1 changed again afterwards
        assert!(record.changed_bytes & 0b010 != 0);
        assert!(record.flags.contains(ReFlag::Changed));
    }

    #[test]
    fn discover_mode_marks_new_changes_only() {
        let tools = ReTools::default();
        tools.process(&frame(0x100, &[1, 2, 3]));
        tools.process(&frame(0x100, &[1, 2, 3]));

        // entering discover clears masks, then byte 2 changes
        {
            let mut inner = tools.inner.lock().unwrap();
            inner.records["can1/100"].changed_bytes = 0;
        }
        tools.set_mode(ReMode::Discover);
        tools.process(&frame(0x100, &[1, 2, 7]));

        let inner = tools.inner.lock().unwrap();
        let record = &inner.records["can1/100"];
        assert_eq!(record.discovered_bytes, 0b100);
        assert!(record.flags.contains(ReFlag::Discovered));
    }

    #[test]
    fn listing_filters() {
        let tools = ReTools::default();
        tools.process(&frame(0x100, &[1]));
        tools.process(&frame(0x200, &[2]));

        let mut out = Vec::new();
        tools.list(Some("100"), None, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("can1/100"));
        assert!(!text.contains("can1/200"));
    }

    #[test]
    fn save_snapshot() {
        let tools = ReTools::default();
        tools.process(&frame(0x100, &[1, 2, 3]));
        tools.process(&frame(0x200, &[4]));

        let path = std::env::temp_dir().join("ovms-re-test.rcap");
        let path = path.to_str().unwrap();
        let count = tools.save(path).unwrap();
        assert_eq!(count, 2);

        let bytes = std::fs::read(path).unwrap();
        let header = CaptureHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.record_count, 2);
        let (first, _) =
            FrameRecord::from_bytes(&bytes[ovms_capture_format::HEADER_SIZE..]).unwrap();
        assert_eq!(first.id, 0x100);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn highlight_marks_masked_bytes() {
        assert_eq!(highlight_dump(&[0xAA, 0xBB], 0b10), "aa bb*");
    }
}
