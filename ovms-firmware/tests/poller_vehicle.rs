//! Poller + decoder integration against a scripted set of ECUs.
//!
//! The CAN bus is an in-memory channel pair; a responder thread plays the
//! ECUs behind the gateway: single-frame UDS replies, one multi-frame
//! record (first frame, flow control, consecutive frames), negative
//! responses for everything unknown.

use ovms_firmware::can::{CanBus, CanError, CanFrame};
use ovms_firmware::events::EventBus;
use ovms_firmware::metrics::{register_standard, standard, Metrics};
use ovms_firmware::poller::{Poller, PollerHandle, PollerOptions, PollerState};
use ovms_firmware::vehicle;
use ovms_isotp_lib::{encode_single, segment, Addressing};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tester address placed in extended-addressing responses.
const TESTER: u8 = 0xF1;

struct MockCan {
    to_poller: Mutex<Receiver<CanFrame>>,
    from_poller: Mutex<Sender<CanFrame>>,
}

impl CanBus for MockCan {
    fn transmit(&self, frame: &CanFrame) -> Result<(), CanError> {
        self.from_poller
            .lock()
            .unwrap()
            .send(frame.clone())
            .map_err(|_| CanError::Disconnected)
    }

    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError> {
        match self.to_poller.lock().unwrap().recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CanError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CanError::Disconnected),
        }
    }
}

/// ECU behavior switches, shared with the responder thread.
struct EcuScript {
    /// Respond at all (cleared to simulate a sleeping vehicle).
    responding: AtomicBool,
    /// Charge status lamp value to report.
    charge_led: AtomicU8,
    /// Break the consecutive-frame sequence of multi-frame replies.
    drop_consecutive: AtomicBool,
    /// A flow control frame was received for the multi-frame reply.
    flow_control_seen: AtomicBool,
}

impl EcuScript {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responding: AtomicBool::new(true),
            charge_led: AtomicU8::new(6),
            drop_consecutive: AtomicBool::new(false),
            flow_control_seen: AtomicBool::new(false),
        })
    }
}

/// Play the ECUs: parse each request, produce the scripted reply.
fn responder(
    script: &Arc<EcuScript>,
    from_poller: &Receiver<CanFrame>,
    to_poller: &Sender<CanFrame>,
) {
    while let Ok(request) = from_poller.recv() {
        if !script.responding.load(Ordering::Relaxed) {
            continue;
        }
        let data = &request.data;
        // extended addressing single frame: [ecu, pci, 0x22, pid hi, pid lo]
        if data.len() < 5 || data[1] != 0x03 || data[2] != 0x22 {
            continue;
        }
        let ecu = data[0];
        let rx_id = 0x600 + u32::from(ecu);
        let pid = u16::from_be_bytes([data[3], data[4]]);

        let reply = |payload: &[u8]| {
            encode_single(Addressing::Extended { address: TESTER }, payload).unwrap()
        };
        let send = |data: ovms_isotp_lib::CanData| {
            let _ = to_poller.send(CanFrame {
                bus: 1,
                id: rx_id,
                extended: false,
                data,
            });
        };

        match pid {
            0xDD68 => send(reply(&[0x62, 0xDD, 0x68, 0x8C, 0xA0])), // 360.00 V
            0xDDBC => send(reply(&[0x62, 0xDD, 0xBC, 0x03, 0x20])), // 80.0 %
            0xDB99 => send(reply(&[0x62, 0xDB, 0x99, 0x00])),       // steering alive
            0xDEF3 => {
                let led = script.charge_led.load(Ordering::Relaxed);
                send(reply(&[0x62, 0xDE, 0xF3, led]));
            }
            0xDDC0 => {
                // 16 temperature bytes: min, max, avg, cells...
                let mut payload = vec![0x62, 0xDD, 0xC0, 10, 30, 20];
                payload.extend_from_slice(&[15; 13]);
                let frames =
                    segment(Addressing::Extended { address: TESTER }, &payload).unwrap();
                send(frames[0].clone());

                // wait for the flow control frame before continuing
                match from_poller.recv_timeout(Duration::from_secs(2)) {
                    Ok(fc) if fc.data.len() >= 2 && fc.data[1] >> 4 == 3 => {
                        script.flow_control_seen.store(true, Ordering::Relaxed);
                    }
                    _ => continue,
                }
                for (index, frame) in frames[1..].iter().enumerate() {
                    if script.drop_consecutive.load(Ordering::Relaxed) && index == 1 {
                        continue;
                    }
                    send(frame.clone());
                }
            }
            _ => send(reply(&[0x7F, 0x22, 0x31])), // requestOutOfRange
        }
    }
}

struct Harness {
    metrics: Arc<Metrics>,
    script: Arc<EcuScript>,
    background_tx: Sender<CanFrame>,
    handle: PollerHandle,
}

fn start_harness() -> Harness {
    let metrics = Metrics::new();
    register_standard(&metrics);
    let events = EventBus::new();

    let (to_poller_tx, to_poller_rx) = mpsc::channel();
    let (from_poller_tx, from_poller_rx) = mpsc::channel();
    let bus = Arc::new(MockCan {
        to_poller: Mutex::new(to_poller_rx),
        from_poller: Mutex::new(from_poller_tx),
    });

    let script = EcuScript::new();
    {
        let script = script.clone();
        let to_poller_tx = to_poller_tx.clone();
        std::thread::spawn(move || responder(&script, &from_poller_rx, &to_poller_tx));
    }

    let decoder = vehicle::create("EDRV", &metrics, events.clone()).unwrap();
    let options = PollerOptions {
        tick_interval: Duration::from_millis(25),
        io_timeout: Duration::from_millis(5),
        response_timeout: Duration::from_millis(200),
        isotp_timeout: Duration::from_millis(60),
        throttling: 50,
        separation_time: Duration::from_millis(1),
    };
    let handle = Poller::new(bus, decoder, events, options).start();

    Harness {
        metrics,
        script,
        background_tx: to_poller_tx,
        handle,
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn background_frame() -> CanFrame {
    CanFrame::new(1, 0x2A0, false, &[0x01, 0x02])
}

#[test]
fn full_poll_cycle() {
    let harness = start_harness();

    // nothing happens while the bus is quiet
    assert_eq!(harness.handle.state(), PollerState::Shutdown);

    // any traffic wakes the poller
    harness.background_tx.send(background_frame()).unwrap();
    wait_until("ALIVE", || harness.handle.state() == PollerState::Alive);

    // single-frame records decode into metrics
    let metrics = &harness.metrics;
    wait_until("battery voltage", || {
        metrics.find(standard::V_BAT_VOLTAGE).unwrap().as_float() == 360.0
    });
    wait_until("SoC", || {
        metrics.find(standard::V_BAT_SOC).unwrap().as_float() == 80.0
    });

    // the multi-frame temperature record went through flow control
    wait_until("battery temperature", || {
        metrics.find(standard::V_BAT_TEMP).unwrap().as_float() == 20.0
    });
    assert!(harness.script.flow_control_seen.load(Ordering::Relaxed));

    // power steering replies drive the READY heuristic
    wait_until("READY", || harness.handle.state() == PollerState::Ready);

    // charge lamp switches the poller into CHARGING
    harness.script.charge_led.store(3, Ordering::Relaxed);
    wait_until("CHARGING", || {
        harness.handle.state() == PollerState::Charging
    });
    assert_eq!(
        metrics.find("xed.v.charge.ledstate").unwrap().as_int(),
        3
    );
    assert!(metrics
        .find(standard::V_CHARGE_CHARGING)
        .unwrap()
        .as_bool());

    let status = harness.handle.status();
    assert!(status.contains("EDRV"), "status: {status}");
    harness.handle.shutdown();
}

#[test]
fn silence_shuts_the_poller_down() {
    let harness = start_harness();
    harness.background_tx.send(background_frame()).unwrap();
    wait_until("ALIVE", || harness.handle.state() == PollerState::Alive);

    // vehicle goes quiet: no responses, no background traffic
    harness.script.responding.store(false, Ordering::Relaxed);
    wait_until("SHUTDOWN", || {
        harness.handle.state() == PollerState::Shutdown
    });

    // any frame brings it back
    harness.background_tx.send(background_frame()).unwrap();
    wait_until("ALIVE again", || {
        harness.handle.state() == PollerState::Alive
    });
    harness.handle.shutdown();
}

#[test]
fn broken_consecutive_sequence_delivers_nothing() {
    let harness = start_harness();
    harness.script.drop_consecutive.store(true, Ordering::Relaxed);
    harness.background_tx.send(background_frame()).unwrap();
    wait_until("ALIVE", || harness.handle.state() == PollerState::Alive);

    // the single-frame records still arrive
    let metrics = &harness.metrics;
    wait_until("battery voltage", || {
        metrics.find(standard::V_BAT_VOLTAGE).unwrap().as_float() == 360.0
    });

    // the broken multi-frame record must never partially deliver
    std::thread::sleep(Duration::from_millis(600));
    assert!(!metrics.find(standard::V_BAT_TEMP).unwrap().is_defined());
    harness.handle.shutdown();
}
