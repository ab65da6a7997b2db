//! Mock cellular modem for testing the modem subsystem
//!
//! Speaks plain AT commands until `AT+CMUX=0`, then switches to GSM 07.10
//! basic mode: answers SABM with UA, carries AT conversations on the mux
//! channels, accepts a data call on the data channel and streams NMEA
//! sentences on channel 1 once GPS is enabled.
//!
//! Usage: cargo run -p ovms-mock-modem-server
//! Then point the module at tcp:127.0.0.1:35600

use clap::Parser;
use ovms_gsmmux_lib::{fcs, Mux, DISC, EA, PF, SABM, SOF, UA, UIH};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "ovms-mock-modem")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 35600)]
    port: u16,
}

fn main() {
    let args = Args::parse();
    println!("Mock modem starting on 0.0.0.0:{}...", args.port);
    let listener =
        TcpListener::bind(("0.0.0.0", args.port)).expect("Failed to bind");
    println!("Mock modem ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                println!("Module connected: {:?}", stream.peer_addr());
                std::thread::spawn(|| handle_client(stream));
            }
            Err(e) => eprintln!("Connection error: {e}"),
        }
    }
}

fn handle_client(mut stream: TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .ok();
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                println!("Module disconnected");
                return;
            }
            Ok(_) => {
                let ch = byte[0];
                if ch == b'\r' || ch == b'\n' {
                    let command = String::from_utf8_lossy(&buffer).trim().to_uppercase();
                    buffer.clear();
                    if command.is_empty() {
                        continue;
                    }
                    println!("RX: {command}");
                    let response = at_response(&command);
                    println!("TX: {}", response.escape_debug());
                    if stream.write_all(response.as_bytes()).is_err() {
                        return;
                    }
                    if command == "AT+CMUX=0" {
                        println!("Entering mux mode");
                        mux_loop(&mut stream);
                        return;
                    }
                } else {
                    buffer.push(ch);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                eprintln!("Read error: {e}");
                return;
            }
        }
    }
}

fn at_response(command: &str) -> String {
    match command {
        "ATI" => {
            "\r\nManufacturer: SIMCOM INCORPORATED\r\nModel: SIMCOM_SIM7600G\r\nRevision: LE20B04SIM7600M22\r\n\r\nOK\r\n"
                .to_string()
        }
        "AT+CPOF" => "\r\nNORMAL POWER DOWN\r\n".to_string(),
        _ => "\r\nOK\r\n".to_string(),
    }
}

/// Decoder for frames arriving from the module.
struct FrameParser {
    frame: Vec<u8>,
    len: usize,
    ipos: usize,
    more_len: bool,
}

struct ModuleFrame {
    channel: u8,
    control: u8,
    payload: Vec<u8>,
}

impl FrameParser {
    fn new() -> Self {
        Self {
            frame: Vec::new(),
            len: 0,
            ipos: 0,
            more_len: false,
        }
    }

    fn feed(&mut self, b: u8) -> Option<ModuleFrame> {
        if self.frame.is_empty() && b != SOF {
            return None;
        }
        if self.frame.len() == 1 && b == SOF {
            return None;
        }
        self.frame.push(b);
        match self.frame.len() {
            4 => {
                self.more_len = b & EA == 0;
                self.len = (b >> 1) as usize;
                if self.more_len {
                    self.len += 4 + 3;
                    self.ipos = 5;
                } else {
                    self.len += 4 + 2;
                    self.ipos = 4;
                }
            }
            5 if self.more_len => {
                self.len += (b as usize) << 7;
                self.more_len = false;
            }
            n if n > 4 && n == self.len => {
                let frame = std::mem::take(&mut self.frame);
                self.len = 0;
                if b != SOF {
                    eprintln!("Frame error: EOF mismatch");
                    return None;
                }
                let expected = 0xFF - fcs::add_block(fcs::INIT, &frame[1..self.ipos]);
                if expected != frame[frame.len() - 2] {
                    eprintln!("Frame error: FCS mismatch");
                    return None;
                }
                return Some(ModuleFrame {
                    channel: frame[1] >> 2,
                    control: frame[2],
                    payload: frame[self.ipos..frame.len() - 2].to_vec(),
                });
            }
            _ => {}
        }
        None
    }
}

/// UA response accepting a channel open.
fn ua_frame(channel: u8) -> Vec<u8> {
    let addr = (channel << 2) | EA | 0x02;
    let mut ua = vec![SOF, addr, UA + PF, EA, 0x00, SOF];
    ua[4] = fcs::calc(&ua[1..4]);
    ua
}

fn nmea_checksum(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}\r\n")
}

struct MuxState {
    encoder: Mux,
    gps_enabled: bool,
}

impl MuxState {
    fn send_lines(&mut self, stream: &mut TcpStream, channel: u8, lines: &[&str]) {
        for line in lines {
            let payload = format!("\r\n{line}\r\n");
            let frame = self.encoder.tx(channel, payload.as_bytes());
            if stream.write_all(&frame).is_err() {
                return;
            }
        }
    }

    fn handle_command(&mut self, stream: &mut TcpStream, channel: u8, command: &str) {
        println!("RX ch{channel}: {command}");
        if command.contains("+CGREG?") {
            self.send_lines(
                stream,
                channel,
                &["+CREG: 0,1", "+CGREG: 0,1", "+CEREG: 0,1", "OK"],
            );
        } else if command.contains("+CCLK?") {
            self.send_lines(
                stream,
                channel,
                &[
                    "+CREG: 0,1",
                    "+CCLK: \"24/11/23,12:23:10+04\"",
                    "+CSQ: 17,99",
                    "+COPS: 0,0,\"MockNet\",7",
                    "OK",
                ],
            );
        } else if command.starts_with("ATD*99") {
            self.send_lines(stream, channel, &["CONNECT"]);
        } else if command.contains("+CGPSNMEA") {
            self.gps_enabled = true;
            self.send_lines(stream, channel, &["OK"]);
        } else if command.contains("+CGPS=0") {
            self.gps_enabled = false;
            self.send_lines(stream, channel, &["OK"]);
        } else if command.contains("+CPOF") {
            self.send_lines(stream, channel, &["NORMAL POWER DOWN"]);
        } else {
            self.send_lines(stream, channel, &["OK"]);
        }
    }

    fn send_nmea(&mut self, stream: &mut TcpStream) {
        let rmc = nmea_checksum("GPRMC,122310.00,A,5207.6493,N,00445.2725,E,10.0,83.5,231124,,,A");
        let gns = nmea_checksum("GNGNS,122310.00,5207.6493,N,00445.2725,E,AAN,12,0.9,5.2,45.0,,");
        for sentence in [rmc, gns] {
            let frame = self.encoder.tx(1, sentence.as_bytes());
            if stream.write_all(&frame).is_err() {
                return;
            }
        }
    }
}

fn mux_loop(stream: &mut TcpStream) {
    let mut parser = FrameParser::new();
    // encoder only; channel state is tracked by the module side
    let mut state = MuxState {
        encoder: Mux::new(4, 2),
        gps_enabled: false,
    };
    let mut line_buffers: Vec<Vec<u8>> = vec![Vec::new(); 6];
    let mut last_nmea = Instant::now();
    let mut byte = [0u8; 1];

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                println!("Module disconnected");
                return;
            }
            Ok(_) => {
                if let Some(frame) = parser.feed(byte[0]) {
                    match frame.control {
                        c if c == SABM + PF => {
                            println!("SABM on channel {}", frame.channel);
                            let ua = ua_frame(frame.channel);
                            if stream.write_all(&ua).is_err() {
                                return;
                            }
                        }
                        c if c == DISC + PF => {
                            println!("DISC on channel {}", frame.channel);
                        }
                        c if c == UIH + PF => {
                            let buffer = &mut line_buffers[frame.channel as usize % 6];
                            for &b in &frame.payload {
                                if b == b'\r' || b == b'\n' {
                                    if !buffer.is_empty() {
                                        let command = String::from_utf8_lossy(buffer)
                                            .trim()
                                            .to_uppercase();
                                        buffer.clear();
                                        state.handle_command(stream, frame.channel, &command);
                                    }
                                } else {
                                    buffer.push(b);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                eprintln!("Read error: {e}");
                return;
            }
        }

        if state.gps_enabled && last_nmea.elapsed() >= Duration::from_secs(1) {
            last_nmea = Instant::now();
            state.send_nmea(stream);
        }
    }
}
