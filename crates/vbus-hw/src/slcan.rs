use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

use crate::diagnostics::{CanCounters, J1708Counters};
use crate::traits::DriverResult;
use crate::{
    BusDriver, BusInfo, CanFrame, CanId, CanFrameType, DriverError, DriverInterface,
    DriverSocket, HardwareFilter, Timestamp,
};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// SLCAN text protocol over serial (common on USB-CAN dongles).
pub struct SlcanDriver {
    path: String,
    serial_baud: u32,
}

impl SlcanDriver {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            serial_baud: 115_200,
        }
    }

    pub fn with_serial_baud(mut self, baud: u32) -> Self {
        self.serial_baud = baud;
        self
    }

    pub fn list_ports() -> DriverResult<Vec<BusInfo>> {
        let ports = serialport::available_ports().map_err(|e| DriverError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let driver = match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial",
                    // Still include other serial ports; user can pick
                    _ => "serial",
                };
                BusInfo {
                    name: p.port_name,
                    driver: driver.to_string(),
                }
            })
            .collect())
    }
}

impl BusDriver for SlcanDriver {
    type Interface = SlcanInterface;

    fn new_interface(&self) -> DriverResult<SlcanInterface> {
        Ok(SlcanInterface {
            path: self.path.clone(),
            serial_baud: self.serial_baud,
            bitrate: SlcanBitrate::B500k,
            listen_only: true,
            port: None,
            filters: Vec::new(),
        })
    }
}

/// The serial port is opened by `create`; until then setters only record values.
pub struct SlcanInterface {
    path: String,
    serial_baud: u32,
    bitrate: SlcanBitrate,
    listen_only: bool,
    port: Option<SharedPort>,
    filters: Vec<HardwareFilter>,
}

fn lock_port(port: &SharedPort) -> DriverResult<MutexGuard<'_, Box<dyn SerialPort>>> {
    port.lock()
        .map_err(|_| DriverError::Io("serial port lock poisoned".into()))
}

fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> DriverResult<()> {
    port.write_all(cmd)
        .map_err(|e| DriverError::Io(e.to_string()))
}

/// Close the channel, program the bitrate and reopen in the requested mode.
fn reopen_channel(port: &SharedPort, bitrate: SlcanBitrate, listen_only: bool) -> DriverResult<()> {
    let mut guard = lock_port(port)?;
    // Closing an already closed channel only draws a BEL from the adapter
    let _ = write_cmd(&mut **guard, b"C\r");
    write_cmd(&mut **guard, &[b'S', bitrate.code(), b'\r'])?;
    let mode: &[u8] = if listen_only { b"L\r" } else { b"O\r" };
    write_cmd(&mut **guard, mode)
}

impl DriverInterface for SlcanInterface {
    type Socket = SlcanSocket;

    fn set_bitrate(&mut self, kbps: u32) -> DriverResult<()> {
        self.bitrate = SlcanBitrate::from_kbps(kbps)
            .ok_or(DriverError::Unsupported("bitrate has no SLCAN code"))?;
        match &self.port {
            Some(port) => reopen_channel(port, self.bitrate, self.listen_only),
            None => Ok(()),
        }
    }

    fn set_listening_mode(&mut self, listen_only: bool) -> DriverResult<()> {
        self.listen_only = listen_only;
        match &self.port {
            Some(port) => reopen_channel(port, self.bitrate, self.listen_only),
            None => Ok(()),
        }
    }

    fn create(&mut self, listen_only: bool) -> DriverResult<()> {
        if self.port.is_some() {
            return Err(DriverError::Rejected("interface already created".into()));
        }
        let port = serialport::new(&self.path, self.serial_baud)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| DriverError::Io(e.to_string()))?;
        let port: SharedPort = Arc::new(Mutex::new(port));
        self.listen_only = listen_only;
        reopen_channel(&port, self.bitrate, listen_only)?;
        self.port = Some(port);
        Ok(())
    }

    fn set_filters(&mut self, filters: &[HardwareFilter]) -> DriverResult<()> {
        // SLCAN has no standard acceptance filter command; sockets enforce these
        self.filters = filters.to_vec();
        Ok(())
    }

    fn remove(&mut self) -> DriverResult<()> {
        match self.port.take() {
            Some(port) => {
                let mut guard = lock_port(&port)?;
                write_cmd(&mut **guard, b"C\r")
            }
            None => Ok(()),
        }
    }

    fn create_socket(&mut self) -> DriverResult<Option<SlcanSocket>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| DriverError::Io("interface not created".into()))?;
        Ok(Some(SlcanSocket {
            port: Arc::clone(port),
            filters: self.filters.clone(),
            open: false,
            acc: Vec::with_capacity(64),
        }))
    }

    fn is_j1708_supported(&self) -> DriverResult<bool> {
        Ok(false)
    }

    fn can_info(&mut self) -> DriverResult<CanCounters> {
        Err(DriverError::Unsupported("slcan has no counter query"))
    }

    fn j1708_info(&mut self) -> DriverResult<J1708Counters> {
        Err(DriverError::Unsupported("slcan has no J1708"))
    }
}

pub struct SlcanSocket {
    port: SharedPort,
    filters: Vec<HardwareFilter>,
    open: bool,
    acc: Vec<u8>,
}

impl SlcanSocket {
    fn accepts(&self, id: CanId) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(id))
    }

    fn read_line(&mut self, timeout_ms: Option<u64>) -> DriverResult<Vec<u8>> {
        if let Some(line) = next_line(&mut self.acc) {
            return Ok(line);
        }
        let mut port = lock_port(&self.port)?;
        // The port is shared with other sockets; put its timeout back afterwards
        let previous = port.timeout();
        let overridden = match timeout_ms.map(Duration::from_millis) {
            Some(t) if t != previous => match port.set_timeout(t) {
                Ok(()) => true,
                Err(e) => {
                    warn!("unable to set serial read timeout to {t:?}: {e}");
                    false
                }
            },
            _ => false,
        };

        let mut buf = [0u8; 128];
        let result = loop {
            match port.read(&mut buf) {
                // Nothing arrived within the port timeout
                Ok(0) => break Err(DriverError::Timeout),
                Ok(n) => {
                    self.acc.extend_from_slice(&buf[..n]);
                    if let Some(line) = next_line(&mut self.acc) {
                        break Ok(line);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    break Err(DriverError::Timeout)
                }
                Err(e) => break Err(DriverError::Io(e.to_string())),
            }
        };

        if overridden {
            if let Err(e) = port.set_timeout(previous) {
                warn!("unable to restore serial read timeout to {previous:?}: {e}");
            }
        }
        result
    }
}

/// Error reply from the adapter. It has no CR after it.
const BEL: u8 = 0x07;

/// Pop the next non-empty CR-terminated line, dropping BEL replies so they
/// cannot end up in front of the following frame.
fn next_line(acc: &mut Vec<u8>) -> Option<Vec<u8>> {
    acc.retain(|&b| b != BEL);
    while let Some(pos) = acc.iter().position(|&b| b == b'\r') {
        let mut line: Vec<u8> = acc.drain(..=pos).collect();
        line.pop();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

impl DriverSocket for SlcanSocket {
    fn open(&mut self) -> DriverResult<()> {
        // The channel itself is opened by the interface
        self.open = true;
        Ok(())
    }

    fn discard_in_buffer(&mut self) -> DriverResult<()> {
        self.acc.clear();
        lock_port(&self.port)?
            .clear(ClearBuffer::Input)
            .map_err(|e| DriverError::Io(e.to_string()))
    }

    fn close(&mut self) -> DriverResult<()> {
        self.open = false;
        Ok(())
    }

    fn read(&mut self, timeout_ms: Option<u64>) -> DriverResult<CanFrame> {
        if !self.open {
            return Err(DriverError::Io("socket closed".into()));
        }
        loop {
            let line = self.read_line(timeout_ms)?;
            // Command acknowledgements ("z", "Z") and status replies are not frames
            if !matches!(line.first(), Some(b't' | b'T' | b'r' | b'R')) {
                continue;
            }
            let frame = parse_frame(&line)?;
            if self.accepts(frame.id) {
                return Ok(frame);
            }
        }
    }

    fn write(&mut self, frame: &CanFrame) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::Io("socket closed".into()));
        }
        let line = encode_frame(frame)?;
        let mut port = lock_port(&self.port)?;
        write_cmd(&mut **port, &line)
    }
}

fn encode_frame(frame: &CanFrame) -> DriverResult<Vec<u8>> {
    if frame.len > 8 {
        return Err(DriverError::InvalidFrame("dlc > 8"));
    }
    let mut out = Vec::with_capacity(32);
    let (header, id) = match (frame.id.is_extended(), frame.rtr) {
        (true, false) => (b'T', format!("{:08X}", frame.id.raw())),
        (true, true) => (b'R', format!("{:08X}", frame.id.raw())),
        (false, false) => (b't', format!("{:03X}", frame.id.raw())),
        (false, true) => (b'r', format!("{:03X}", frame.id.raw())),
    };
    out.push(header);
    out.extend_from_slice(id.as_bytes());
    out.push(b'0' + frame.len);
    if !frame.rtr {
        for b in frame.payload() {
            out.extend_from_slice(format!("{b:02X}").as_bytes());
        }
    }
    out.push(b'\r');
    Ok(out)
}

fn parse_hex_u32(bytes: &[u8]) -> DriverResult<u32> {
    let s = std::str::from_utf8(bytes).map_err(|_| DriverError::InvalidFrame("utf8"))?;
    u32::from_str_radix(s, 16).map_err(|_| DriverError::InvalidFrame("hex"))
}

fn parse_frame(line: &[u8]) -> DriverResult<CanFrame> {
    let kind = *line.first().ok_or(DriverError::InvalidFrame("empty"))?;
    let (frame_type, id_len, rtr) = match kind {
        b't' => (CanFrameType::Standard, 3, false),
        b'r' => (CanFrameType::Standard, 3, true),
        b'T' => (CanFrameType::Extended, 8, false),
        b'R' => (CanFrameType::Extended, 8, true),
        _ => return Err(DriverError::InvalidFrame("unknown header")),
    };
    if line.len() < 1 + id_len + 1 {
        return Err(DriverError::InvalidFrame("short header"));
    }
    let id = CanId::new(parse_hex_u32(&line[1..=id_len])?, frame_type)
        .ok_or(DriverError::InvalidFrame("id range"))?;
    let dlc = line[1 + id_len]
        .checked_sub(b'0')
        .filter(|d| *d <= 8)
        .ok_or(DriverError::InvalidFrame("dlc"))?;

    let mut data = [0u8; 8];
    if !rtr {
        let body = &line[2 + id_len..];
        if body.len() < usize::from(dlc) * 2 {
            return Err(DriverError::InvalidFrame("short data"));
        }
        for (i, pair) in body.chunks(2).take(usize::from(dlc)).enumerate() {
            data[i] = parse_hex_u32(pair)? as u8;
        }
    }
    Ok(CanFrame {
        id,
        len: dlc,
        data,
        rtr,
        timestamp: Some(Timestamp::now()),
    })
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn from_kbps(kbps: u32) -> Option<Self> {
        let b = match kbps {
            10 => SlcanBitrate::B10k,
            20 => SlcanBitrate::B20k,
            50 => SlcanBitrate::B50k,
            100 => SlcanBitrate::B100k,
            125 => SlcanBitrate::B125k,
            250 => SlcanBitrate::B250k,
            500 => SlcanBitrate::B500k,
            800 => SlcanBitrate::B800k,
            1000 => SlcanBitrate::B1M,
            _ => return None,
        };
        Some(b)
    }

    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{DataBits, FlowControl, Parity, StopBits};
    use std::collections::VecDeque;

    /// Serial port that replays scripted reads, then times out.
    struct ScriptedPort {
        reads: VecDeque<Vec<u8>>,
        timeout: Duration,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Err(std::io::ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SerialPort for ScriptedPort {
        fn name(&self) -> Option<String> {
            Some("scripted".into())
        }
        fn baud_rate(&self) -> serialport::Result<u32> {
            Ok(115_200)
        }
        fn data_bits(&self) -> serialport::Result<DataBits> {
            Ok(DataBits::Eight)
        }
        fn flow_control(&self) -> serialport::Result<FlowControl> {
            Ok(FlowControl::None)
        }
        fn parity(&self) -> serialport::Result<Parity> {
            Ok(Parity::None)
        }
        fn stop_bits(&self) -> serialport::Result<StopBits> {
            Ok(StopBits::One)
        }
        fn timeout(&self) -> Duration {
            self.timeout
        }
        fn set_baud_rate(&mut self, _: u32) -> serialport::Result<()> {
            Ok(())
        }
        fn set_data_bits(&mut self, _: DataBits) -> serialport::Result<()> {
            Ok(())
        }
        fn set_flow_control(&mut self, _: FlowControl) -> serialport::Result<()> {
            Ok(())
        }
        fn set_parity(&mut self, _: Parity) -> serialport::Result<()> {
            Ok(())
        }
        fn set_stop_bits(&mut self, _: StopBits) -> serialport::Result<()> {
            Ok(())
        }
        fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
            self.timeout = timeout;
            Ok(())
        }
        fn write_request_to_send(&mut self, _: bool) -> serialport::Result<()> {
            Ok(())
        }
        fn write_data_terminal_ready(&mut self, _: bool) -> serialport::Result<()> {
            Ok(())
        }
        fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
            Ok(true)
        }
        fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
            Ok(true)
        }
        fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }
        fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
            Ok(true)
        }
        fn bytes_to_read(&self) -> serialport::Result<u32> {
            Ok(0)
        }
        fn bytes_to_write(&self) -> serialport::Result<u32> {
            Ok(0)
        }
        fn clear(&self, _: ClearBuffer) -> serialport::Result<()> {
            Ok(())
        }
        fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
            Err(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                "scripted port cannot be cloned",
            ))
        }
        fn set_break(&self) -> serialport::Result<()> {
            Ok(())
        }
        fn clear_break(&self) -> serialport::Result<()> {
            Ok(())
        }
    }

    fn scripted_socket(reads: &[&[u8]]) -> (SlcanSocket, SharedPort) {
        let port: Box<dyn SerialPort> = Box::new(ScriptedPort {
            reads: reads.iter().map(|r| r.to_vec()).collect(),
            timeout: Duration::from_millis(200),
        });
        let port: SharedPort = Arc::new(Mutex::new(port));
        let sock = SlcanSocket {
            port: Arc::clone(&port),
            filters: Vec::new(),
            open: true,
            acc: Vec::new(),
        };
        (sock, port)
    }

    #[test]
    fn read_after_bel_reply_restores_port_timeout() {
        let (mut sock, port) = scripted_socket(&[b"\x07", b"z\r\x07t12", b"31AA\r"]);

        let frame = sock.read(Some(5)).unwrap();
        assert_eq!(frame.id, CanId::standard(0x123).unwrap());
        assert_eq!(frame.payload(), &[0xAA]);
        assert_eq!(port.lock().unwrap().timeout(), Duration::from_millis(200));

        assert_eq!(sock.read(Some(5)).unwrap_err(), DriverError::Timeout);
        assert_eq!(port.lock().unwrap().timeout(), Duration::from_millis(200));
    }

    #[test]
    fn bitrate_codes() {
        assert_eq!(SlcanBitrate::from_kbps(250).map(SlcanBitrate::code), Some(b'5'));
        assert_eq!(SlcanBitrate::from_kbps(1000).map(SlcanBitrate::code), Some(b'8'));
        assert!(SlcanBitrate::from_kbps(333).is_none());
    }

    #[test]
    fn parse_standard_and_extended() {
        let f = parse_frame(b"t1233AABBCC").unwrap();
        assert_eq!(f.id, CanId::standard(0x123).unwrap());
        assert_eq!(f.payload(), &[0xAA, 0xBB, 0xCC]);

        let f = parse_frame(b"T18FEF1002DEAD").unwrap();
        assert!(f.id.is_extended());
        assert_eq!(f.id.raw(), 0x18FE_F100);
        assert_eq!(f.payload(), &[0xDE, 0xAD]);

        let f = parse_frame(b"r7DF8").unwrap();
        assert!(f.rtr);
        assert_eq!(f.len, 8);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_frame(b"").is_err());
        assert!(parse_frame(b"x123").is_err());
        assert!(parse_frame(b"t12").is_err());
        assert!(parse_frame(b"t1239").is_err());
        assert!(parse_frame(b"t1232AA").is_err());
        assert!(parse_frame(b"t8001AA").is_err());
    }

    #[test]
    fn bel_replies_do_not_swallow_frames() {
        let mut acc = b"\x07t1231AA\r\rz\r\x07".to_vec();
        assert_eq!(next_line(&mut acc), Some(b"t1231AA".to_vec()));
        assert_eq!(next_line(&mut acc), Some(b"z".to_vec()));
        assert_eq!(next_line(&mut acc), None);
        assert!(acc.is_empty());

        acc.extend_from_slice(b"T18FEF1001");
        assert_eq!(next_line(&mut acc), None);
        acc.extend_from_slice(b"42\r");
        let line = next_line(&mut acc).unwrap();
        assert_eq!(parse_frame(&line).unwrap().payload(), &[0x42]);
    }

    #[test]
    fn encode_matches_parse() {
        let id = CanId::extended(0x18FE_F100).unwrap();
        let frame = CanFrame::new(id, &[0x01, 0xFF]).unwrap();
        let line = encode_frame(&frame).unwrap();
        assert_eq!(line, b"T18FEF100201FF\r".to_vec());
        let back = parse_frame(&line[..line.len() - 1]).unwrap();
        assert_eq!(back.id, id);
        assert_eq!(back.payload(), frame.payload());
    }
}
