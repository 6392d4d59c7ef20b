use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

use vbus_hw as hw;
use vbus_hw::{BusDriver, BusKind, InterfaceLifecycle};
use vbus_state::{DriverBackend, PersistedState, StateKey, StoredValue, VbsConfig};

#[derive(Parser, Debug)]
#[command(
    name = "vbs",
    version,
    about = "Vehicle bus service CLI",
    disable_help_subcommand = true
)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the persisted state file from the configuration
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Slcan,
}

impl From<DriverBackend> for Backend {
    fn from(b: DriverBackend) -> Self {
        match b {
            DriverBackend::Mock => Backend::Mock,
            DriverBackend::Slcan => Backend::Slcan,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ValueKind {
    Int,
    Long,
    String,
    Bool,
    Bytes,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List candidate bus devices
    Ports {
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },
    /// Bring the CAN interface up, read frames, and tear it down again
    Up {
        #[arg(long, value_enum)]
        backend: Option<Backend>,
        /// Serial device for the slcan backend
        #[arg(long)]
        port: Option<String>,
        /// Bitrate in kbps (default: confirmed, then persisted, then configured)
        #[arg(long)]
        bitrate: Option<u32>,
        /// Bring the interface up without driving the bus
        #[arg(long, action = ArgAction::SetTrue)]
        listen_only: bool,
        /// Filter as IDS/MASK[/std|ext], e.g. 0x100,0x200/0x7FF/std (repeatable)
        #[arg(long)]
        filter: Vec<String>,
        /// Discard buffered input after opening the socket
        #[arg(long, action = ArgAction::SetTrue)]
        discard: bool,
        /// Number of frames to read before tearing down
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Per-frame receive timeout in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
        /// Persist the bitrate as confirmed when frames were received
        #[arg(long, action = ArgAction::SetTrue)]
        confirm: bool,
        /// Print Prometheus metrics when done
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Report whether the hardware has a J1708 transceiver
    J1708 {
        #[arg(long, value_enum)]
        backend: Option<Backend>,
        #[arg(long)]
        port: Option<String>,
    },
    /// Read hardware counters without bringing the bus up
    Diag {
        #[arg(long, value_enum)]
        backend: Option<Backend>,
        #[arg(long)]
        port: Option<String>,
        /// Emit JSON instead of text
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Inspect or edit persisted flags
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Print every stored flag
    List,
    /// Read a flag (number or name, e.g. 207 or can_confirmed_bitrate)
    Get {
        key: StateKey,
        #[arg(long, value_enum, default_value_t = ValueKind::Int)]
        kind: ValueKind,
    },
    /// Write a flag
    Set {
        key: StateKey,
        value: String,
        #[arg(long, value_enum, default_value_t = ValueKind::Int)]
        kind: ValueKind,
    },
    /// Delete a single flag
    Remove { key: StateKey },
    /// Erase all flags (factory defaults)
    Clear,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => vbus_state::load_config(path)?,
        None => VbsConfig::default(),
    };
    if let Some(state) = cli.state {
        cfg.state_path = state;
    }

    match cli.command {
        Commands::Ports { backend } => list_ports(backend.unwrap_or(cfg.can.backend.into())),
        Commands::Up {
            backend,
            port,
            bitrate,
            listen_only,
            filter,
            discard,
            count,
            timeout_ms,
            confirm,
            metrics,
        } => {
            let state = open_state(&cfg)?;
            let plan = plan_bring_up(&cfg, &state, bitrate, listen_only, &filter, discard)?;
            let opts = ReadOpts {
                count,
                timeout_ms,
                confirm,
                metrics,
            };
            match backend.unwrap_or(cfg.can.backend.into()) {
                Backend::Mock => {
                    let heartbeat =
                        hw::CanId::standard(0x700).context("mock heartbeat id out of range")?;
                    let driver = hw::MockDriver::new().with_heartbeat(heartbeat);
                    run_up(driver, &cfg, &state, &plan, &opts)
                }
                Backend::Slcan => {
                    let port = port.unwrap_or_else(|| cfg.can.port.clone());
                    run_up(hw::SlcanDriver::new(port), &cfg, &state, &plan, &opts)
                }
            }
        }
        Commands::J1708 { backend, port } => {
            let supported = match backend.unwrap_or(cfg.can.backend.into()) {
                Backend::Mock => hw::is_j1708_supported(&hw::MockDriver::new()),
                Backend::Slcan => hw::is_j1708_supported(&hw::SlcanDriver::new(
                    port.unwrap_or_else(|| cfg.can.port.clone()),
                )),
            };
            println!("j1708 supported: {supported}");
            if cfg.j1708.enabled && !supported {
                warn!("J1708 enabled in configuration but not supported by this unit");
            }
            Ok(())
        }
        Commands::Diag {
            backend,
            port,
            json,
        } => {
            let snap = match backend.unwrap_or(cfg.can.backend.into()) {
                Backend::Mock => hw::diagnostics::capture_standalone(&hw::MockDriver::new()),
                Backend::Slcan => hw::diagnostics::capture_standalone(&hw::SlcanDriver::new(
                    port.unwrap_or_else(|| cfg.can.port.clone()),
                )),
            };
            print_snapshot(&snap, json)
        }
        Commands::State { action } => state_command(&open_state(&cfg)?, action),
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn open_state(cfg: &VbsConfig) -> Result<PersistedState> {
    PersistedState::open(&cfg.state_path)
        .with_context(|| format!("opening state: {}", cfg.state_path.display()))
}

fn list_ports(backend: Backend) -> Result<()> {
    let ports = match backend {
        Backend::Mock => hw::MockDriver::list(),
        Backend::Slcan => hw::SlcanDriver::list_ports()?,
    };
    for bus in ports {
        println!("{}\t{}", bus.name, bus.driver);
    }
    Ok(())
}

/// Bring-up parameters chosen from flags, persisted state and configuration.
#[derive(Debug)]
struct BringUpPlan {
    bitrate_kbps: u32,
    listen_only: bool,
    filters: Option<Vec<hw::HardwareFilter>>,
    discard: bool,
}

struct ReadOpts {
    count: u32,
    timeout_ms: u64,
    confirm: bool,
    metrics: bool,
}

fn plan_bring_up(
    cfg: &VbsConfig,
    state: &PersistedState,
    bitrate: Option<u32>,
    listen_only: bool,
    filter_args: &[String],
    discard: bool,
) -> Result<BringUpPlan> {
    let confirmed = positive(state.read_int(StateKey::CAN_CONFIRMED_BITRATE));
    let persisted = positive(state.read_int(StateKey::CAN_BITRATE));
    if state.read_bool(StateKey::FLAG_CAN_AUTODETECT) {
        info!("bitrate autodetect flag is set");
    }

    let (bitrate_kbps, source) = match (bitrate, confirmed, persisted) {
        (Some(b), _, _) => (b, "argument"),
        (None, Some(b), _) => (b, "confirmed"),
        (None, None, Some(b)) => (b, "persisted"),
        (None, None, None) => (cfg.can.bitrate_kbps, "config"),
    };
    // A confirmed bitrate is known to carry traffic, so no listen-only probing
    let listen_only = listen_only
        || (source != "confirmed"
            && (cfg.can.listen_only || state.read_bool(StateKey::FLAG_CAN_LISTENONLY)));

    let filters = if filter_args.is_empty() {
        cfg.can.hardware_filters()?
    } else {
        Some(
            filter_args
                .iter()
                .map(|s| parse_filter(s))
                .collect::<Result<Vec<_>>>()?,
        )
    };

    info!("bring-up plan: {bitrate_kbps}kb ({source}) listen_only={listen_only}");
    Ok(BringUpPlan {
        bitrate_kbps,
        listen_only,
        filters,
        discard: discard || cfg.can.discard_on_open,
    })
}

fn positive(v: i32) -> Option<u32> {
    u32::try_from(v).ok().filter(|v| *v > 0)
}

fn parse_filter(s: &str) -> Result<hw::HardwareFilter> {
    let mut parts = s.split('/');
    let ids = parts
        .next()
        .filter(|p| !p.is_empty())
        .with_context(|| format!("filter '{s}' has no ids"))?;
    let mask = parts
        .next()
        .with_context(|| format!("filter '{s}' has no mask"))?;
    let frame_type = match parts.next().map(str::trim) {
        None | Some("std") | Some("standard") => hw::CanFrameType::Standard,
        Some("ext") | Some("extended") => hw::CanFrameType::Extended,
        Some(other) => anyhow::bail!("unknown frame type '{other}' in filter '{s}'"),
    };
    let ids = ids
        .split(',')
        .map(|id| vbus_state::parse_number(id).with_context(|| format!("invalid id: {id}")))
        .collect::<Result<Vec<_>>>()?;
    let mask = vbus_state::parse_number(mask).with_context(|| format!("invalid mask: {mask}"))?;
    hw::HardwareFilter::new(ids, mask, frame_type)
        .with_context(|| format!("filter '{s}' out of range"))
}

fn run_up<D: BusDriver>(
    driver: D,
    cfg: &VbsConfig,
    state: &PersistedState,
    plan: &BringUpPlan,
    opts: &ReadOpts,
) -> Result<()> {
    let hub = hw::MetricsHub::new().map_err(anyhow::Error::msg)?;
    let mut lifecycle =
        InterfaceLifecycle::new(driver, BusKind::Can).with_diagnostics(cfg.can.diagnostics);

    let outcome = lifecycle.bring_up(plan.listen_only, plan.bitrate_kbps, plan.filters.as_deref());
    hub.record_bring_up(&outcome);
    let mut handle = outcome.context("CAN bring-up failed")?;
    if let Some(snap) = lifecycle.last_snapshot() {
        hub.record_snapshot(snap);
    }
    let mode = if handle.listen_only() {
        "listen-only"
    } else {
        "read-write"
    };
    println!("up: {}kb {mode}", handle.bitrate_kbps());

    let received = read_frames(&mut handle, plan.discard, opts);
    lifecycle.teardown(&mut handle);
    let received = received?;
    println!("received {received} frame(s)");

    if opts.confirm && received > 0 {
        let bitrate = i32::try_from(plan.bitrate_kbps).context("bitrate out of range")?;
        state
            .write_int(StateKey::CAN_CONFIRMED_BITRATE, bitrate)
            .context("confirmed bitrate was not persisted")?;
        println!("confirmed bitrate {}kb persisted", plan.bitrate_kbps);
    }
    if opts.metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}

fn read_frames<I: hw::DriverInterface>(
    handle: &mut hw::InterfaceHandle<I>,
    discard: bool,
    opts: &ReadOpts,
) -> Result<u32> {
    let mut sock = handle.create_socket()?;
    match sock.open(discard) {
        Ok(()) => {}
        // The socket is open; stale frames may show up first
        Err(e @ hw::BusError::BufferDiscardFailed(_)) => warn!("{e}"),
        Err(e) => return Err(e.into()),
    }
    let mut received = 0;
    for _ in 0..opts.count {
        match sock.read_can(Some(opts.timeout_ms)) {
            Ok(frame) => {
                print_frame(&frame);
                received += 1;
            }
            Err(hw::BusError::Transfer(hw::DriverError::Timeout)) => {
                eprintln!("no frame within {} ms", opts.timeout_ms);
            }
            Err(e) => {
                sock.close();
                return Err(e.into());
            }
        }
    }
    sock.close();
    Ok(received)
}

fn print_frame(f: &hw::CanFrame) {
    let ts = f
        .timestamp
        .map(|t| {
            t.0.format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "".into())
        })
        .unwrap_or_default();
    let data_s = f
        .payload()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{id}\tlen={len}\t{data_s}\t{ts}", id = f.id, len = f.len);
}

fn print_snapshot(snap: &hw::CounterSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snap)?);
        return Ok(());
    }
    match &snap.can {
        Some(can) => {
            for (name, value) in can.fields() {
                println!("can.{name}\t{value}");
            }
        }
        None => println!("can\tunavailable"),
    }
    match &snap.j1708 {
        Some(j) => {
            for (name, value) in j.fields() {
                println!("j1708.{name}\t{value}");
            }
        }
        None => println!("j1708\tunavailable"),
    }
    Ok(())
}

fn state_command(state: &PersistedState, action: StateAction) -> Result<()> {
    match action {
        StateAction::List => {
            for key in state.keys() {
                match state.get(key) {
                    Some(StoredValue::Int(v)) => println!("{key}\tint\t{v}"),
                    Some(StoredValue::Long(v)) => println!("{key}\tlong\t{v}"),
                    Some(StoredValue::Text(v)) => println!("{key}\ttext\t{v}"),
                    None => {}
                }
            }
        }
        StateAction::Get { key, kind } => match kind {
            ValueKind::Int => println!("{}", state.read_int(key)),
            ValueKind::Long => println!("{}", state.read_long(key)),
            ValueKind::String => println!("{}", state.read_string(key)),
            ValueKind::Bool => println!("{}", state.read_bool(key)),
            ValueKind::Bytes => match state.read_bytes(key) {
                Some(bytes) => println!("{}", hex::encode_upper(bytes)),
                None => println!("(none)"),
            },
        },
        StateAction::Set { key, value, kind } => {
            match kind {
                ValueKind::Int => state.write_int(key, value.trim().parse()?)?,
                ValueKind::Long => state.write_long(key, value.trim().parse()?)?,
                ValueKind::String => state.write_string(key, &value)?,
                ValueKind::Bool => state.write_bool(key, parse_bool(&value)?)?,
                ValueKind::Bytes => {
                    let bytes = hex::decode(value.trim())
                        .with_context(|| format!("invalid hex: {value}"))?;
                    state.write_bytes(key, &bytes)?
                }
            }
            println!("{key} written");
        }
        StateAction::Remove { key } => {
            state.remove(key)?;
            println!("{key} removed");
        }
        StateAction::Clear => {
            state.clear_all()?;
            println!("state cleared");
        }
    }
    Ok(())
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => anyhow::bail!("not a boolean: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_argument_forms() {
        let f = parse_filter("0x100,0x200/0x7FF/std").unwrap();
        assert_eq!(f.ids(), &[0x100, 0x200]);
        assert_eq!(f.mask(), 0x7FF);
        let g = parse_filter("0x18FEF100/0x1FFFFF00/ext").unwrap();
        assert_eq!(g.frame_type(), hw::CanFrameType::Extended);
        assert!(parse_filter("0x100").is_err());
        assert!(parse_filter("/0x7FF").is_err());
        assert!(parse_filter("0x100/0x7FF/fd").is_err());
        assert!(parse_filter("0x800/0x7FF").is_err());
    }

    #[test]
    fn plan_prefers_confirmed_bitrate_read_write() {
        let cfg = VbsConfig::default();
        let state = PersistedState::in_memory();
        state.write_int(StateKey::CAN_BITRATE, 500).unwrap();
        state.write_bool(StateKey::FLAG_CAN_LISTENONLY, true).unwrap();

        let plan = plan_bring_up(&cfg, &state, None, false, &[], false).unwrap();
        assert_eq!(plan.bitrate_kbps, 500);
        assert!(plan.listen_only);

        state.write_int(StateKey::CAN_CONFIRMED_BITRATE, 250).unwrap();
        let plan = plan_bring_up(&cfg, &state, None, false, &[], false).unwrap();
        assert_eq!(plan.bitrate_kbps, 250);
        assert!(!plan.listen_only);

        let plan = plan_bring_up(&cfg, &state, Some(1000), true, &[], true).unwrap();
        assert_eq!(plan.bitrate_kbps, 1000);
        assert!(plan.listen_only);
        assert!(plan.discard);
        assert!(plan.filters.is_none());
    }

    #[test]
    fn run_up_persists_confirmed_bitrate() {
        let cfg = VbsConfig::default();
        let state = PersistedState::in_memory();
        let driver = hw::MockDriver::new();
        let id = hw::CanId::standard(0x123).unwrap();
        driver.push_can_frame(hw::CanFrame::new(id, &[1, 2]).unwrap());
        let plan = BringUpPlan {
            bitrate_kbps: 250,
            listen_only: true,
            filters: None,
            discard: false,
        };
        let opts = ReadOpts {
            count: 2,
            timeout_ms: 1,
            confirm: true,
            metrics: false,
        };

        run_up(driver.clone(), &cfg, &state, &plan, &opts).unwrap();
        assert_eq!(state.read_int(StateKey::CAN_CONFIRMED_BITRATE), 250);
        assert_eq!(driver.live_interfaces(), 0);
    }

    #[test]
    fn parse_bool_forms() {
        assert!(parse_bool("On").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
