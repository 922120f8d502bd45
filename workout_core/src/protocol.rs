//! Binary wire protocol of the cable machine.
//!
//! Outbound commands are fixed-size little-endian buffers whose first byte is the
//! opcode. Configure and echo-control frames carry a layout version in byte 1.
//!
//! | Command   | Opcode | Size |
//! |-----------|--------|------|
//! | Configure | `0x04` | 32   |
//! | Start     | `0x03` | 4    |
//! | Stop      | `0x05` | 4    |
//! | Echo      | `0x4E` | 16   |
//!
//! Inbound rep notifications come in two shapes: the current 24-byte frame with
//! ROM counters and range boundaries, and the 8-byte legacy frame with only the
//! top/bottom edge counters. Status notifications are a 16-bit flag mask; bits we
//! do not know are kept in `raw` and otherwise ignored.

use crate::types::{EchoLevel, TelemetrySample, WorkoutMode, WorkoutParameters};
use crate::{Error, Result};

pub const LAYOUT_VERSION: u8 = 1;

pub const OPCODE_START: u8 = 0x03;
pub const OPCODE_CONFIGURE: u8 = 0x04;
pub const OPCODE_STOP: u8 = 0x05;
pub const OPCODE_ECHO: u8 = 0x4E;

pub const CONFIGURE_LEN: usize = 32;
pub const CONTROL_LEN: usize = 4;
pub const ECHO_LEN: usize = 16;
pub const REP_CURRENT_LEN: usize = 24;
pub const REP_LEGACY_LEN: usize = 8;
pub const STATUS_LEN: usize = 2;
pub const MONITOR_LEN: usize = 28;

pub const MAX_ECCENTRIC_PCT: u16 = 150;

/// Target-reps byte that marks an AMRAP set in the echo frame
const ECHO_AMRAP_REPS: u8 = 0xFF;

const FLAG_AMRAP: u8 = 1 << 0;
const FLAG_JUST_LIFT: u8 = 1 << 1;
const FLAG_STALL_DETECTION: u8 = 1 << 2;
const FLAG_AUTO_START: u8 = 1 << 3;
const FLAG_AUTO_STOP: u8 = 1 << 4;
const FLAG_STOP_AT_TOP: u8 = 1 << 5;

const STATUS_ROM_OUTSIDE_HIGH: u16 = 1 << 0;
const STATUS_ROM_OUTSIDE_LOW: u16 = 1 << 1;
const STATUS_ROM_UNLOAD_ACTIVE: u16 = 1 << 2;
const STATUS_DELOAD_OCCURRED: u16 = 1 << 3;
const STATUS_DELOAD_WARNING: u16 = 1 << 4;
const STATUS_SPOTTER_ACTIVE: u16 = 1 << 5;

// ============================================================================
// Outbound commands
// ============================================================================

/// Echo-mode control payload
#[derive(Clone, Debug, PartialEq)]
pub struct EchoControl {
    pub level: EchoLevel,
    pub warmup_reps: u8,
    /// `None` for AMRAP
    pub target_reps: Option<u8>,
    pub eccentric_load_pct: u16,
}

impl EchoControl {
    pub fn from_params(params: &WorkoutParameters) -> Self {
        Self {
            level: params.echo_level,
            warmup_reps: params.warmup_reps,
            target_reps: if params.is_amrap {
                None
            } else {
                Some(params.target_reps)
            },
            eccentric_load_pct: params.eccentric_load_pct,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Configure(WorkoutParameters),
    Start,
    Stop,
    Echo(EchoControl),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Configure(_) => "configure",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Echo(_) => "echo",
        }
    }
}

/// Encode a command into its wire buffer
pub fn encode(command: &Command) -> Result<Vec<u8>> {
    match command {
        Command::Configure(params) => encode_configure(params).map(|b| b.to_vec()),
        Command::Start => Ok(control_frame(OPCODE_START).to_vec()),
        Command::Stop => Ok(control_frame(OPCODE_STOP).to_vec()),
        Command::Echo(echo) => encode_echo(echo).map(|b| b.to_vec()),
    }
}

/// Decode an outbound command buffer (used by loopback transports and tooling)
pub fn decode(bytes: &[u8]) -> Result<Command> {
    let opcode = *bytes
        .first()
        .ok_or_else(|| Error::Protocol("empty command frame".into()))?;
    match opcode {
        OPCODE_CONFIGURE => decode_configure(bytes).map(Command::Configure),
        OPCODE_START => {
            expect_len(bytes, CONTROL_LEN, "start")?;
            Ok(Command::Start)
        }
        OPCODE_STOP => {
            expect_len(bytes, CONTROL_LEN, "stop")?;
            Ok(Command::Stop)
        }
        OPCODE_ECHO => decode_echo(bytes).map(Command::Echo),
        other => Err(Error::Protocol(format!("unknown opcode 0x{other:02X}"))),
    }
}

fn control_frame(opcode: u8) -> [u8; CONTROL_LEN] {
    [opcode, 0, 0, 0]
}

fn validate_params(params: &WorkoutParameters) -> Result<()> {
    if !params.weight_per_cable_kg.is_finite() || params.weight_per_cable_kg < 0.0 {
        return Err(Error::Protocol(format!(
            "invalid weight {}",
            params.weight_per_cable_kg
        )));
    }
    if !params.progression_kg.is_finite() {
        return Err(Error::Protocol("progression must be finite".into()));
    }
    if params.eccentric_load_pct > MAX_ECCENTRIC_PCT {
        return Err(Error::Protocol(format!(
            "eccentric load {}% exceeds {}%",
            params.eccentric_load_pct, MAX_ECCENTRIC_PCT
        )));
    }
    Ok(())
}

pub fn encode_configure(params: &WorkoutParameters) -> Result<[u8; CONFIGURE_LEN]> {
    validate_params(params)?;

    let mut flags = 0u8;
    for (set, bit) in [
        (params.is_amrap, FLAG_AMRAP),
        (params.just_lift, FLAG_JUST_LIFT),
        (params.stall_detection, FLAG_STALL_DETECTION),
        (params.auto_start, FLAG_AUTO_START),
        (params.auto_stop, FLAG_AUTO_STOP),
        (params.stop_at_top, FLAG_STOP_AT_TOP),
    ] {
        if set {
            flags |= bit;
        }
    }

    let mut buf = [0u8; CONFIGURE_LEN];
    buf[0] = OPCODE_CONFIGURE;
    buf[1] = LAYOUT_VERSION;
    buf[2] = params.mode.code();
    buf[3] = flags;
    buf[4] = params.warmup_reps;
    buf[5] = params.target_reps;
    buf[6] = params.echo_level.code();
    buf[8..12].copy_from_slice(&params.weight_per_cable_kg.to_le_bytes());
    buf[12..16].copy_from_slice(&params.progression_kg.to_le_bytes());
    buf[16..18].copy_from_slice(&params.eccentric_load_pct.to_le_bytes());
    buf[18..20].copy_from_slice(&params.duration_secs.to_le_bytes());
    Ok(buf)
}

pub fn decode_configure(bytes: &[u8]) -> Result<WorkoutParameters> {
    expect_len(bytes, CONFIGURE_LEN, "configure")?;
    if bytes[0] != OPCODE_CONFIGURE {
        return Err(Error::Protocol(format!(
            "expected configure opcode, got 0x{:02X}",
            bytes[0]
        )));
    }
    check_version(bytes[1])?;

    let mode = WorkoutMode::from_code(bytes[2])
        .ok_or_else(|| Error::Protocol(format!("unknown mode {}", bytes[2])))?;
    let echo_level = EchoLevel::from_code(bytes[6])
        .ok_or_else(|| Error::Protocol(format!("unknown echo level {}", bytes[6])))?;
    let flags = bytes[3];

    Ok(WorkoutParameters {
        mode,
        target_reps: bytes[5],
        is_amrap: flags & FLAG_AMRAP != 0,
        warmup_reps: bytes[4],
        weight_per_cable_kg: read_f32(bytes, 8),
        progression_kg: read_f32(bytes, 12),
        echo_level,
        eccentric_load_pct: read_u16(bytes, 16),
        stall_detection: flags & FLAG_STALL_DETECTION != 0,
        auto_start: flags & FLAG_AUTO_START != 0,
        auto_stop: flags & FLAG_AUTO_STOP != 0,
        just_lift: flags & FLAG_JUST_LIFT != 0,
        stop_at_top: flags & FLAG_STOP_AT_TOP != 0,
        duration_secs: read_u16(bytes, 18),
    })
}

pub fn encode_echo(echo: &EchoControl) -> Result<[u8; ECHO_LEN]> {
    if echo.eccentric_load_pct > MAX_ECCENTRIC_PCT {
        return Err(Error::Protocol(format!(
            "eccentric load {}% exceeds {}%",
            echo.eccentric_load_pct, MAX_ECCENTRIC_PCT
        )));
    }
    if echo.target_reps == Some(ECHO_AMRAP_REPS) {
        return Err(Error::Protocol(
            "target reps 255 is reserved for AMRAP".into(),
        ));
    }

    let mut buf = [0u8; ECHO_LEN];
    buf[0] = OPCODE_ECHO;
    buf[1] = LAYOUT_VERSION;
    buf[2] = echo.level.code();
    buf[3] = echo.warmup_reps;
    buf[4] = echo.target_reps.unwrap_or(ECHO_AMRAP_REPS);
    buf[6..8].copy_from_slice(&echo.eccentric_load_pct.to_le_bytes());
    Ok(buf)
}

pub fn decode_echo(bytes: &[u8]) -> Result<EchoControl> {
    expect_len(bytes, ECHO_LEN, "echo")?;
    check_version(bytes[1])?;
    let level = EchoLevel::from_code(bytes[2])
        .ok_or_else(|| Error::Protocol(format!("unknown echo level {}", bytes[2])))?;
    Ok(EchoControl {
        level,
        warmup_reps: bytes[3],
        target_reps: (bytes[4] != ECHO_AMRAP_REPS).then_some(bytes[4]),
        eccentric_load_pct: read_u16(bytes, 6),
    })
}

// ============================================================================
// Inbound notifications
// ============================================================================

/// ROM counters and boundaries only present in the current format
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RomReport {
    pub range_top: f32,
    pub range_bottom: f32,
    pub rom_count: u16,
    pub rom_total: u16,
    pub set_count: u16,
    pub set_total: u16,
}

impl RomReport {
    /// The machine considers the set finished
    pub fn is_set_complete(&self) -> bool {
        self.set_total > 0 && self.set_count >= self.set_total
    }
}

/// A decoded rep notification; `rom` is `None` for legacy frames
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RepNotification {
    pub up_counter: u32,
    pub down_counter: u32,
    pub rom: Option<RomReport>,
}

impl RepNotification {
    pub fn is_legacy(&self) -> bool {
        self.rom.is_none()
    }
}

/// Named status flags decoded from the machine's status mask
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub raw: u16,
    pub rom_outside_high: bool,
    pub rom_outside_low: bool,
    pub rom_unload_active: bool,
    pub deload_occurred: bool,
    pub deload_warning: bool,
    pub spotter_active: bool,
}

impl StatusFlags {
    pub fn from_bits(raw: u16) -> Self {
        Self {
            raw,
            rom_outside_high: raw & STATUS_ROM_OUTSIDE_HIGH != 0,
            rom_outside_low: raw & STATUS_ROM_OUTSIDE_LOW != 0,
            rom_unload_active: raw & STATUS_ROM_UNLOAD_ACTIVE != 0,
            deload_occurred: raw & STATUS_DELOAD_OCCURRED != 0,
            deload_warning: raw & STATUS_DELOAD_WARNING != 0,
            spotter_active: raw & STATUS_SPOTTER_ACTIVE != 0,
        }
    }
}

/// A raw frame from the machine's notification characteristic
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Rep { payload: Vec<u8>, legacy: bool },
    Status(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Notification {
    Rep(RepNotification),
    Status(StatusFlags),
}

pub fn decode_inbound(frame: &InboundFrame) -> Result<Notification> {
    match frame {
        InboundFrame::Rep { payload, legacy } => {
            decode_rep_notification(payload, *legacy).map(Notification::Rep)
        }
        InboundFrame::Status(payload) => decode_status(payload).map(Notification::Status),
    }
}

/// Decode a rep notification, falling back to the legacy shape when needed
pub fn decode_rep_notification(bytes: &[u8], legacy: bool) -> Result<RepNotification> {
    if bytes.len() < REP_LEGACY_LEN {
        return Err(Error::Protocol(format!(
            "rep notification too short: {} bytes",
            bytes.len()
        )));
    }

    let up_counter = read_u32(bytes, 0);
    let down_counter = read_u32(bytes, 4);

    if legacy {
        return Ok(RepNotification {
            up_counter,
            down_counter,
            rom: None,
        });
    }
    if bytes.len() < REP_CURRENT_LEN {
        tracing::debug!(
            "Rep notification of {} bytes lacks ROM fields, decoding as legacy",
            bytes.len()
        );
        return Ok(RepNotification {
            up_counter,
            down_counter,
            rom: None,
        });
    }

    Ok(RepNotification {
        up_counter,
        down_counter,
        rom: Some(RomReport {
            range_top: read_f32(bytes, 8),
            range_bottom: read_f32(bytes, 12),
            rom_count: read_u16(bytes, 16),
            rom_total: read_u16(bytes, 18),
            set_count: read_u16(bytes, 20),
            set_total: read_u16(bytes, 22),
        }),
    })
}

pub fn encode_rep_notification(notification: &RepNotification) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REP_CURRENT_LEN);
    buf.extend_from_slice(&notification.up_counter.to_le_bytes());
    buf.extend_from_slice(&notification.down_counter.to_le_bytes());
    if let Some(rom) = notification.rom {
        buf.extend_from_slice(&rom.range_top.to_le_bytes());
        buf.extend_from_slice(&rom.range_bottom.to_le_bytes());
        buf.extend_from_slice(&rom.rom_count.to_le_bytes());
        buf.extend_from_slice(&rom.rom_total.to_le_bytes());
        buf.extend_from_slice(&rom.set_count.to_le_bytes());
        buf.extend_from_slice(&rom.set_total.to_le_bytes());
    }
    buf
}

pub fn decode_status(bytes: &[u8]) -> Result<StatusFlags> {
    if bytes.len() < STATUS_LEN {
        return Err(Error::Protocol(format!(
            "status notification too short: {} bytes",
            bytes.len()
        )));
    }
    Ok(StatusFlags::from_bits(read_u16(bytes, 0)))
}

pub fn encode_status(flags: &StatusFlags) -> Vec<u8> {
    flags.raw.to_le_bytes().to_vec()
}

// ============================================================================
// Monitor (telemetry) frames
// ============================================================================

pub fn decode_monitor(bytes: &[u8]) -> Result<TelemetrySample> {
    expect_len(bytes, MONITOR_LEN, "monitor")?;
    Ok(TelemetrySample {
        timestamp_ms: read_u32(bytes, 0) as u64,
        position_a: read_f32(bytes, 4),
        position_b: read_f32(bytes, 8),
        velocity_a: read_f32(bytes, 12),
        velocity_b: read_f32(bytes, 16),
        load_a: read_f32(bytes, 20),
        load_b: read_f32(bytes, 24),
    })
}

/// Timestamps wrap at u32 milliseconds on the wire
pub fn encode_monitor(sample: &TelemetrySample) -> [u8; MONITOR_LEN] {
    let mut buf = [0u8; MONITOR_LEN];
    buf[0..4].copy_from_slice(&(sample.timestamp_ms as u32).to_le_bytes());
    for (i, v) in [
        sample.position_a,
        sample.position_b,
        sample.velocity_a,
        sample.velocity_b,
        sample.load_a,
        sample.load_b,
    ]
    .iter()
    .enumerate()
    {
        let at = 4 + i * 4;
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
    buf
}

// ============================================================================
// Helpers
// ============================================================================

fn expect_len(bytes: &[u8], len: usize, what: &str) -> Result<()> {
    if bytes.len() != len {
        return Err(Error::Protocol(format!(
            "{what} frame must be {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

fn check_version(version: u8) -> Result<()> {
    if version != LAYOUT_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported layout version {version}"
        )));
    }
    Ok(())
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
