// params.rs
//
// Per-endpoint options and the `key=value,...` parameter string used by the
// port setup tooling.

use std::fmt;
use std::str::FromStr;

use crate::pair::ModemError;
use crate::signal::{PinLine, PinMap, PinSource};

/// Behaviour switches of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortOptions {
    /// Throttle transmission to the configured baud rate.
    pub emulate_baud_rate: bool,
    /// Drop data that does not fit the peer's buffer instead of holding the
    /// writer.
    pub emulate_overrun: bool,
    /// Refuse to open while the peer is closed.
    pub plug_in_mode: bool,
    /// Refuse a second open.
    pub exclusive_mode: bool,
    pub pins: PinMap,
}

fn parse_flag(key: &str, value: &str) -> Result<Option<bool>, ModemError> {
    match value {
        "yes" => Ok(Some(true)),
        "no" => Ok(Some(false)),
        "-" => Ok(None),
        _ => Err(ModemError::InvalidConfig(format!("{key}: expected yes, no or -, got {value:?}"))),
    }
}

fn parse_pin(key: &str, value: &str) -> Result<Option<PinSource>, ModemError> {
    if value == "-" {
        return Ok(None);
    }
    let (invert, name) = match value.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let line = match name {
        "rrts" => PinLine::RemoteRts,
        "rdtr" => PinLine::RemoteDtr,
        "ropen" => PinLine::RemoteOpen,
        "lrts" => PinLine::LocalRts,
        "ldtr" => PinLine::LocalDtr,
        "lopen" => PinLine::LocalOpen,
        "on" => PinLine::On,
        _ => return Err(ModemError::InvalidConfig(format!("{key}: unknown pin source {value:?}"))),
    };
    Ok(Some(PinSource { line, invert }))
}

impl FromStr for PortOptions {
    type Err = ModemError;

    /// Parse `emubr=yes,emuoverrun=no,plugin=no,exclusivemode=no,cts=rrts,...`.
    /// Keys may appear in any order and may be omitted; `-` keeps the default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = PortOptions::default();
        let defaults = PinMap::default();

        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| ModemError::InvalidConfig(format!("expected key=value, got {item:?}")))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_ascii_lowercase();

            match key.as_str() {
                "emubr" => options.emulate_baud_rate = parse_flag(&key, &value)?.unwrap_or(false),
                "emuoverrun" => options.emulate_overrun = parse_flag(&key, &value)?.unwrap_or(false),
                "plugin" => options.plug_in_mode = parse_flag(&key, &value)?.unwrap_or(false),
                "exclusivemode" => options.exclusive_mode = parse_flag(&key, &value)?.unwrap_or(false),
                "cts" => options.pins.cts = parse_pin(&key, &value)?.unwrap_or(defaults.cts),
                "dsr" => options.pins.dsr = parse_pin(&key, &value)?.unwrap_or(defaults.dsr),
                "dcd" => options.pins.dcd = parse_pin(&key, &value)?,
                "ri" => options.pins.ri = parse_pin(&key, &value)?.unwrap_or(defaults.ri),
                _ => return Err(ModemError::InvalidConfig(format!("unknown parameter {key:?}"))),
            }
        }
        Ok(options)
    }
}

struct Pin(PinSource);

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.invert {
            f.write_str("!")?;
        }
        f.write_str(match self.0.line {
            PinLine::RemoteRts => "rrts",
            PinLine::RemoteDtr => "rdtr",
            PinLine::RemoteOpen => "ropen",
            PinLine::LocalRts => "lrts",
            PinLine::LocalDtr => "ldtr",
            PinLine::LocalOpen => "lopen",
            PinLine::On => "on",
        })
    }
}

fn yes_no(on: bool) -> &'static str {
    if on {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for PortOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "emubr={},emuoverrun={},plugin={},exclusivemode={},cts={},dsr={},dcd=",
            yes_no(self.emulate_baud_rate),
            yes_no(self.emulate_overrun),
            yes_no(self.plug_in_mode),
            yes_no(self.exclusive_mode),
            Pin(self.pins.cts),
            Pin(self.pins.dsr),
        )?;
        match self.pins.dcd {
            Some(dcd) => write!(f, "{}", Pin(dcd))?,
            None => f.write_str("-")?,
        }
        write!(f, ",ri={}", Pin(self.pins.ri))
    }
}
