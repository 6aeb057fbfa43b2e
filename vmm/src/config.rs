// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

use crate::limits::{MAX_VCPUS, PAGE_SIZE};

/// Errors associated with guest configuration strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Option string syntax error
    #[error("Error parsing --guest: {0}")]
    ParseGuest(#[source] OptionParserError),
    /// Memory size is zero or not page aligned
    #[error("Guest memory size {0:#x} must be a non-zero multiple of the page size")]
    InvalidMemorySize(u64),
    /// Memory does not fit in the guest window
    #[error("Guest memory size {memory:#x} exceeds the window size {window:#x}")]
    MemoryExceedsWindow { memory: u64, window: u64 },
    /// Vcpu count out of range
    #[error("Vcpu count {0} is outside 1..={max}", max = MAX_VCPUS)]
    InvalidCpuCount(u32),
    /// Entry point outside guest memory or out of real-mode reach
    #[error("Entry point {0:#x} is not reachable in real mode inside guest memory")]
    InvalidEntry(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
}

type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

/// `key=value` pairs separated by commas, for a fixed set of keys.
#[derive(Default)]
struct OptionParser {
    options: HashMap<String, Option<String>>,
}

impl OptionParser {
    fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.contains(['=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(option.to_owned(), None);
        self
    }

    fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in input.trim().split(',') {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| OptionParserError::InvalidSyntax(option.to_owned()))?;
            match self.options.get_mut(key.trim()) {
                None => return Err(OptionParserError::UnknownOption(key.to_owned())),
                Some(slot) => *slot = Some(value.trim().to_owned()),
            }
        }

        Ok(())
    }

    fn get(&self, option: &str) -> Option<&str> {
        self.options
            .get(option)
            .and_then(|v| v.as_deref())
            .filter(|s| !s.is_empty())
    }

    fn convert<T: FromStr>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.get(option) {
            None => Ok(None),
            Some(v) => Ok(Some(v.parse().map_err(|_| {
                OptionParserError::Conversion(option.to_owned(), v.to_owned())
            })?)),
        }
    }
}

/// Byte count with an optional `K`, `M` or `G` binary suffix.
pub struct ByteSized(pub u64);

#[derive(Debug, Error)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let shift = if s.ends_with('K') {
            10
        } else if s.ends_with('M') {
            20
        } else if s.ends_with('G') {
            30
        } else {
            0
        };

        let digits = s.trim_end_matches(['K', 'M', 'G']);
        let value = digits
            .parse::<u64>()
            .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?;
        value
            .checked_mul(1 << shift)
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::InvalidValue(s.to_owned()))
    }
}

/// Integer written in decimal or with a `0x` prefix.
pub struct Address(pub u64);

impl FromStr for Address {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).map(Address),
            None => s.parse().map(Address),
        }
    }
}

/// Shape of the guest started by `vmon run`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestConfig {
    /// Bytes of RAM mapped at GPA 0.
    pub memory: u64,
    pub cpus: u32,
    /// End of the guest physical window, which starts at 0.
    pub window: u64,
    /// Load address of the image, also the first instruction.
    pub entry: u64,
}

pub const DEFAULT_MEMORY: u64 = 2 << 20;
pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_WINDOW: u64 = 4 << 30;
pub const DEFAULT_ENTRY: u64 = 0x1000;

/// Highest address a real-mode `cs:ip` can name.
const REAL_MODE_LIMIT: u64 = 0x10_ffef;

impl Default for GuestConfig {
    fn default() -> Self {
        GuestConfig {
            memory: DEFAULT_MEMORY,
            cpus: DEFAULT_CPUS,
            window: DEFAULT_WINDOW,
            entry: DEFAULT_ENTRY,
        }
    }
}

impl GuestConfig {
    pub const SYNTAX: &'static str = "Guest parameters \
        \"memory=<guest_memory_size>,cpus=<vcpu_count>,\
        window=<guest_window_size>,entry=<load_address>\"";

    pub fn parse(guest: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("memory").add("cpus").add("window").add("entry");
        parser.parse(guest).map_err(Error::ParseGuest)?;

        let memory = parser
            .convert::<ByteSized>("memory")
            .map_err(Error::ParseGuest)?
            .map_or(DEFAULT_MEMORY, |v| v.0);
        let cpus = parser
            .convert::<u32>("cpus")
            .map_err(Error::ParseGuest)?
            .unwrap_or(DEFAULT_CPUS);
        let window = parser
            .convert::<ByteSized>("window")
            .map_err(Error::ParseGuest)?
            .map_or(DEFAULT_WINDOW, |v| v.0);
        let entry = parser
            .convert::<Address>("entry")
            .map_err(Error::ParseGuest)?
            .map_or(DEFAULT_ENTRY, |v| v.0);

        let config = GuestConfig {
            memory,
            cpus,
            window,
            entry,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory == 0 || self.memory % PAGE_SIZE != 0 {
            return Err(Error::InvalidMemorySize(self.memory));
        }
        if self.memory > self.window {
            return Err(Error::MemoryExceedsWindow {
                memory: self.memory,
                window: self.window,
            });
        }
        if self.cpus == 0 || self.cpus as usize > MAX_VCPUS {
            return Err(Error::InvalidCpuCount(self.cpus));
        }
        if self.entry >= self.memory || self.entry > REAL_MODE_LIMIT {
            return Err(Error::InvalidEntry(self.entry));
        }
        Ok(())
    }

    /// Real-mode `(cs, ip)` pair naming `entry`.
    pub fn real_mode_entry(&self) -> (u16, u16) {
        let cs = (self.entry >> 4).min(0xffff);
        let ip = self.entry - (cs << 4);
        (cs as u16, ip as u16)
    }
}
