//! Session configuration.

use std::fmt;
use std::str::FromStr;

use softverbs::AccessFlags;

use crate::error::{Error, Result};

/// Send queue depth of the benchmark connection.
pub const MAX_WR: usize = 1000;

/// Operation issued by every request of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    None,
    Send,
    Read,
    Write,
}

impl Verb {
    /// Access rights the request buffers are registered with.
    pub fn registration(self) -> AccessFlags {
        match self {
            Verb::None | Verb::Send => AccessFlags::LOCAL_WRITE,
            Verb::Read => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
            Verb::Write => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        }
    }

    /// One-sided access to the peer's memory.
    pub fn is_remote(self) -> bool {
        matches!(self, Verb::Read | Verb::Write)
    }

    /// Whether the requester must learn the peer's addresses and keys before
    /// the first round.
    pub fn requires_remote_addressing(self) -> bool {
        self.is_remote()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::None => "none",
            Verb::Send => "send",
            Verb::Read => "read",
            Verb::Write => "write",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "send" => Ok(Verb::Send),
            "read" => Ok(Verb::Read),
            "write" => Ok(Verb::Write),
            other => Err(Error::InvalidConfig(format!("unknown verb '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every request is signaled and awaited before the next is issued.
    #[default]
    Latency,
    /// Requests are pipelined and signaled only periodically.
    Throughput,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Latency => f.write_str("latency"),
            Mode::Throughput => f.write_str("throughput"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "latency" | "lat" => Ok(Mode::Latency),
            "throughput" | "tput" => Ok(Mode::Throughput),
            other => Err(Error::InvalidConfig(format!("unknown mode '{}'", other))),
        }
    }
}

/// Traffic direction of multi-peer variants. Point-to-point sessions only
/// record it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 1-N
    Out,
    /// N-1
    In,
    /// N-N
    Both,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => f.write_str("1-N"),
            Direction::In => f.write_str("N-1"),
            Direction::Both => f.write_str("N-N"),
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "1-N" => Ok(Direction::Out),
            "N-1" => Ok(Direction::In),
            "N-N" => Ok(Direction::Both),
            other => Err(Error::InvalidConfig(format!("unknown direction '{}'", other))),
        }
    }
}

/// Which end of the connection this process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Passive side. Listens on the configured port.
    Server,
    /// Active side. Connects to `host`.
    Client { host: String },
}

impl Role {
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client { .. })
    }
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Default: Write
    pub verb: Verb,
    /// Requests per round, warmup included.
    /// Default: 1000
    pub count: usize,
    /// Bytes per request.
    /// Default: 2
    pub length: usize,
    /// Default: 1
    pub repeat: usize,
    /// Leading requests excluded from statistics.
    /// Default: 0
    pub warmup_count: usize,
    /// Default: 1
    pub mr_count: usize,
    /// Default: Latency
    pub mode: Mode,
    /// Throughput mode signals every `signal_interval`-th request.
    /// Default: 64
    pub signal_interval: usize,
    /// Window after the first measured start used for the finished count.
    /// Default: 180
    pub time_budget_us: u64,
    pub direction: Option<Direction>,
    /// Default: 1234
    pub port: u16,
    /// Default: 0
    pub tos: u8,
    pub verbose: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            verb: Verb::Write,
            count: 1000,
            length: 2,
            repeat: 1,
            warmup_count: 0,
            mr_count: 1,
            mode: Mode::Latency,
            signal_interval: 64,
            time_budget_us: 180,
            direction: None,
            port: 1234,
            tos: 0,
            verbose: false,
        }
    }
}

impl SessionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verb(mut self, verb: Verb) -> Self {
        self.verb = verb;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_warmup(mut self, warmup_count: usize) -> Self {
        self.warmup_count = warmup_count;
        self
    }

    pub fn with_mr_count(mut self, mr_count: usize) -> Self {
        self.mr_count = mr_count;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_signal_interval(mut self, signal_interval: usize) -> Self {
        self.signal_interval = signal_interval;
        self
    }

    pub fn with_time_budget_us(mut self, time_budget_us: u64) -> Self {
        self.time_budget_us = time_budget_us;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("count", self.count),
            ("length", self.length),
            ("repeat", self.repeat),
            ("mr_count", self.mr_count),
            ("signal_interval", self.signal_interval),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if !self.count.is_multiple_of(self.mr_count) {
            return Err(Error::InvalidConfig(format!(
                "count ({}) must be a multiple of mr_count ({})",
                self.count, self.mr_count
            )));
        }
        if self.warmup_count >= self.count {
            return Err(Error::InvalidConfig(format!(
                "warmup ({}) must be smaller than count ({})",
                self.warmup_count, self.count
            )));
        }
        if self.signal_interval > MAX_WR {
            return Err(Error::InvalidConfig(format!(
                "signal_interval ({}) exceeds the send queue depth ({})",
                self.signal_interval, MAX_WR
            )));
        }
        if u32::try_from(self.length).is_err() {
            return Err(Error::InvalidConfig(format!(
                "length ({}) does not fit a single work request",
                self.length
            )));
        }
        Ok(())
    }

    /// Log the parameters, one per line.
    pub fn log(&self) {
        tracing::info!("Config: verb = {}", self.verb);
        tracing::info!("Config: count = {}", self.count);
        tracing::info!("Config: length = {}", self.length);
        tracing::info!("Config: repeat = {}", self.repeat);
        tracing::info!("Config: warmup = {}", self.warmup_count);
        tracing::info!("Config: mr_count = {}", self.mr_count);
        tracing::info!("Config: mode = {}", self.mode);
        if self.mode == Mode::Throughput {
            tracing::info!("Config: signal_interval = {}", self.signal_interval);
        }
        if let Some(direction) = self.direction {
            tracing::info!("Config: direction = {}", direction);
        }
        tracing::info!("Config: port = {}", self.port);
        tracing::info!("Config: tos = {}", self.tos);
    }
}
