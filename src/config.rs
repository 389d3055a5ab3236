use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use vipcore::p2p::ParamsError;
use vipcore::types::{CallTimeParam, UnitType};

/// Behaviour switches supplied by the host application at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// The host renders call UI; without it incoming calls are auto-handled.
    pub with_ui: bool,
    pub debug: bool,
    /// Decode video in software even when a platform decoder exists.
    pub software_decode: bool,
}

/// Per-unit-type dwell timer overrides. Unit types without an override use
/// [`CallTimeParam::for_unit_type`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallTimers {
    overrides: HashMap<UnitType, CallTimeParam>,
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, unit_type: UnitType, times: CallTimeParam) -> Self {
        self.overrides.insert(unit_type, times);
        self
    }

    pub fn get(&self, unit_type: UnitType) -> CallTimeParam {
        self.overrides
            .get(&unit_type)
            .copied()
            .unwrap_or_else(|| CallTimeParam::for_unit_type(unit_type))
    }
}

/// Connection parameters, immutable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    hostname: String,
    port: u16,
    activation_code: String,
    push_token: Option<String>,
    mode: ModeFlags,
    timers: CallTimers,
}

impl ConnectionParams {
    pub fn builder() -> ConnectionParamsBuilder {
        ConnectionParamsBuilder::default()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn activation_code(&self) -> &str {
        &self.activation_code
    }

    pub fn push_token(&self) -> Option<&str> {
        self.push_token.as_deref()
    }

    pub fn mode(&self) -> ModeFlags {
        self.mode
    }

    pub fn timers(&self) -> &CallTimers {
        &self.timers
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionParamsBuilder {
    hostname: String,
    port: u16,
    activation_code: String,
    push_token: Option<String>,
    mode: ModeFlags,
    timers: CallTimers,
}

impl ConnectionParamsBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn activation_code(mut self, code: impl Into<String>) -> Self {
        self.activation_code = code.into();
        self
    }

    pub fn push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }

    pub fn mode(mut self, mode: ModeFlags) -> Self {
        self.mode = mode;
        self
    }

    pub fn timers(mut self, timers: CallTimers) -> Self {
        self.timers = timers;
        self
    }

    pub fn build(self) -> Result<ConnectionParams, ParamsError> {
        if self.hostname.trim().is_empty() {
            return Err(ParamsError::MissingHostname);
        }
        if self.port == 0 {
            return Err(ParamsError::InvalidPort);
        }
        if self.activation_code.trim().is_empty() {
            return Err(ParamsError::MissingActivationCode);
        }
        Ok(ConnectionParams {
            hostname: self.hostname,
            port: self.port,
            activation_code: self.activation_code,
            push_token: self.push_token,
            mode: self.mode,
            timers: self.timers,
        })
    }
}

/// Fixed-address tunnel to a unit or relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectTunnelParams {
    pub ip_address: IpAddr,
    pub tcp_port: u16,
    /// Media port; media shares the TCP stream when absent.
    pub udp_port: Option<u16>,
    pub timeout: Duration,
}

impl DirectTunnelParams {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(ip_address: IpAddr, tcp_port: u16) -> Self {
        Self {
            ip_address,
            tcp_port,
            udp_port: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
