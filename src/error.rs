//! Domain error taxonomy shared by every component.
//!
//! Mirrors the code ranges in spec section 6/7: each [`Domain`] owns a
//! disjoint slice of `0..700` so a BLE client can bucket errors without
//! string matching.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Domain {
    Network,
    Mqtt,
    Ble,
    Modbus,
    Memory,
    Config,
    System,
}

impl Domain {
    /// Base code for this domain's 100-wide range.
    const fn base(self) -> u16 {
        match self {
            Domain::Network => 0,
            Domain::Mqtt => 100,
            Domain::Ble => 200,
            Domain::Modbus => 300,
            Domain::Memory => 400,
            Domain::Config => 500,
            Domain::System => 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

/// Crate-wide error type. `code` is always in the domain's documented
/// 100-wide slice (e.g. CONFIG is 500..600).
#[derive(Debug, Error)]
#[error("[{domain:?}:{code}] {message}", code = self.code())]
pub struct GatewayError {
    pub domain: Domain,
    pub severity: Severity,
    pub offset: u16,
    pub message: String,
    pub suggestion: Option<String>,
}

impl GatewayError {
    pub fn new(domain: Domain, severity: Severity, offset: u16, message: impl Into<String>) -> Self {
        assert!(offset < 100, "error offset must stay within a domain's 100-wide range");
        Self {
            domain,
            severity,
            offset,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn code(&self) -> u16 {
        self.domain.base() + self.offset
    }

    pub fn not_found(domain: Domain, message: impl Into<String>) -> Self {
        Self::new(domain, Severity::Warn, 4, message)
    }

    pub fn busy(domain: Domain, message: impl Into<String>) -> Self {
        Self::new(domain, Severity::Warn, 9, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(Domain::Config, Severity::Error, 2, message)
    }

    pub fn duplicate_address(message: impl Into<String>) -> Self {
        Self::new(Domain::Config, Severity::Error, 3, message)
    }

    pub fn persist_failure(message: impl Into<String>) -> Self {
        Self::new(Domain::Config, Severity::Critical, 1, message)
    }

    /// CONFIG 504 — used for the poison-payload rejection in spec section 8 scenario 3.
    pub fn poison_payload(message: impl Into<String>) -> Self {
        Self::new(Domain::Config, Severity::Error, 4 /* ignored below */, message)
            .with_code_override(504)
    }

    fn with_code_override(mut self, code: u16) -> Self {
        self.offset = code - self.domain.base();
        self
    }

    /// The documented BLE error response shape (spec section 6).
    pub fn to_response(&self) -> BleErrorResponse {
        BleErrorResponse {
            status: "error",
            error_code: self.code(),
            domain: self.domain,
            severity: self.severity,
            message: self.message.clone(),
            suggestion: self.suggestion.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BleErrorResponse {
    pub status: &'static str,
    pub error_code: u16,
    pub domain: Domain,
    pub severity: Severity,
    pub message: String,
    pub suggestion: Option<String>,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
