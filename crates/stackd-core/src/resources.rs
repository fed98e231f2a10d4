//! Resource kinds, per-service reservation requests and orchestrator capacity.
//!
//! CPU is tracked in millicores and memory in bytes; both are divisible.
//! GPUs are tracked as whole devices.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// A constrained resource the orchestrator hands out claims on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
}

impl ResourceKind {
    pub const ALL: [Self; 3] = [Self::Cpu, Self::Memory, Self::Gpu];

    /// Unit label used in status output.
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Cpu => "millicores",
            Self::Memory => "bytes",
            Self::Gpu => "devices",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Memory => f.write_str("memory"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// What a service asks for before it is allowed to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpus: u64,
}

impl ResourceRequest {
    pub const fn quantity(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpu_millis,
            ResourceKind::Memory => self.memory_bytes,
            ResourceKind::Gpu => self.gpus,
        }
    }

    /// Non-zero `(kind, quantity)` pairs in a stable order.
    pub fn demands(&self) -> Vec<(ResourceKind, u64)> {
        ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, self.quantity(*kind)))
            .filter(|(_, q)| *q > 0)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.demands().is_empty()
    }
}

/// Total capacity per resource kind. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub gpus: u64,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            cpu_millis: None,
            memory_bytes: None,
            gpus: 0,
        }
    }
}

impl Capacity {
    pub const fn limit(&self, kind: ResourceKind) -> Option<u64> {
        match kind {
            ResourceKind::Cpu => self.cpu_millis,
            ResourceKind::Memory => self.memory_bytes,
            ResourceKind::Gpu => Some(self.gpus),
        }
    }
}

/// Convert a core count (possibly fractional) to millicores.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn cores_to_millis(cores: f64) -> Result<u64, String> {
    if !cores.is_finite() || cores < 0.0 {
        return Err(format!("invalid cpu amount {cores}"));
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse a memory amount such as `512m`, `4g`, `1.5GiB` or `1048576`.
///
/// Suffixes are binary multiples, matching container tooling.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn parse_memory(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty memory amount".to_string());
    }
    let lower = trimmed.to_ascii_lowercase();
    let number_end = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, suffix) = lower.split_at(number_end);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid memory amount '{input}'"))?;
    let suffix = suffix.trim();
    let suffix = suffix
        .strip_suffix("ib")
        .or_else(|| suffix.strip_suffix('b'))
        .unwrap_or(suffix);
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        other => return Err(format!("unknown memory suffix '{other}' in '{input}'")),
    };
    Ok((value * multiplier as f64).round() as u64)
}

/// Memory amount accepted either as a byte count or a suffixed string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MemoryAmount(pub u64);

impl<'de> Deserialize<'de> for MemoryAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(Self(n)),
            Raw::Text(s) => parse_memory(&s).map(Self).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn memory_suffixes_are_binary() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("1k").unwrap(), 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("4g").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("4GiB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1.5g").unwrap(), 1_610_612_736);
    }

    #[test]
    fn memory_rejects_garbage() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("4x").is_err());
    }

    #[test]
    fn cores_convert_to_millis() {
        assert_eq!(cores_to_millis(2.0).unwrap(), 2000);
        assert_eq!(cores_to_millis(0.25).unwrap(), 250);
        assert!(cores_to_millis(-1.0).is_err());
        assert!(cores_to_millis(f64::NAN).is_err());
    }

    #[test]
    fn demands_skip_zero_quantities() {
        let req = ResourceRequest {
            cpu_millis: 500,
            memory_bytes: 0,
            gpus: 1,
        };
        assert_eq!(
            req.demands(),
            vec![(ResourceKind::Cpu, 500), (ResourceKind::Gpu, 1)]
        );
        assert!(ResourceRequest::default().is_empty());
    }

    #[test]
    fn gpu_capacity_defaults_to_zero() {
        let cap = Capacity::default();
        assert_eq!(cap.limit(ResourceKind::Gpu), Some(0));
        assert_eq!(cap.limit(ResourceKind::Cpu), None);
    }

    #[test]
    fn memory_amount_accepts_both_forms() {
        #[derive(Deserialize)]
        struct Probe {
            a: MemoryAmount,
            b: MemoryAmount,
        }
        let p: Probe = toml::from_str("a = 2048\nb = \"2k\"").unwrap();
        assert_eq!(p.a, MemoryAmount(2048));
        assert_eq!(p.b, MemoryAmount(2048));
    }
}
