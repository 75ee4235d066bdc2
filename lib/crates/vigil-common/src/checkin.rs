//! Check-in cadences and telemetry payloads.
//!
//! Each telemetry signal has its own interval so a slow collector (WMI)
//! can never delay a cheap, frequent one (hello). The controller hands the
//! agent a [`CheckInConfig`] at startup; if that fetch fails the agent
//! falls back to hardcoded jittered ranges so a fleet restarting at once
//! never goes fully silent and never thunders in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{AgentInfo, DiskInfo, ServiceStatus, SoftwareItem};

/// One telemetry signal pushed on its own cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Hello,
    AgentInfo,
    Services,
    PublicIp,
    Disks,
    Software,
    Wmi,
    Sync,
}

impl Signal {
    /// Wire name, also the telemetry subject suffix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::AgentInfo => "agent_info",
            Self::Services => "services",
            Self::PublicIp => "public_ip",
            Self::Disks => "disks",
            Self::Software => "software",
            Self::Wmi => "wmi",
            Self::Sync => "sync",
        }
    }

    /// Heavy signals are suppressed when the controller sets `limit_data`.
    #[must_use]
    pub fn is_heavy(self) -> bool {
        matches!(self, Self::Disks | Self::Software | Self::Wmi)
    }
}

/// Per-signal intervals in seconds, plus feature toggles.
///
/// Fetched once at startup; not re-fetched mid-run — a full restart picks
/// up new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInConfig {
    pub hello: u64,
    pub agent_info: u64,
    pub services: u64,
    pub public_ip: u64,
    pub disks: u64,
    pub software: u64,
    pub wmi: u64,
    pub sync: u64,
    /// Suppress heavy signals (disks, software, WMI).
    #[serde(default)]
    pub limit_data: bool,
}

impl CheckInConfig {
    /// Jittered defaults used when the controller fetch fails.
    #[must_use]
    pub fn fallback() -> Self {
        let mut rng = rand::rng();
        Self {
            hello: rng.random_range(30..=60),
            agent_info: rng.random_range(200..=400),
            services: rng.random_range(2400..=3000),
            public_ip: rng.random_range(300..=500),
            disks: rng.random_range(1000..=2000),
            software: rng.random_range(2800..=3500),
            wmi: rng.random_range(3000..=4000),
            sync: rng.random_range(800..=1200),
            limit_data: false,
        }
    }

    /// Every `(signal, interval_secs)` pair this config enables.
    #[must_use]
    pub fn cadences(&self) -> Vec<(Signal, u64)> {
        let all = [
            (Signal::Hello, self.hello),
            (Signal::AgentInfo, self.agent_info),
            (Signal::Services, self.services),
            (Signal::PublicIp, self.public_ip),
            (Signal::Disks, self.disks),
            (Signal::Software, self.software),
            (Signal::Wmi, self.wmi),
            (Signal::Sync, self.sync),
        ];
        all.into_iter()
            .filter(|(signal, secs)| *secs > 0 && !(self.limit_data && signal.is_heavy()))
            .collect()
    }
}

/// One telemetry push, tagged by signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CheckInPayload {
    Hello {
        agent_id: String,
        version: String,
    },
    AgentInfo {
        agent_id: String,
        info: AgentInfo,
    },
    Services {
        agent_id: String,
        services: Vec<ServiceStatus>,
    },
    PublicIp {
        agent_id: String,
        public_ip: String,
    },
    Disks {
        agent_id: String,
        disks: Vec<DiskInfo>,
    },
    Software {
        agent_id: String,
        software: Vec<SoftwareItem>,
    },
    Wmi {
        agent_id: String,
        wmi: serde_json::Value,
    },
    Sync {
        agent_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, encode_named};

    #[test]
    fn test_fallback_intervals_within_documented_ranges() {
        for _ in 0..32 {
            let config = CheckInConfig::fallback();
            assert!((30..=60).contains(&config.hello));
            assert!((200..=400).contains(&config.agent_info));
            assert!((2400..=3000).contains(&config.services));
            assert!((300..=500).contains(&config.public_ip));
            assert!((1000..=2000).contains(&config.disks));
            assert!((2800..=3500).contains(&config.software));
            assert!((3000..=4000).contains(&config.wmi));
            assert!((800..=1200).contains(&config.sync));
            assert!(!config.limit_data);
        }
    }

    #[test]
    fn test_cadences_full_set_when_unlimited() {
        let config = CheckInConfig::fallback();
        assert_eq!(config.cadences().len(), 8);
    }

    #[test]
    fn test_limit_data_suppresses_heavy_signals() {
        let config = CheckInConfig {
            limit_data: true,
            ..CheckInConfig::fallback()
        };
        let signals: Vec<Signal> = config.cadences().into_iter().map(|(s, _)| s).collect();
        assert!(!signals.contains(&Signal::Disks));
        assert!(!signals.contains(&Signal::Software));
        assert!(!signals.contains(&Signal::Wmi));
        assert!(signals.contains(&Signal::Hello));
        assert!(signals.contains(&Signal::PublicIp));
    }

    #[test]
    fn test_zero_interval_disables_a_signal() {
        let config = CheckInConfig {
            public_ip: 0,
            ..CheckInConfig::fallback()
        };
        let signals: Vec<Signal> = config.cadences().into_iter().map(|(s, _)| s).collect();
        assert!(!signals.contains(&Signal::PublicIp));
        assert_eq!(signals.len(), 7);
    }

    #[test]
    fn test_checkin_payload_round_trip() {
        let payload = CheckInPayload::PublicIp {
            agent_id: "agent-1".to_string(),
            public_ip: "203.0.113.9".to_string(),
        };
        let bytes = encode_named(&payload).expect("encode should succeed");
        let back: CheckInPayload = decode(&bytes).expect("decode should succeed");
        assert_eq!(back, payload);
    }
}
