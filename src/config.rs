use std::{env, net::SocketAddr, time::Duration};

use tracing::warn;

use crate::{
    frame::Pricing,
    models::{ValidationLimits, WizardStage},
    relay::RelaySettings,
    upstream::{SessionConvention, UpstreamDescriptor},
};

const MOCK_BASE_URL: &str = "mock://local";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub stages: Vec<StageProfile>,
    pub relay: RelaySettings,
    pub validation: ValidationLimits,
    pub session_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    pub session: SessionConvention,
    pub session_response_header: Option<String>,
}

/// Per-stage upstream route. Every wizard step shares the relay and differs
/// only in where it points and how long it may run.
#[derive(Debug, Clone)]
pub struct StageProfile {
    pub stage: WizardStage,
    pub path: String,
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream: UpstreamConfig::default(),
            stages: WizardStage::ALL
                .iter()
                .map(|stage| StageProfile {
                    stage: *stage,
                    path: default_stage_path(*stage),
                    timeout: stage.default_timeout(),
                })
                .collect(),
            relay: RelaySettings::default(),
            validation: ValidationLimits::default(),
            session_ttl: Duration::from_secs(86_400),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            session: SessionConvention::Header("x-session-id".to_owned()),
            session_response_header: Some("x-session-id".to_owned()),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let listen_addr = match env::var("RELAY_LISTEN_ADDR") {
            Ok(value) if !value.trim().is_empty() => match value.trim().parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(error) => {
                    warn!(value = %value, error = %error, "invalid RELAY_LISTEN_ADDR, using default");
                    defaults.listen_addr
                }
            },
            _ => defaults.listen_addr,
        };

        let stages = defaults
            .stages
            .iter()
            .map(|profile| {
                let key = profile.stage.env_key();
                StageProfile {
                    stage: profile.stage,
                    path: read_string(&format!("RELAY_PATH_{key}"))
                        .unwrap_or_else(|| profile.path.clone()),
                    timeout: Duration::from_secs(read_u64(
                        &format!("RELAY_TIMEOUT_{key}_SECS"),
                        profile.timeout.as_secs(),
                    )),
                }
            })
            .collect();

        let keep_alive_secs = read_u64("RELAY_KEEP_ALIVE_SECS", 0);
        let relay = RelaySettings {
            channel_capacity: read_usize("RELAY_CHANNEL_CAPACITY", defaults.relay.channel_capacity)
                .max(1),
            malformed_frame_limit: read_usize(
                "RELAY_MALFORMED_FRAME_LIMIT",
                defaults.relay.malformed_frame_limit,
            ),
            max_line_bytes: read_usize("RELAY_MAX_LINE_BYTES", defaults.relay.max_line_bytes)
                .max(1024),
            max_buffered_bytes: read_usize(
                "RELAY_MAX_BUFFERED_BYTES",
                defaults.relay.max_buffered_bytes,
            ),
            keep_alive: (keep_alive_secs > 0).then(|| Duration::from_secs(keep_alive_secs)),
            pricing: Pricing::from_env(),
        };

        Self {
            listen_addr,
            upstream: UpstreamConfig::from_env(),
            stages,
            relay,
            validation: ValidationLimits {
                max_field_chars: read_usize(
                    "RELAY_MAX_FIELD_CHARS",
                    defaults.validation.max_field_chars,
                ),
            },
            session_ttl: Duration::from_secs(read_u64(
                "RELAY_SESSION_TTL_SECS",
                defaults.session_ttl.as_secs(),
            )),
        }
    }

    pub fn uses_mock_upstream(&self) -> bool {
        self.upstream.base_url.is_none()
    }

    pub fn descriptor_for(&self, stage: WizardStage) -> UpstreamDescriptor {
        let profile = self.stages.iter().find(|profile| profile.stage == stage);
        let (path, timeout) = match profile {
            Some(profile) => (profile.path.clone(), profile.timeout),
            None => (default_stage_path(stage), stage.default_timeout()),
        };

        UpstreamDescriptor {
            base_url: self
                .upstream
                .base_url
                .clone()
                .unwrap_or_else(|| MOCK_BASE_URL.to_owned()),
            path,
            headers: self.upstream.headers.clone(),
            timeout,
            session: self.upstream.session.clone(),
            session_response_header: self.upstream.session_response_header.clone(),
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let key = read_string("RELAY_SESSION_KEY");
        let session = match read_string("RELAY_SESSION_MODE").as_deref() {
            None | Some("header") => {
                SessionConvention::Header(key.unwrap_or_else(|| "x-session-id".to_owned()))
            }
            Some("body") => SessionConvention::BodyField(key.unwrap_or_else(|| "sessionId".to_owned())),
            Some("query") => SessionConvention::Query(key.unwrap_or_else(|| "session_id".to_owned())),
            Some("none") => SessionConvention::None,
            Some(other) => {
                warn!(mode = %other, "unknown RELAY_SESSION_MODE, attaching session as header");
                SessionConvention::Header(key.unwrap_or_else(|| "x-session-id".to_owned()))
            }
        };

        Self {
            base_url: read_string("RELAY_UPSTREAM_URL")
                .map(|url| url.trim_end_matches('/').to_owned()),
            api_key: read_string("RELAY_UPSTREAM_API_KEY"),
            headers: read_string("RELAY_UPSTREAM_HEADERS")
                .map(|value| parse_header_list(&value))
                .unwrap_or_default(),
            connect_timeout: Duration::from_secs(read_u64(
                "RELAY_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            session,
            session_response_header: match read_string("RELAY_SESSION_RESPONSE_HEADER") {
                Some(value) if value == "none" => None,
                Some(value) => Some(value),
                None => defaults.session_response_header,
            },
        }
    }
}

fn default_stage_path(stage: WizardStage) -> String {
    format!("/v1/wizard/{}", stage.as_str())
}

/// Parses `name=value,name=value`. Entries without `=` are dropped.
pub fn parse_header_list(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

pub(crate) fn read_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub(crate) fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0)
        .unwrap_or(default)
}
