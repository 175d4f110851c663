// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::{
    check_priority, MessageCatalog, MessageInfo, Priority, ReplyTimeout, BINARY_FORMAT,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    /// 0 keeps the OS default.
    pub backlog: u32,
    pub read_buffer_size: usize,
    /// Unframed input a connection may buffer before it is closed.
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            backlog: 0,
            read_buffer_size: 4 * 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long an idle dispatch loop sleeps before looking at its timers again.
    pub idle_timeout_ms: u64,
    /// Incoming messages decoded per connection per tick.
    pub incoming_quantum: usize,
    /// Outgoing messages handed to the writer per connection per tick.
    pub outgoing_quantum: usize,
    pub stop_wait_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            idle_timeout_ms: 50,
            incoming_quantum: 100,
            outgoing_quantum: 100,
            stop_wait_ms: 50_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub wire_format: String,
    pub timeouts_enabled: bool,
    pub engine_managed_ids: bool,
    /// Absent means requests never time out unless their message says so.
    pub default_timeout_ms: Option<u64>,
    pub default_priority: u32,
    pub max_priority: u32,
    pub close_on_decode_error: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            wire_format: BINARY_FORMAT.to_string(),
            timeouts_enabled: true,
            engine_managed_ids: true,
            default_timeout_ms: None,
            default_priority: 1,
            max_priority: u32::MAX,
            close_on_decode_error: true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CommConfig {
    pub network: NetworkConfig,
    pub dispatcher: DispatcherConfig,
    pub protocol: ProtocolConfig,
    pub messages: Vec<MessageInfo>,
}

impl CommConfig {
    /// Reads a configuration file, any format the `config` crate knows by
    /// extension. `MSGCOMM__SECTION__KEY` environment variables override it.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<CommConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::Misconfiguration(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("MSGCOMM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let comm_config: CommConfig = config.try_deserialize()?;
        comm_config.validate()?;
        Ok(comm_config)
    }

    pub fn with_message(mut self, info: MessageInfo) -> Self {
        self.messages.push(info);
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.dispatcher.incoming_quantum == 0 || self.dispatcher.outgoing_quantum == 0 {
            return Err(AppError::Misconfiguration(
                "dispatcher quanta must be positive".to_string(),
            ));
        }
        if self.dispatcher.idle_timeout_ms == 0 {
            return Err(AppError::Misconfiguration(
                "dispatcher idle_timeout_ms must be positive".to_string(),
            ));
        }
        if self.network.read_buffer_size == 0 || self.network.max_frame_size == 0 {
            return Err(AppError::Misconfiguration(
                "network buffer sizes must be positive".to_string(),
            ));
        }
        self.catalog().map(|_| ())
    }

    pub fn listen_address(&self) -> AppResult<SocketAddr> {
        let ip: IpAddr = self.network.ip.parse().map_err(|e| {
            AppError::Misconfiguration(format!("network ip {}: {}", self.network.ip, e))
        })?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.idle_timeout_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.dispatcher.stop_wait_ms)
    }

    pub fn default_reply_timeout(&self) -> ReplyTimeout {
        match self.protocol.default_timeout_ms {
            Some(ms) => ReplyTimeout::After(Duration::from_millis(ms)),
            None => ReplyTimeout::Never,
        }
    }

    pub fn max_priority(&self) -> AppResult<Priority> {
        Priority::new(self.protocol.max_priority).ok_or_else(|| {
            AppError::Misconfiguration("protocol max_priority must be positive".to_string())
        })
    }

    pub fn default_priority(&self) -> AppResult<Priority> {
        check_priority(self.protocol.default_priority, self.max_priority()?)
            .map_err(|e| AppError::Misconfiguration(format!("protocol default_priority: {}", e)))
    }

    pub fn catalog(&self) -> AppResult<MessageCatalog> {
        MessageCatalog::build(
            &self.messages,
            self.default_reply_timeout(),
            self.default_priority()?,
            self.max_priority()?,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = CommConfig::default();
        config.validate().unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_millis(50));
        assert_eq!(config.default_reply_timeout(), ReplyTimeout::Never);
        assert_eq!(config.protocol.wire_format, "binary");
    }

    #[test]
    fn load_reads_sections_and_message_catalog() {
        let file = write_config(
            r#"
[network]
ip = "0.0.0.0"
port = 7001

[dispatcher]
incoming_quantum = 10

[protocol]
default_timeout_ms = 2000
default_priority = 3
max_priority = 10

[[messages]]
name = "ask"
need_reply = true
timeout_ms = 500
answers = ["answer"]

[[messages]]
name = "urgent"
priority = 9
"#,
        );
        let config = CommConfig::load(file.path()).unwrap();
        assert_eq!(config.network.port, 7001);
        assert_eq!(config.dispatcher.incoming_quantum, 10);
        assert_eq!(config.dispatcher.outgoing_quantum, 100);
        assert_eq!(config.messages.len(), 2);

        let catalog = config.catalog().unwrap();
        assert!(catalog.need_reply("ask"));
        assert_eq!(
            catalog.reply_timeout("ask"),
            ReplyTimeout::After(Duration::from_millis(500))
        );
        assert_eq!(
            catalog.reply_timeout("urgent"),
            ReplyTimeout::After(Duration::from_millis(2000))
        );
        assert_eq!(catalog.priority("urgent").get(), 9);
        assert_eq!(catalog.priority("ask").get(), 3);
        assert!(!catalog.is_allowed_reply("ask", "other"));
    }

    #[test]
    fn load_rejects_invalid_catalog() {
        let file = write_config(
            r#"
[protocol]
max_priority = 5

[[messages]]
name = "too_high"
priority = 6
"#,
        );
        assert!(matches!(
            CommConfig::load(file.path()),
            Err(AppError::Misconfiguration(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            CommConfig::load("/nonexistent/msgcomm.toml"),
            Err(AppError::ConfigFileError(_))
        ));
    }

    #[rstest]
    #[case::zero_incoming_quantum(|c: &mut CommConfig| c.dispatcher.incoming_quantum = 0)]
    #[case::zero_outgoing_quantum(|c: &mut CommConfig| c.dispatcher.outgoing_quantum = 0)]
    #[case::zero_max_frame_size(|c: &mut CommConfig| c.network.max_frame_size = 0)]
    #[case::zero_priority(|c: &mut CommConfig| c.protocol.default_priority = 0)]
    #[case::default_above_max(|c: &mut CommConfig| {
        c.protocol.max_priority = 2;
        c.protocol.default_priority = 3;
    })]
    #[case::timeout_and_never(|c: &mut CommConfig| {
        let mut info = MessageInfo::new("x").need_reply(None);
        info.timeout_ms = Some(10);
        c.messages.push(info);
    })]
    fn validate_rejects(#[case] mutate: fn(&mut CommConfig)) {
        let mut config = CommConfig::default();
        mutate(&mut config);
        assert!(matches!(
            config.validate(),
            Err(AppError::Misconfiguration(_))
        ));
    }

    #[test]
    fn bad_ip_is_reported() {
        let mut config = CommConfig::default();
        config.network.ip = "not-an-ip".to_string();
        assert!(config.listen_address().is_err());
    }
}
