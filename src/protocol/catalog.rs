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

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Priority, MIN_PRIORITY};
use crate::{AppError, AppResult};

/// Static protocol contract of one message type.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MessageInfo {
    pub name: String,
    #[serde(default)]
    pub need_reply: bool,
    /// Absent means the protocol default timeout applies.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Explicitly never time out, regardless of the protocol default.
    #[serde(default)]
    pub no_timeout: bool,
    /// Accepted reply type names, empty accepts any reply.
    #[serde(default)]
    pub answers: Vec<String>,
    /// Absent means the protocol default priority applies.
    #[serde(default)]
    pub priority: Option<u32>,
}

/// How long a sent message waits for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTimeout {
    Never,
    After(Duration),
}

impl MessageInfo {
    pub fn new(name: impl Into<String>) -> Self {
        MessageInfo {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn need_reply(mut self, timeout: Option<Duration>) -> Self {
        self.need_reply = true;
        match timeout {
            Some(timeout) => self.timeout_ms = Some(timeout.as_millis() as u64),
            None => self.no_timeout = true,
        }
        self
    }

    pub fn answers<I, S>(mut self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.answers = answers.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    fn validate(&self, max_priority: Priority) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AppError::Misconfiguration(
                "message info without a name".to_string(),
            ));
        }
        if self.no_timeout && self.timeout_ms.is_some() {
            return Err(AppError::Misconfiguration(format!(
                "message {} sets both timeout_ms and no_timeout",
                self.name
            )));
        }
        if let Some(priority) = self.priority {
            check_priority(priority, max_priority)
                .map_err(|e| AppError::Misconfiguration(format!("message {}: {}", self.name, e)))?;
        }
        Ok(())
    }
}

pub(crate) fn check_priority(priority: u32, max_priority: Priority) -> Result<Priority, String> {
    match NonZeroU32::new(priority) {
        Some(p) if p <= max_priority => Ok(p),
        _ => Err(format!(
            "priority {} outside [{}, {}]",
            priority, MIN_PRIORITY, max_priority
        )),
    }
}

/// Read-only lookup of message contracts, built once at dispatcher start.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    infos: HashMap<String, MessageInfo>,
    default_timeout: ReplyTimeout,
    default_priority: Priority,
}

impl MessageCatalog {
    pub fn build(
        infos: &[MessageInfo],
        default_timeout: ReplyTimeout,
        default_priority: Priority,
        max_priority: Priority,
    ) -> AppResult<Self> {
        if default_priority > max_priority {
            return Err(AppError::Misconfiguration(format!(
                "default priority {} above max priority {}",
                default_priority, max_priority
            )));
        }
        let mut map: HashMap<String, MessageInfo> = HashMap::with_capacity(infos.len());
        for info in infos {
            info.validate(max_priority)?;
            if let Some(existing) = map.get(&info.name) {
                if existing != info {
                    return Err(AppError::Misconfiguration(format!(
                        "message {} registered twice with different contracts",
                        info.name
                    )));
                }
                continue;
            }
            map.insert(info.name.clone(), info.clone());
        }
        Ok(MessageCatalog {
            infos: map,
            default_timeout,
            default_priority,
        })
    }

    pub fn get(&self, name: &str) -> Option<&MessageInfo> {
        self.infos.get(name)
    }

    pub fn need_reply(&self, name: &str) -> bool {
        self.get(name).map(|info| info.need_reply).unwrap_or(false)
    }

    pub fn reply_timeout(&self, name: &str) -> ReplyTimeout {
        match self.get(name) {
            Some(info) if info.no_timeout => ReplyTimeout::Never,
            Some(MessageInfo {
                timeout_ms: Some(ms),
                ..
            }) => ReplyTimeout::After(Duration::from_millis(*ms)),
            _ => self.default_timeout,
        }
    }

    pub fn priority(&self, name: &str) -> Priority {
        self.get(name)
            .and_then(|info| info.priority)
            .and_then(NonZeroU32::new)
            .unwrap_or(self.default_priority)
    }

    /// Whether `reply_name` is an accepted answer to `request_name`.
    pub fn is_allowed_reply(&self, request_name: &str, reply_name: &str) -> bool {
        match self.get(request_name) {
            Some(info) if !info.answers.is_empty() => {
                info.answers.iter().any(|answer| answer == reply_name)
            }
            _ => true,
        }
    }
}
