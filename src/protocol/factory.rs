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
use std::fmt;

use tracing::debug;

use super::{Message, RawMessage};
use crate::{AppError, AppResult};

type Constructor = Box<dyn Fn() -> Box<dyn Message> + Send + Sync>;
type DefaultConstructor = Box<dyn Fn(&str) -> Box<dyn Message> + Send + Sync>;

/// Maps a wire type name to the constructor of that message type.
///
/// Filled once while configuring, then shared read-only by every decoder.
#[derive(Default)]
pub struct MessageFactory {
    constructors: HashMap<String, Constructor>,
    fallback: Option<DefaultConstructor>,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that turns every unregistered name into a [`RawMessage`].
    pub fn with_raw_fallback() -> Self {
        let mut factory = Self::new();
        factory.set_default(|name| Box::new(RawMessage::new(name)));
        factory
    }

    /// Registers `constructor` for `name`, replacing an earlier registration.
    pub fn register<F, M>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Message,
    {
        let name = name.into();
        debug!("register message constructor for {}", name);
        self.constructors
            .insert(name, Box::new(move || Box::new(constructor())));
        self
    }

    pub fn set_default<F>(&mut self, constructor: F) -> &mut Self
    where
        F: Fn(&str) -> Box<dyn Message> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(constructor));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn create(&self, name: &str) -> AppResult<Box<dyn Message>> {
        if let Some(constructor) = self.constructors.get(name) {
            return Ok(constructor());
        }
        match &self.fallback {
            Some(fallback) => Ok(fallback(name)),
            None => Err(AppError::UnknownMessageType(name.to_string())),
        }
    }
}

impl fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFactory")
            .field("names", &self.constructors.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
