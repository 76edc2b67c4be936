//! Supplicant control protocol messages
//!
//! This module contains parsing and serialization for the text protocol
//! spoken over the wpa_supplicant control socket. Each datagram carries one
//! message: a request (`NAME arg1 key=value`), a reply (`OK` or `FAIL` with
//! optional trailing text) or an unsolicited event whose leading `<n>`
//! priority markers are stripped during parsing.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MiracastError, Result};

/// Message classification on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Outgoing command to the supplicant
    Request,
    /// Positive reply to the command in flight
    Ok,
    /// Negative reply to the command in flight
    Fail,
    /// Unsolicited event
    Event,
}

/// A single control-socket message.
///
/// Tokens containing `=` outside quotes are named arguments; all others are
/// positional. Single- and double-quoted values may contain whitespace
/// (`name='Aquaris M10'`, `ssid="DIRECT-hB"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    name: String,
    positional: Vec<String>,
    named: HashMap<String, String>,
}

impl Message {
    /// Create an outgoing request with the given command name.
    pub fn request(name: &str) -> Self {
        Self {
            message_type: MessageType::Request,
            name: name.to_string(),
            positional: Vec::new(),
            named: HashMap::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg<T: fmt::Display>(mut self, value: T) -> Self {
        self.positional.push(value.to_string());
        self
    }

    /// Append a named `key=value` argument.
    pub fn named_arg<T: fmt::Display>(mut self, key: &str, value: T) -> Self {
        self.named.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse one datagram into a message.
    ///
    /// Replies start with `OK` or `FAIL`; events carry one or more leading
    /// `<n>` priority markers which are stripped. Anything else is routed as
    /// an event so the manager can decide whether it cares.
    pub fn parse(data: &str) -> Result<Self> {
        let mut input = data.trim();
        if input.is_empty() {
            return Err(MiracastError::Parse("empty message".to_string()));
        }

        let mut prefixed = false;
        while let Some(rest) = strip_priority_marker(input) {
            prefixed = true;
            input = rest;
        }

        let mut tokens = tokenize(input);
        if tokens.is_empty() {
            return Err(MiracastError::Parse(format!("no tokens in {:?}", data)));
        }

        let name = unquote(&tokens.remove(0)).to_string();
        let message_type = if prefixed {
            MessageType::Event
        } else if name == "OK" {
            MessageType::Ok
        } else if name == "FAIL" || name.starts_with("FAIL-") {
            MessageType::Fail
        } else {
            MessageType::Event
        };

        let mut positional = Vec::new();
        let mut named = HashMap::new();
        for token in tokens {
            match split_named(&token) {
                Some((key, value)) => {
                    named.insert(key.to_string(), unquote(value).to_string());
                }
                None => positional.push(unquote(&token).to_string()),
            }
        }

        Ok(Self {
            message_type,
            name,
            positional,
            named,
        })
    }

    /// Serialize for transmission. One datagram, no trailing newline.
    pub fn to_wire(&self) -> String {
        let mut out = self.name.clone();
        for arg in &self.positional {
            out.push(' ');
            out.push_str(&quote_if_needed(arg));
        }
        let mut keys: Vec<&String> = self.named.keys().collect();
        keys.sort();
        for key in keys {
            out.push(' ');
            out.push_str(key);
            out.push('=');
            out.push_str(&quote_if_needed(&self.named[key]));
        }
        out
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ok(&self) -> bool {
        self.message_type == MessageType::Ok
    }

    pub fn is_fail(&self) -> bool {
        self.message_type == MessageType::Fail
    }

    /// True for `OK`/`FAIL`, the two shapes that complete a pending command.
    pub fn is_reply(&self) -> bool {
        self.is_ok() || self.is_fail()
    }

    pub fn is_event(&self) -> bool {
        self.message_type == MessageType::Event
    }

    /// Typed positional reader starting at the first argument.
    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader {
            message: self,
            position: 0,
        }
    }

    /// Look up a named argument as a raw string.
    pub fn named_str(&self, key: &str) -> Option<&str> {
        self.named.get(key).map(String::as_str)
    }

    /// Look up a named argument and parse it into the requested type.
    pub fn named<T: FromStr>(&self, key: &str) -> Result<T> {
        let value = self
            .named
            .get(key)
            .ok_or_else(|| MiracastError::Parse(format!("missing named argument {}", key)))?;
        value
            .parse()
            .map_err(|_| MiracastError::Parse(format!("invalid value for {}: {:?}", key, value)))
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Cursor over a message's positional arguments.
pub struct MessageReader<'a> {
    message: &'a Message,
    position: usize,
}

impl<'a> MessageReader<'a> {
    /// Discard the next positional token.
    pub fn skip(&mut self) -> &mut Self {
        self.position += 1;
        self
    }

    /// Pop the next positional token as a string.
    pub fn string(&mut self) -> Result<&'a str> {
        let value = self
            .message
            .positional
            .get(self.position)
            .ok_or_else(|| {
                MiracastError::Parse(format!(
                    "no positional argument at index {} in {}",
                    self.position,
                    self.message.name()
                ))
            })?;
        self.position += 1;
        Ok(value)
    }

    /// Pop the next positional token as an unsigned 32-bit integer.
    pub fn u32(&mut self) -> Result<u32> {
        let raw = self.string()?;
        raw.parse()
            .map_err(|_| MiracastError::Parse(format!("not an unsigned integer: {:?}", raw)))
    }

    /// Pop the next positional token as a signed 32-bit integer.
    pub fn i32(&mut self) -> Result<i32> {
        let raw = self.string()?;
        raw.parse()
            .map_err(|_| MiracastError::Parse(format!("not an integer: {:?}", raw)))
    }
}

/// Strip one leading `<n>` priority marker, if present.
fn strip_priority_marker(input: &str) -> Option<&str> {
    let rest = input.strip_prefix('<')?;
    let end = rest.find('>')?;
    if end == 0 || !rest[..end].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(rest[end + 1..].trim_start())
}

/// Split on whitespace, keeping quoted runs (single or double) intact.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => {
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                    current.push(ch);
                } else if ch.is_whitespace() {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push(ch);
                }
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Split `key=value` at the first `=` that is part of an unquoted key.
fn split_named(token: &str) -> Option<(&str, &str)> {
    if token.starts_with('\'') || token.starts_with('"') {
        return None;
    }
    let index = token.find('=')?;
    if index == 0 {
        return None;
    }
    Some((&token[..index], &token[index + 1..]))
}

fn unquote(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        format!("'{}'", value)
    } else {
        value.to_string()
    }
}
