//! AMI wire format.
//!
//! CRLF-terminated `Key: Value` lines; an empty line terminates a
//! message. Three shapes share the format: actions (client to server,
//! `Action:` plus parameters), responses (`Response: Success|Error`), and
//! asynchronous events (`Event: <name>`), interleaved with responses on
//! the same connection.

use serde_json::{Map, Value};

/// One parsed AMI message. Key order is preserved; lookups are
/// case-insensitive, matching how Asterisk treats headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmiMessage {
    pub fields: Vec<(String, String)>,
}

impl AmiMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an action message.
    pub fn action(name: &str) -> Self {
        let mut msg = Self::new();
        msg.push("Action", name);
        msg
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Events carry an `Event` header.
    pub fn is_event(&self) -> bool {
        self.get("Event").is_some()
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get("Event")
    }

    /// `Response: Success` (Asterisk also answers `Goodbye` to `Logoff`).
    pub fn is_success(&self) -> bool {
        matches!(self.get("Response"), Some(r) if r.eq_ignore_ascii_case("Success") || r.eq_ignore_ascii_case("Goodbye"))
    }

    pub fn message(&self) -> Option<&str> {
        self.get("Message")
    }

    /// Serialise for the wire: CRLF lines plus the terminating blank line.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.fields.len() * 24 + 2);
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }

    /// Field map as JSON, for event payloads.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.fields {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(map)
    }
}

/// Incremental line-by-line assembler. Feed each received line (without
/// its terminator); a blank line completes the pending message.
#[derive(Debug, Default)]
pub struct AmiCodec {
    current: Vec<(String, String)>,
}

impl AmiCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<AmiMessage> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if self.current.is_empty() {
                return None;
            }
            let fields = std::mem::take(&mut self.current);
            return Some(AmiMessage { fields });
        }
        match line.split_once(':') {
            Some((key, value)) => {
                self.current
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
            None => {
                // Continuation or junk; keep it under a raw key so command
                // output (`Response: Follows`) is not lost.
                self.current.push((String::new(), line.to_string()));
            }
        }
        None
    }

    /// True while a partial message is buffered.
    pub fn is_mid_message(&self) -> bool {
        !self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serialises_with_crlf() {
        let msg = AmiMessage::action("Login")
            .with("Username", "admin")
            .with("Secret", "s3cret");
        let wire = msg.to_wire();
        assert_eq!(
            wire,
            "Action: Login\r\nUsername: admin\r\nSecret: s3cret\r\n\r\n"
        );
    }

    #[test]
    fn codec_assembles_messages() {
        let mut codec = AmiCodec::new();
        assert!(codec.push_line("Response: Success").is_none());
        assert!(codec.push_line("Message: Authentication accepted").is_none());
        let msg = codec.push_line("").unwrap();
        assert!(msg.is_success());
        assert_eq!(msg.message(), Some("Authentication accepted"));
        assert!(!codec.is_mid_message());
    }

    #[test]
    fn codec_ignores_leading_blank_lines() {
        let mut codec = AmiCodec::new();
        assert!(codec.push_line("").is_none());
        assert!(codec.push_line("\r").is_none());
        codec.push_line("Event: Hangup");
        let msg = codec.push_line("").unwrap();
        assert_eq!(msg.event_name(), Some("Hangup"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut codec = AmiCodec::new();
        codec.push_line("RESPONSE: Error");
        codec.push_line("message: Missing action");
        let msg = codec.push_line("").unwrap();
        assert_eq!(msg.get("Response"), Some("Error"));
        assert_eq!(msg.get("Message"), Some("Missing action"));
        assert!(!msg.is_success());
    }

    #[test]
    fn event_classification() {
        let mut codec = AmiCodec::new();
        codec.push_line("Event: PeerEntry");
        codec.push_line("ObjectName: 100");
        let msg = codec.push_line("").unwrap();
        assert!(msg.is_event());
        assert_eq!(msg.event_name(), Some("PeerEntry"));

        let mut codec = AmiCodec::new();
        codec.push_line("Response: Success");
        let msg = codec.push_line("").unwrap();
        assert!(!msg.is_event());
    }

    #[test]
    fn value_with_colon_survives() {
        let mut codec = AmiCodec::new();
        codec.push_line("Channel: SIP/100-00000001");
        codec.push_line("CallerIDName: Doe: John");
        let msg = codec.push_line("").unwrap();
        assert_eq!(msg.get("CallerIDName"), Some("Doe: John"));
    }

    #[test]
    fn continuation_line_is_kept() {
        let mut codec = AmiCodec::new();
        codec.push_line("Response: Follows");
        codec.push_line("raw CLI output without separator");
        let msg = codec.push_line("").unwrap();
        assert!(msg.fields.iter().any(|(_, v)| v.contains("raw CLI output")));
    }

    #[test]
    fn goodbye_counts_as_success() {
        let mut codec = AmiCodec::new();
        codec.push_line("Response: Goodbye");
        let msg = codec.push_line("").unwrap();
        assert!(msg.is_success());
    }

    #[test]
    fn to_json_keeps_fields() {
        let msg = AmiMessage::action("Originate").with("Channel", "SIP/100");
        let json = msg.to_json();
        assert_eq!(json["Action"], "Originate");
        assert_eq!(json["Channel"], "SIP/100");
    }
}
