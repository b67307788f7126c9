//! Bus topic layout
//!
//! `{prefix}/{kind}/knx[/{address}]`; group addresses are written in topic
//! form (`1%2F2%2F3`) so the address never adds topic levels.

use voltage_knx::GroupAddress;

use crate::registry::PROTOCOL_KNX;

/// Topic kinds the bridge publishes or consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    State,
    Command,
    Ack,
    Request,
    Response,
    Health,
    Discovery,
}

impl TopicKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            TopicKind::State => "state",
            TopicKind::Command => "command",
            TopicKind::Ack => "ack",
            TopicKind::Request => "request",
            TopicKind::Response => "response",
            TopicKind::Health => "health",
            TopicKind::Discovery => "discovery",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "state" => TopicKind::State,
            "command" => TopicKind::Command,
            "ack" => TopicKind::Ack,
            "request" => TopicKind::Request,
            "response" => TopicKind::Response,
            "health" => TopicKind::Health,
            "discovery" => TopicKind::Discovery,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn build(&self, kind: TopicKind, tail: Option<&str>) -> String {
        let mut topic = String::new();
        if !self.prefix.is_empty() {
            topic.push_str(&self.prefix);
            topic.push('/');
        }
        topic.push_str(kind.as_str());
        topic.push('/');
        topic.push_str(PROTOCOL_KNX);
        if let Some(tail) = tail {
            topic.push('/');
            topic.push_str(tail);
        }
        topic
    }

    pub fn state(&self, ga: GroupAddress) -> String {
        self.build(TopicKind::State, Some(&ga.to_topic()))
    }

    pub fn command(&self, ga: GroupAddress) -> String {
        self.build(TopicKind::Command, Some(&ga.to_topic()))
    }

    /// Ack topic; `segment` is an address already in topic form (may be empty)
    pub fn ack(&self, segment: &str) -> String {
        self.build(TopicKind::Ack, Some(segment))
    }

    pub fn request(&self, request_id: &str) -> String {
        self.build(TopicKind::Request, Some(request_id))
    }

    pub fn response(&self, request_id: &str) -> String {
        self.build(TopicKind::Response, Some(request_id))
    }

    pub fn health(&self) -> String {
        self.build(TopicKind::Health, None)
    }

    pub fn discovery(&self) -> String {
        self.build(TopicKind::Discovery, None)
    }

    pub fn command_filter(&self) -> String {
        self.build(TopicKind::Command, Some("#"))
    }

    pub fn request_filter(&self) -> String {
        self.build(TopicKind::Request, Some("#"))
    }

    /// Split an incoming topic into its kind and trailing segment
    ///
    /// Returns `None` for topics outside our prefix or for another protocol.
    pub fn parse<'a>(&self, topic: &'a str) -> Option<(TopicKind, &'a str)> {
        let rest = if self.prefix.is_empty() {
            topic
        } else {
            topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?
        };
        let mut parts = rest.splitn(3, '/');
        let kind = TopicKind::parse(parts.next()?)?;
        if parts.next()? != PROTOCOL_KNX {
            return None;
        }
        Some((kind, parts.next().unwrap_or("")))
    }
}
