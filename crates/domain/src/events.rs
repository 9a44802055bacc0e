//! 进程内事件
//!
//! 事件不持久化，进程重启即丢失；启动后的周期扫描会根据持久化的条目状态重新派生工作。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::ItemId;

/// 事件来源
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmittedBy {
    Service(String),
    Manual,
    System,
}

impl EmittedBy {
    pub fn service<S: Into<String>>(key: S) -> Self {
        EmittedBy::Service(key.into())
    }
}

impl fmt::Display for EmittedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmittedBy::Service(key) => f.write_str(key),
            EmittedBy::Manual => f.write_str("Manual"),
            EmittedBy::System => f.write_str("System"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub emitted_by: EmittedBy,
    pub item_id: ItemId,
    pub run_at: DateTime<Utc>,
}

impl Event {
    pub fn new(emitted_by: EmittedBy, item_id: ItemId) -> Self {
        Self {
            emitted_by,
            item_id,
            run_at: Utc::now(),
        }
    }

    pub fn scheduled(emitted_by: EmittedBy, item_id: ItemId, run_at: DateTime<Utc>) -> Self {
        Self {
            emitted_by,
            item_id,
            run_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_run_at_as_rfc3339() {
        let run_at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = Event::scheduled(EmittedBy::service("trakt"), 42, run_at);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["item_id"], 42);
        assert_eq!(json["run_at"], "2026-03-01T12:00:00Z");
        assert_eq!(json["emitted_by"]["service"], "trakt");
        assert_eq!(EmittedBy::Manual.to_string(), "Manual");
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let event = Event::scheduled(EmittedBy::System, 1, now + chrono::Duration::seconds(5));
        assert!(!event.is_due(now));
        assert!(event.is_due(now + chrono::Duration::seconds(5)));
    }
}
