//! Resolution of HTTP 409 Conflict responses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Field compared by the timestamp strategy
pub const UPDATED_AT: &str = "updatedAt";

/// How a 409 response is reconciled with the client's write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Accept the server's body
    ServerWins,
    /// Re-issue the request once with the client's body
    ClientWins,
    /// Keep whichever body carries the newer `updatedAt`
    #[default]
    Timestamp,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::ServerWins => "server-wins",
            ConflictResolution::ClientWins => "client-wins",
            ConflictResolution::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server-wins" | "server_wins" => Ok(ConflictResolution::ServerWins),
            "client-wins" | "client_wins" => Ok(ConflictResolution::ClientWins),
            "timestamp" => Ok(ConflictResolution::Timestamp),
            other => Err(format!("unknown conflict resolution '{}'", other)),
        }
    }
}

/// Which body the timestamp strategy kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Server,
    Client,
}

/// Reads `updatedAt` as an RFC 3339 string or epoch milliseconds
pub fn updated_at(body: &serde_json::Value) -> Option<DateTime<Utc>> {
    match body.get(UPDATED_AT)? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Picks the newer body. The server wins ties and whenever either side has
/// no comparable timestamp.
pub fn newer(server: &serde_json::Value, client: Option<&serde_json::Value>) -> Winner {
    let client_ts = client.and_then(updated_at);
    match (updated_at(server), client_ts) {
        (Some(server_ts), Some(client_ts)) if client_ts > server_ts => Winner::Client,
        _ => Winner::Server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!("server-wins".parse::<ConflictResolution>(), Ok(ConflictResolution::ServerWins));
        assert_eq!("CLIENT-WINS".parse::<ConflictResolution>(), Ok(ConflictResolution::ClientWins));
        assert_eq!("timestamp".parse::<ConflictResolution>(), Ok(ConflictResolution::Timestamp));
        assert!("newest".parse::<ConflictResolution>().is_err());
        assert_eq!(ConflictResolution::default(), ConflictResolution::Timestamp);
    }

    #[test]
    fn test_updated_at_accepts_both_encodings() {
        let rfc = updated_at(&json!({"updatedAt": "2024-03-01T10:00:00Z"})).unwrap();
        let millis = updated_at(&json!({"updatedAt": rfc.timestamp_millis()})).unwrap();
        assert_eq!(rfc, millis);

        assert!(updated_at(&json!({"updatedAt": "yesterday"})).is_none());
        assert!(updated_at(&json!({"updatedAt": true})).is_none());
        assert!(updated_at(&json!({"id": 1})).is_none());
        assert!(updated_at(&json!("plain")).is_none());
    }

    #[test]
    fn test_newer_client_wins_only_when_strictly_newer() {
        let server = json!({"updatedAt": "2024-03-01T10:00:00Z"});
        let later = json!({"updatedAt": "2024-03-01T10:00:01Z"});
        let earlier = json!({"updatedAt": "2024-03-01T09:59:59Z"});

        assert_eq!(newer(&server, Some(&later)), Winner::Client);
        assert_eq!(newer(&server, Some(&earlier)), Winner::Server);
        assert_eq!(newer(&server, Some(&server)), Winner::Server);
    }

    #[test]
    fn test_newer_defaults_to_server() {
        let server = json!({"updatedAt": "2024-03-01T10:00:00Z"});
        assert_eq!(newer(&server, None), Winner::Server);
        assert_eq!(newer(&json!({}), Some(&server)), Winner::Server);
        assert_eq!(newer(&server, Some(&json!({"updatedAt": "garbage"}))), Winner::Server);
    }
}
