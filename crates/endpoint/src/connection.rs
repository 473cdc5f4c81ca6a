//! Per-connection state.
//!
//! A [`ConnectionInfo`] is owned by exactly one connection driver and dropped
//! when its transport closes. It carries the connection's key material, the
//! client identity record, the clock offset between the endpoints and the
//! event watermark.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use xmn_protocol::{ClientIdentity, HandshakeHeader, IvMode, KeyManager, ShortCode, UniqueId};

/// Unique identifier for a connection.
pub type ConnectionId = Uuid;

/// Access level granted to a connection, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Unauthenticated, unencrypted-equivalent access.
    #[default]
    Public,
    /// Public channel with a negotiated sync key.
    PublicEncrypted,
    /// Authenticated user session.
    Session,
    /// Operator tooling.
    Operator,
    /// Full access.
    Admin,
}

impl Permission {
    /// Returns the permission name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Public => "public",
            Permission::PublicEncrypted => "public_encrypted",
            Permission::Session => "session",
            Permission::Operator => "operator",
            Permission::Admin => "admin",
        }
    }

    /// Whether this grant satisfies a handler requiring `required`.
    pub fn allows(self, required: Permission) -> bool {
        self >= required
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State owned by a single connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// Connection identifier, unique within the process.
    pub id: ConnectionId,
    /// Remote host (client side) or peer address (server side).
    pub host: String,
    /// Remote port, if explicit.
    pub port: Option<u16>,
    /// Request path the connection was opened on.
    pub path: String,
    /// Public channel rather than an authenticated one.
    pub public: bool,
    /// Application short code from the handshake.
    pub short_code: Option<ShortCode>,
    /// Installation id from the handshake.
    pub unique_id: Option<UniqueId>,
    /// Client network type from the handshake.
    pub network_type: Option<String>,
    /// Coarse client location from the handshake.
    pub location: Option<Value>,
    /// Client identity fields, upgradeable mid-session.
    pub client_identity: ClientIdentity,
    /// Milliseconds to add to peer timestamps to get local time.
    pub ms_offset: i64,
    /// Timestamp of the last event accepted for dispatch.
    pub last_event_ts: u64,
    /// Access level granted at verification.
    pub permission: Permission,
    /// Sync key state.
    pub keys: KeyManager,
}

impl ConnectionInfo {
    /// State for an outbound connection; the sync key is generated lazily.
    pub fn client(host: impl Into<String>, port: Option<u16>, public: bool, iv_mode: IvMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            port,
            path: String::new(),
            public,
            short_code: None,
            unique_id: None,
            network_type: None,
            location: None,
            client_identity: ClientIdentity::new(),
            ms_offset: 0,
            last_event_ts: 0,
            permission: Permission::Public,
            keys: KeyManager::new(iv_mode),
        }
    }

    /// State for an accepted connection, built from its decoded handshake.
    ///
    /// `server_now` is the local clock when the handshake was decoded; the
    /// difference to the header's `now` becomes the clock offset.
    pub fn server(
        peer: impl Into<String>,
        path: impl Into<String>,
        public: bool,
        header: HandshakeHeader,
        server_now: u64,
        iv_mode: IvMode,
    ) -> Self {
        let HandshakeHeader { info, sync_key } = header;
        let mut keys = KeyManager::new(iv_mode);
        keys.install(sync_key);

        Self {
            id: Uuid::new_v4(),
            host: peer.into(),
            port: None,
            path: path.into(),
            public,
            short_code: Some(info.short_code),
            unique_id: Some(info.unique_id),
            network_type: info.network_type,
            location: info.location,
            client_identity: info.client_identity,
            ms_offset: clamp_ts(server_now).saturating_sub(clamp_ts(info.now)),
            last_event_ts: 0,
            permission: Permission::Public,
            keys,
        }
    }

    /// Converts a peer timestamp to local time using the clock offset.
    pub fn local_ts(&self, peer_ts: u64) -> u64 {
        clamp_ts(peer_ts).saturating_add(self.ms_offset).max(0) as u64
    }

    /// Whether an event with timestamp `ts` is newer than the watermark.
    pub fn accepts_event(&self, ts: u64) -> bool {
        ts > self.last_event_ts
    }

    /// Moves the watermark forward to `ts`; never moves it back.
    pub fn advance_watermark(&mut self, ts: u64) {
        if ts > self.last_event_ts {
            self.last_event_ts = ts;
        }
    }

    /// Merges `fields` into the client identity.
    ///
    /// Returns the full updated identity if any field changed.
    pub fn merge_identity(&mut self, fields: ClientIdentity) -> Option<ClientIdentity> {
        let mut changed = false;
        for (key, value) in fields {
            if self.client_identity.get(&key) != Some(&value) {
                self.client_identity.insert(key, value);
                changed = true;
            }
        }
        changed.then(|| self.client_identity.clone())
    }
}

/// Peer timestamps beyond `i64::MAX` are pinned there.
fn clamp_ts(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xmn_protocol::{HeaderInfo, SyncKey};

    fn identity(value: Value) -> ClientIdentity {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::Public < Permission::PublicEncrypted);
        assert!(Permission::PublicEncrypted < Permission::Session);
        assert!(Permission::Session < Permission::Operator);
        assert!(Permission::Operator < Permission::Admin);

        assert!(Permission::Admin.allows(Permission::Session));
        assert!(Permission::Session.allows(Permission::Session));
        assert!(!Permission::PublicEncrypted.allows(Permission::Session));
    }

    #[test]
    fn test_permission_serde() {
        let json = serde_json::to_string(&Permission::PublicEncrypted).unwrap();
        assert_eq!(json, "\"public_encrypted\"");
        let parsed: Permission = serde_json::from_str("\"operator\"").unwrap();
        assert_eq!(parsed, Permission::Operator);
        assert_eq!(Permission::Admin.to_string(), "admin");
    }

    #[test]
    fn test_client_info_defaults() {
        let ci = ConnectionInfo::client("localhost", Some(9090), true, IvMode::Random);
        assert!(!ci.keys.has_key());
        assert_eq!(ci.last_event_ts, 0);
        assert_eq!(ci.ms_offset, 0);
        assert_eq!(ci.permission, Permission::Public);
    }

    #[test]
    fn test_server_info_from_header() {
        let mut info = HeaderInfo::new(
            ShortCode::new("AB1").unwrap(),
            "12.34.5".parse().unwrap(),
            1_000,
        );
        info.network_type = Some("wifi".to_string());
        info.client_identity = identity(json!({"userId": "u1"}));

        let header = HandshakeHeader {
            info,
            sync_key: SyncKey::generate(),
        };
        let ci = ConnectionInfo::server("10.0.0.1:5000", "/private/a/b", false, header, 1_250, IvMode::Random);

        assert!(ci.keys.has_key());
        assert_eq!(ci.ms_offset, 250);
        assert_eq!(ci.short_code.as_ref().map(ShortCode::as_str), Some("AB1"));
        assert_eq!(ci.network_type.as_deref(), Some("wifi"));
        assert_eq!(ci.client_identity["userId"], "u1");
        assert_eq!(ci.local_ts(10_000), 10_250);
    }

    #[test]
    fn test_local_ts_negative_offset() {
        let mut ci = ConnectionInfo::client("h", None, true, IvMode::Random);
        ci.ms_offset = -500;
        assert_eq!(ci.local_ts(2_000), 1_500);
        assert_eq!(ci.local_ts(100), 0);
    }

    #[test]
    fn test_out_of_range_peer_clock() {
        let header = HandshakeHeader {
            info: HeaderInfo::new(ShortCode::new("AB1").unwrap(), "1.2.3".parse().unwrap(), u64::MAX),
            sync_key: SyncKey::generate(),
        };
        let ci = ConnectionInfo::server("10.0.0.1:5000", "/public/a/b", true, header, 1_000, IvMode::Random);
        assert_eq!(ci.ms_offset, 1_000 - i64::MAX);
        assert_eq!(ci.local_ts(u64::MAX), 1_000);

        let mut ci = ConnectionInfo::client("h", None, true, IvMode::Random);
        ci.ms_offset = 10;
        assert_eq!(ci.local_ts(u64::MAX), i64::MAX as u64);
    }

    #[test]
    fn test_watermark() {
        let mut ci = ConnectionInfo::client("h", None, true, IvMode::Random);
        assert!(ci.accepts_event(1));

        ci.advance_watermark(100);
        assert!(!ci.accepts_event(100));
        assert!(!ci.accepts_event(99));
        assert!(ci.accepts_event(101));

        ci.advance_watermark(50);
        assert_eq!(ci.last_event_ts, 100);
    }

    #[test]
    fn test_merge_identity() {
        let mut ci = ConnectionInfo::client("h", None, true, IvMode::Random);
        ci.client_identity = identity(json!({"userId": "u1", "lang": "en"}));

        assert_eq!(ci.merge_identity(identity(json!({"userId": "u1"}))), None);

        let merged = ci
            .merge_identity(identity(json!({"lang": "hi", "theme": "dark"})))
            .unwrap();
        assert_eq!(merged["userId"], "u1");
        assert_eq!(merged["lang"], "hi");
        assert_eq!(merged["theme"], "dark");
        assert_eq!(ci.client_identity, merged);
    }
}
