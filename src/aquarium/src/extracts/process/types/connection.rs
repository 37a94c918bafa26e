use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    ParentChild,
    SharedPort,
    SharedSocket,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::ParentChild => write!(f, "parent-child"),
            ConnectionKind::SharedPort => write!(f, "shared-port"),
            ConnectionKind::SharedSocket => write!(f, "shared-socket"),
        }
    }
}

/// An inferred relationship between two pids. The pair is unordered and stored with
/// `id_a < id_b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub id_a: u32,
    pub id_b: u32,
    pub kind: ConnectionKind,
    pub metadata: BTreeMap<String, String>,
}

impl Connection {
    /// Returns `None` for a pid paired with itself.
    pub fn between(a: u32, b: u32, kind: ConnectionKind) -> Option<Self> {
        if a == b {
            return None;
        }
        Some(Self {
            id_a: a.min(b),
            id_b: a.max(b),
            kind,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn pair(&self) -> (u32, u32) {
        (self.id_a, self.id_b)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_canonical() {
        let conn = Connection::between(9, 3, ConnectionKind::SharedPort).unwrap();
        assert_eq!(conn.pair(), (3, 9));
        assert_eq!(conn.kind, ConnectionKind::SharedPort);
    }

    #[test]
    fn test_self_pair_rejected() {
        assert!(Connection::between(4, 4, ConnectionKind::SharedSocket).is_none());
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ConnectionKind::ParentChild).unwrap();
        assert_eq!(json, "\"parent-child\"");
    }
}
