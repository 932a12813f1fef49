//! ULID-based server identifiers.
//!
//! Generated ids follow the pattern `srv_ulid`, for example
//! `srv_01hqxyz...`. The ULID part makes ids ascending: newer = larger.

use ulid::Ulid;

/// Prefix on every generated server identifier.
pub const SERVER_ID_PREFIX: &str = "srv";

/// Identifier generation and parsing utilities.
pub struct Identifier;

impl Identifier {
    /// Generate a new server identifier.
    pub fn server() -> String {
        format!("{SERVER_ID_PREFIX}_{}", Ulid::new().to_string().to_lowercase())
    }

    /// Extract the ULID from a generated server identifier.
    ///
    /// Returns `None` for caller-chosen ids that do not follow the
    /// generated pattern.
    pub fn parse_server(id: &str) -> Option<Ulid> {
        let rest = id.strip_prefix(SERVER_ID_PREFIX)?.strip_prefix('_')?;
        Ulid::from_string(rest).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_shape() {
        let id = Identifier::server();
        assert!(id.starts_with("srv_"));
        assert_eq!(id.len(), 30); // "srv_" (4) + ULID (26)
    }

    #[test]
    fn test_server_ids_ascend() {
        let id1 = Identifier::server();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = Identifier::server();
        assert!(id1 < id2, "ids should increase over time");
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = Identifier::server();
        assert!(Identifier::parse_server(&id).is_some());
    }

    #[test]
    fn test_parse_rejects_foreign_ids() {
        assert!(Identifier::parse_server("nounderscore").is_none());
        assert!(Identifier::parse_server("srv_notaulid").is_none());
        assert!(Identifier::parse_server("evt_01hqxyz").is_none());
    }
}
