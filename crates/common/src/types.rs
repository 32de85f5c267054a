//! Common data types shared between the protocol and gateway crates.
//!
//! Identifiers are plain strings: profile, user-info and public ids are
//! minted by the upstream account system and arrive already-formatted in
//! the connection handshake. The gateway never generates them.

use serde::{Deserialize, Serialize};

/// Default history page size for `join_dialog`.
pub const DEFAULT_PER_PAGE: u32 = 30;

/// Maximum history page size a client may request.
pub const MAX_PER_PAGE: u32 = 100;

/// A history page request (1-based page number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page number, starting at 1.
    pub page: u32,
    /// Items per page.
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Pagination {
    /// Build a pagination from optional client-supplied values, clamping
    /// `per_page` to [`MAX_PER_PAGE`] and `page` to at least 1.
    #[must_use]
    pub fn from_request(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }

    /// Offset of the first item on this page.
    #[must_use]
    pub fn offset(&self) -> usize {
        ((self.page - 1) as usize).saturating_mul(self.per_page as usize)
    }
}

/// Online/offline status of a user, aggregated over all live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// At least one live connection exists.
    Online,
    /// No live connections remain.
    Offline,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let p = Pagination::from_request(None, None);
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, DEFAULT_PER_PAGE);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn test_pagination_clamps() {
        let p = Pagination::from_request(Some(0), Some(10_000));
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, MAX_PER_PAGE);

        let p = Pagination::from_request(Some(3), Some(25));
        assert_eq!(p.offset(), 50);
    }

    #[test]
    fn test_presence_status_serde() {
        let json = serde_json::to_string(&PresenceStatus::Online).unwrap();
        assert_eq!(json, "\"online\"");
    }
}
