//! Broadcaster-side book of viewer mic requests

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::types::{UserInfo, ViewerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicStatus {
    Pending,
    Approved,
    Rejected,
    Muted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicRequest {
    pub viewer_id: ViewerId,
    pub user_info: UserInfo,
    pub status: MicStatus,
    pub requested_at: DateTime<Utc>,
}

/// Requests live until approved, rejected or muted; approved viewers are
/// tracked as speakers until muted or gone
#[derive(Default)]
pub struct MicRequestBook {
    requests: Mutex<BTreeMap<ViewerId, MicRequest>>,
    speakers: Mutex<BTreeSet<ViewerId>>,
}

impl MicRequestBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request; a repeated request replaces the previous one
    pub fn record(&self, viewer_id: ViewerId, user_info: UserInfo) -> MicRequest {
        let request = MicRequest {
            viewer_id: viewer_id.clone(),
            user_info,
            status: MicStatus::Pending,
            requested_at: Utc::now(),
        };
        self.requests.lock().insert(viewer_id, request.clone());
        info!(viewer_id = %request.viewer_id, "Mic requested");
        request
    }

    /// Close a pending request; `None` if the viewer has none
    pub fn resolve(&self, viewer_id: &ViewerId, approved: bool) -> Option<MicRequest> {
        let mut request = self.requests.lock().remove(viewer_id)?;
        request.status = if approved {
            self.speakers.lock().insert(viewer_id.clone());
            MicStatus::Approved
        } else {
            MicStatus::Rejected
        };
        Some(request)
    }

    /// Silence a viewer; returns whether it was speaking or asking to
    pub fn mute(&self, viewer_id: &ViewerId) -> bool {
        let pending = self.requests.lock().remove(viewer_id).is_some();
        let speaking = self.speakers.lock().remove(viewer_id);
        pending || speaking
    }

    /// Drop everything about a viewer that left
    pub fn forget(&self, viewer_id: &ViewerId) {
        self.requests.lock().remove(viewer_id);
        self.speakers.lock().remove(viewer_id);
    }

    #[must_use]
    pub fn pending(&self) -> Vec<MicRequest> {
        self.requests.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn speakers(&self) -> Vec<ViewerId> {
        self.speakers.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
        self.speakers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle() {
        let book = MicRequestBook::new();
        let v1 = ViewerId::from("v1");
        let v2 = ViewerId::from("v2");

        book.record(v1.clone(), UserInfo::named("alice"));
        book.record(v2.clone(), UserInfo::named("bob"));
        assert_eq!(book.pending().len(), 2);

        assert_eq!(book.resolve(&v1, true).unwrap().status, MicStatus::Approved);
        assert_eq!(book.resolve(&v2, false).unwrap().status, MicStatus::Rejected);
        assert!(book.resolve(&v2, true).is_none());
        assert!(book.pending().is_empty());
        assert_eq!(book.speakers(), vec![v1.clone()]);

        assert!(book.mute(&v1));
        assert!(!book.mute(&v1));
        assert!(book.speakers().is_empty());
    }
}
