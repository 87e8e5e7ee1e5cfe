//! Active transit alerts, the source of `/announcements` and `transit_update`.
//!
//! Equipment outages and delay notices are kept here until their resolution
//! arrives. Threshold breaches are personal to a device and never land here.
//!
//! An interchange station shows up in the feed of every line serving it, so
//! each entry remembers which sources (lines, routes) currently report it.
//! It is raised by the first reporter and cleared by the last one.

use crate::models::{AlertEvent, AlertKind, AlertStatus, Severity};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use uuid::Uuid;

pub const ALL_CLEAR_MESSAGE: &str =
    "All accessible infrastructure is currently fully operational.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementType {
    Alert,
    Info,
}

/// One line of the live announcement feed shown to riders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: AnnouncementType,
    pub subject: String,
    pub severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Announcement {
    fn from_alert(alert: &AlertEvent) -> Self {
        Self {
            id: format!("alert-{}", Uuid::new_v4()),
            content: alert.message.clone(),
            kind: AnnouncementType::Alert,
            subject: alert.subject_id.clone(),
            severity: alert.severity,
            timestamp: alert.occurred_at,
        }
    }

    pub fn all_clear(now: OffsetDateTime) -> Self {
        Self {
            id: format!("info-{}", Uuid::new_v4()),
            content: ALL_CLEAR_MESSAGE.to_string(),
            kind: AnnouncementType::Info,
            subject: "System Wide".to_string(),
            severity: Severity::Low,
            timestamp: now,
        }
    }
}

type BoardKey = (AlertKind, String);

#[derive(Debug)]
struct BoardEntry {
    announcement: Announcement,
    reported_by: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct AlertBoard {
    active: RwLock<BTreeMap<BoardKey, BoardEntry>>,
}

impl AlertBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records raises and resolutions reported by `source`.
    ///
    /// Returns the alerts that changed the active set: a raise nobody else
    /// reported yet, or the resolution from the last source still reporting.
    /// Only these are worth pushing to clients.
    pub fn apply(&self, source: &str, alerts: &[AlertEvent]) -> Vec<AlertEvent> {
        let mut active = self.active.write();
        let mut effective = Vec::new();
        for alert in alerts.iter().filter(|a| a.kind != AlertKind::ThresholdBreach) {
            let key = (alert.kind, alert.subject_id.clone());
            match (alert.status, active.entry(key)) {
                (AlertStatus::Active, Entry::Vacant(slot)) => {
                    slot.insert(BoardEntry {
                        announcement: Announcement::from_alert(alert),
                        reported_by: BTreeSet::from([source.to_string()]),
                    });
                    effective.push(alert.clone());
                }
                (AlertStatus::Active, Entry::Occupied(mut slot)) => {
                    slot.get_mut().reported_by.insert(source.to_string());
                }
                (AlertStatus::Resolved, Entry::Occupied(mut slot)) => {
                    slot.get_mut().reported_by.remove(source);
                    if slot.get().reported_by.is_empty() {
                        slot.remove();
                        effective.push(alert.clone());
                    }
                }
                (AlertStatus::Resolved, Entry::Vacant(_)) => {}
            }
        }
        effective
    }

    pub fn is_active(&self, kind: AlertKind, subject_id: &str) -> bool {
        self.active.read().contains_key(&(kind, subject_id.to_string()))
    }

    /// Any active outage whose subject belongs to `station`.
    pub fn station_has_outage(&self, station: &str) -> bool {
        let prefix = format!("{station}/");
        self.active.read().keys().any(|(kind, subject)| {
            *kind == AlertKind::EquipmentOutage && (subject == station || subject.starts_with(&prefix))
        })
    }

    pub fn active(&self) -> Vec<Announcement> {
        let mut list: Vec<_> = self.active.read().values().map(|e| e.announcement.clone()).collect();
        list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.subject.cmp(&b.subject)));
        list
    }

    /// Active announcements, or a single synthesized all-clear.
    pub fn announcements(&self, now: OffsetDateTime) -> Vec<Announcement> {
        let list = self.active();
        if list.is_empty() {
            vec![Announcement::all_clear(now)]
        } else {
            list
        }
    }

    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn alert(kind: AlertKind, subject: &str, status: AlertStatus) -> AlertEvent {
        AlertEvent {
            kind,
            severity: Severity::High,
            status,
            subject_id: subject.into(),
            message: format!("{subject} changed"),
            occurred_at: datetime!(2026-03-01 10:00:00 UTC),
        }
    }

    #[test]
    fn test_outage_then_resolution_returns_all_clear() {
        let board = AlertBoard::new();
        let raised = board.apply("L2", &[alert(AlertKind::EquipmentOutage, "L2-station-A", AlertStatus::Active)]);
        assert_eq!(raised.len(), 1);
        let list = board.announcements(datetime!(2026-03-01 10:01:00 UTC));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, AnnouncementType::Alert);

        let cleared = board.apply("L2", &[alert(AlertKind::EquipmentOutage, "L2-station-A", AlertStatus::Resolved)]);
        assert_eq!(cleared.len(), 1);
        let list = board.announcements(datetime!(2026-03-01 10:02:00 UTC));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, AnnouncementType::Info);
        assert_eq!(list[0].content, ALL_CLEAR_MESSAGE);
    }

    #[test]
    fn test_duplicate_raise_is_not_a_change() {
        let board = AlertBoard::new();
        let a = alert(AlertKind::DelayNotice, "2045", AlertStatus::Active);
        assert_eq!(board.apply("2045", &[a.clone()]).len(), 1);
        assert!(board.apply("2045", &[a]).is_empty());
        assert!(board.apply("999", &[alert(AlertKind::DelayNotice, "999", AlertStatus::Resolved)]).is_empty());
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn test_shared_equipment_clears_with_last_reporter() {
        let board = AlertBoard::new();
        let down = alert(AlertKind::EquipmentOutage, "Syntagma/E1", AlertStatus::Active);
        let up = alert(AlertKind::EquipmentOutage, "Syntagma/E1", AlertStatus::Resolved);

        assert_eq!(board.apply("2", &[down.clone()]).len(), 1);
        assert!(board.apply("3", &[down]).is_empty());

        assert!(board.apply("3", &[up.clone()]).is_empty());
        assert!(board.station_has_outage("Syntagma"));

        assert_eq!(board.apply("2", &[up]).len(), 1);
        assert!(board.is_empty());
    }

    #[test]
    fn test_threshold_breaches_are_not_announced() {
        let board = AlertBoard::new();
        assert!(board.apply("dev1", &[alert(AlertKind::ThresholdBreach, "dev1", AlertStatus::Active)]).is_empty());
        assert!(board.is_empty());
    }

    #[test]
    fn test_station_outage_lookup() {
        let board = AlertBoard::new();
        board.apply("2", &[alert(AlertKind::EquipmentOutage, "Syntagma/E2", AlertStatus::Active)]);
        assert!(board.station_has_outage("Syntagma"));
        assert!(!board.station_has_outage("Synt"));
        assert!(board.is_active(AlertKind::EquipmentOutage, "Syntagma/E2"));
    }
}
