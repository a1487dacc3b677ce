//! Near-duplicate suppression.
//!
//! Upstream triggers fire several notifications for one logical edit (header
//! save, then totals recalculation). A record is suppressed when the same
//! identity was accepted within the trailing window, measured on the
//! source-supplied modification time.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};

use sage_core::{EntityKind, RawChangeRecord};

use crate::config::DedupStrategy;

/// Suppression policy applied to one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Never suppress.
    Disabled,
    /// Compare against the last accepted record of the kind only.
    LastRecord { window: Duration },
    /// Compare against every identity accepted within the window.
    Windowed { window: Duration },
}

#[derive(Debug)]
struct Slot {
    entity_id: String,
    occurred_at: NaiveDateTime,
}

#[derive(Debug)]
enum KindState {
    Disabled,
    LastRecord {
        window: TimeDelta,
        slot: Option<Slot>,
    },
    Windowed {
        window: TimeDelta,
        seen: HashMap<String, NaiveDateTime>,
        newest: Option<NaiveDateTime>,
    },
}

/// `true` when `previous` falls strictly inside the window ending at `current`.
fn within_window(previous: NaiveDateTime, current: NaiveDateTime, window: TimeDelta) -> bool {
    match current.checked_sub_signed(window) {
        Some(cutoff) => previous > cutoff,
        None => true,
    }
}

fn to_delta(window: Duration) -> TimeDelta {
    TimeDelta::milliseconds(window.as_millis().min(i64::MAX as u128) as i64)
}

impl KindState {
    fn new(policy: DedupPolicy) -> Self {
        match policy {
            DedupPolicy::Disabled => KindState::Disabled,
            DedupPolicy::LastRecord { window } => KindState::LastRecord {
                window: to_delta(window),
                slot: None,
            },
            DedupPolicy::Windowed { window } => KindState::Windowed {
                window: to_delta(window),
                seen: HashMap::new(),
                newest: None,
            },
        }
    }

    fn should_suppress(&self, record: &RawChangeRecord) -> bool {
        match self {
            KindState::Disabled => false,
            KindState::LastRecord { window, slot } => slot.as_ref().is_some_and(|s| {
                s.entity_id == record.entity_id
                    && within_window(s.occurred_at, record.occurred_at, *window)
            }),
            KindState::Windowed { window, seen, .. } => seen
                .get(&record.entity_id)
                .is_some_and(|prev| within_window(*prev, record.occurred_at, *window)),
        }
    }

    fn record(&mut self, record: &RawChangeRecord) {
        match self {
            KindState::Disabled => {}
            KindState::LastRecord { slot, .. } => {
                *slot = Some(Slot {
                    entity_id: record.entity_id.clone(),
                    occurred_at: record.occurred_at,
                });
            }
            KindState::Windowed {
                window,
                seen,
                newest,
            } => {
                seen.insert(record.entity_id.clone(), record.occurred_at);
                let latest = match *newest {
                    Some(n) if n > record.occurred_at => n,
                    _ => record.occurred_at,
                };
                *newest = Some(latest);
                let window = *window;
                seen.retain(|_, t| within_window(*t, latest, window));
            }
        }
    }

    fn clear(&mut self) {
        match self {
            KindState::Disabled => {}
            KindState::LastRecord { slot, .. } => *slot = None,
            KindState::Windowed { seen, newest, .. } => {
                seen.clear();
                *newest = None;
            }
        }
    }
}

/// Per-kind duplicate suppression state.
///
/// Documents and generic tables follow the configured strategy; parties are
/// never suppressed here (their identity guard lives in persistence).
#[derive(Debug)]
pub struct Deduplicator {
    document: KindState,
    party: KindState,
    table: KindState,
}

impl Deduplicator {
    pub fn new(strategy: DedupStrategy, window: Duration) -> Self {
        let policy = match strategy {
            DedupStrategy::LastRecord => DedupPolicy::LastRecord { window },
            DedupStrategy::Windowed => DedupPolicy::Windowed { window },
        };
        Self::with_policies(policy, DedupPolicy::Disabled, policy)
    }

    /// Explicit policy for each kind.
    pub fn with_policies(document: DedupPolicy, party: DedupPolicy, table: DedupPolicy) -> Self {
        Self {
            document: KindState::new(document),
            party: KindState::new(party),
            table: KindState::new(table),
        }
    }

    fn state(&self, kind: EntityKind) -> &KindState {
        match kind {
            EntityKind::Document => &self.document,
            EntityKind::Party => &self.party,
            EntityKind::GenericTable => &self.table,
        }
    }

    fn state_mut(&mut self, kind: EntityKind) -> &mut KindState {
        match kind {
            EntityKind::Document => &mut self.document,
            EntityKind::Party => &mut self.party,
            EntityKind::GenericTable => &mut self.table,
        }
    }

    /// Whether `record` repeats an identity accepted within the window.
    pub fn should_suppress(&self, kind: EntityKind, record: &RawChangeRecord) -> bool {
        self.state(kind).should_suppress(record)
    }

    /// Remember `record` as the latest accepted record of its kind.
    pub fn record(&mut self, kind: EntityKind, record: &RawChangeRecord) {
        self.state_mut(kind).record(record);
    }

    /// Check and, when not suppressed, remember. Returns `true` if suppressed.
    pub fn check(&mut self, kind: EntityKind, record: &RawChangeRecord) -> bool {
        if self.should_suppress(kind, record) {
            return true;
        }
        self.record(kind, record);
        false
    }

    /// Forget every remembered record.
    pub fn clear(&mut self) {
        for kind in EntityKind::ALL {
            self.state_mut(kind).clear();
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(
            DedupStrategy::default(),
            Duration::from_millis(sage_core::defaults::DEDUP_WINDOW_MS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::NaiveDate;
    use sage_core::{OperationKind, RecordDetail};

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn doc(id: &str, offset_ms: i64) -> RawChangeRecord {
        RawChangeRecord {
            operation: OperationKind::Update,
            entity_id: id.to_string(),
            occurred_at: base() + TimeDelta::milliseconds(offset_ms),
            detail: RecordDetail::Document {
                domain: 0,
                subtype: 6,
                total_amount: BigDecimal::from(10),
            },
        }
    }

    fn party(id: &str, offset_ms: i64) -> RawChangeRecord {
        RawChangeRecord {
            operation: OperationKind::Update,
            entity_id: id.to_string(),
            occurred_at: base() + TimeDelta::milliseconds(offset_ms),
            detail: RecordDetail::Party { party_type: 0 },
        }
    }

    fn table_row(id: &str, offset_ms: i64) -> RawChangeRecord {
        RawChangeRecord {
            operation: OperationKind::Update,
            entity_id: id.to_string(),
            occurred_at: base() + TimeDelta::milliseconds(offset_ms),
            detail: RecordDetail::Table {
                domain: 0,
                subtype: 1,
            },
        }
    }

    fn run(dedup: &mut Deduplicator, records: &[RawChangeRecord]) -> Vec<bool> {
        records
            .iter()
            .map(|r| dedup.check(r.entity_kind(), r))
            .collect()
    }

    #[test]
    fn test_repeat_within_window_suppressed() {
        let mut dedup = Deduplicator::default();
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), doc("X", 1_000)]),
            vec![false, true]
        );
    }

    #[test]
    fn test_table_repeat_within_window_suppressed() {
        let mut dedup = Deduplicator::new(DedupStrategy::LastRecord, Duration::from_secs(2));
        assert_eq!(
            run(
                &mut dedup,
                &[
                    table_row("L1", 0),
                    table_row("L1", 1_500),
                    table_row("L1", 3_600),
                    table_row("L2", 3_700),
                ]
            ),
            vec![false, true, false, false]
        );
    }

    #[test]
    fn test_table_slot_independent_of_document_slot() {
        let mut dedup = Deduplicator::default();
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), table_row("X", 100), doc("X", 200)]),
            vec![false, false, true]
        );
    }

    #[test]
    fn test_repeat_after_window_kept() {
        let mut dedup = Deduplicator::default();
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), doc("X", 3_000)]),
            vec![false, false]
        );
    }

    #[test]
    fn test_exact_window_boundary_kept() {
        let mut dedup = Deduplicator::default();
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), doc("X", 2_000)]),
            vec![false, false]
        );
    }

    #[test]
    fn test_interleaved_identity_defeats_single_slot() {
        let mut dedup = Deduplicator::default();
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), doc("Y", 100), doc("X", 200)]),
            vec![false, false, false]
        );
    }

    #[test]
    fn test_windowed_strategy_catches_interleaved_repeat() {
        let mut dedup = Deduplicator::new(DedupStrategy::Windowed, Duration::from_secs(2));
        assert_eq!(
            run(
                &mut dedup,
                &[doc("X", 0), doc("Y", 100), doc("X", 200), doc("X", 2_100)]
            ),
            vec![false, false, true, false]
        );
    }

    #[test]
    fn test_windowed_strategy_evicts_old_identities() {
        let mut dedup = Deduplicator::new(DedupStrategy::Windowed, Duration::from_secs(2));
        run(&mut dedup, &[doc("X", 0), doc("Y", 5_000)]);
        match &dedup.document {
            KindState::Windowed { seen, .. } => {
                assert_eq!(seen.len(), 1);
                assert!(seen.contains_key("Y"));
            }
            other => panic!("Expected windowed state, got {:?}", other),
        }
    }

    #[test]
    fn test_suppressed_record_does_not_refresh_slot() {
        let mut dedup = Deduplicator::default();
        // 1.5s is suppressed against 0s; 2.5s is compared to 0s, not 1.5s.
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), doc("X", 1_500), doc("X", 2_500)]),
            vec![false, true, false]
        );
    }

    #[test]
    fn test_party_never_suppressed() {
        let mut dedup = Deduplicator::default();
        assert_eq!(
            run(&mut dedup, &[party("C1", 0), party("C1", 10)]),
            vec![false, false]
        );
    }

    #[test]
    fn test_kinds_have_independent_slots() {
        let mut dedup = Deduplicator::with_policies(
            DedupPolicy::LastRecord {
                window: Duration::from_secs(2),
            },
            DedupPolicy::LastRecord {
                window: Duration::from_secs(2),
            },
            DedupPolicy::Disabled,
        );
        assert_eq!(
            run(&mut dedup, &[doc("X", 0), party("X", 100), doc("X", 200)]),
            vec![false, false, true]
        );
    }

    #[test]
    fn test_clear_forgets_state() {
        let mut dedup = Deduplicator::default();
        run(&mut dedup, &[doc("X", 0)]);
        dedup.clear();
        assert!(!dedup.should_suppress(EntityKind::Document, &doc("X", 100)));
    }
}
