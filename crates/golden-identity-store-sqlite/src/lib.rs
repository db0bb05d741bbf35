#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use golden_identity_core::{
    build_golden_records, change_for_version, check_history_invariants, derive_change_events,
    detect_conflicts, format_rfc3339, now_utc, parse_rfc3339_utc, plan_history, plan_resolution,
    score_pairs, AttributeConflict, CandidatePair, ChangeEvent, ChangePayload, ChangeType,
    ClusterMember, CustomerAttribute, EngineConfig, GlobalCustomerId, GoldenCustomerRecord,
    GoldenSnapshot, HistoryEntry, IdentityError, IdentityInputRecord, IdentityMapEntry,
    MatchCandidate, MatchDecision, MatchRules, MergeProposal, PairSide, PendingChangeEvent,
    RecordRef, ResolutionConfig, RetiredGlobalId, SurvivorshipConfig,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const GOLDEN_IDENTITY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_GOLDEN_IDENTITY_V1: &str = r"
CREATE TABLE IF NOT EXISTS identity_inputs (
  source_system TEXT NOT NULL,
  source_record_id TEXT NOT NULL,
  normalized_email TEXT,
  normalized_phone TEXT,
  normalized_name TEXT,
  event_ts TEXT NOT NULL,
  PRIMARY KEY (source_system, source_record_id)
);

CREATE TABLE IF NOT EXISTS blocked_pairs (
  pair_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  left_source_system TEXT NOT NULL,
  left_source_record_id TEXT NOT NULL,
  left_email TEXT,
  left_phone TEXT,
  left_name TEXT,
  right_source_system TEXT NOT NULL,
  right_source_record_id TEXT NOT NULL,
  right_email TEXT,
  right_phone TEXT,
  right_name TEXT
);

CREATE TABLE IF NOT EXISTS match_candidates (
  candidate_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  left_source_system TEXT NOT NULL,
  left_source_record_id TEXT NOT NULL,
  right_source_system TEXT NOT NULL,
  right_source_record_id TEXT NOT NULL,
  email_score INTEGER NOT NULL CHECK (email_score >= 0),
  phone_score INTEGER NOT NULL CHECK (phone_score >= 0),
  name_score INTEGER NOT NULL CHECK (name_score >= 0),
  total_score INTEGER NOT NULL CHECK (total_score >= 0),
  decision TEXT NOT NULL CHECK (decision IN ('AUTO_MERGE', 'FLAG_REVIEW', 'REJECT')),
  evaluated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_map (
  source_system TEXT NOT NULL,
  source_record_id TEXT NOT NULL,
  global_customer_id TEXT NOT NULL,
  confidence_score INTEGER NOT NULL CHECK (confidence_score >= 0),
  decision TEXT NOT NULL CHECK (decision IN ('AUTO_MERGE', 'FLAG_REVIEW')),
  decided_at TEXT NOT NULL,
  PRIMARY KEY (source_system, source_record_id)
);

CREATE INDEX IF NOT EXISTS idx_identity_map_global_id
  ON identity_map(global_customer_id);

CREATE TRIGGER IF NOT EXISTS trg_identity_map_no_delete
BEFORE DELETE ON identity_map
BEGIN
  SELECT RAISE(FAIL, 'identity_map is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_identity_map_keys_immutable
BEFORE UPDATE OF source_system, source_record_id ON identity_map
BEGIN
  SELECT RAISE(FAIL, 'identity_map source keys are immutable');
END;

CREATE TABLE IF NOT EXISTS identity_merges (
  merge_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  retired_id TEXT NOT NULL UNIQUE,
  surviving_id TEXT NOT NULL CHECK (surviving_id <> retired_id),
  reassigned_records INTEGER NOT NULL CHECK (reassigned_records >= 0),
  merged_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_identity_merges_no_update
BEFORE UPDATE ON identity_merges
BEGIN
  SELECT RAISE(FAIL, 'identity_merges is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_identity_merges_no_delete
BEFORE DELETE ON identity_merges
BEGIN
  SELECT RAISE(FAIL, 'identity_merges is append-only');
END;

CREATE TABLE IF NOT EXISTS merge_proposals (
  proposal_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  left_source_system TEXT NOT NULL,
  left_source_record_id TEXT NOT NULL,
  right_source_system TEXT NOT NULL,
  right_source_record_id TEXT NOT NULL,
  total_score INTEGER NOT NULL CHECK (total_score >= 0),
  proposed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS golden_customers (
  global_customer_id TEXT PRIMARY KEY,
  canonical_email TEXT,
  canonical_phone TEXT,
  canonical_name TEXT,
  record_count INTEGER NOT NULL CHECK (record_count >= 1),
  survivorship_snapshot TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS golden_customer_history (
  history_id INTEGER PRIMARY KEY AUTOINCREMENT,
  global_customer_id TEXT NOT NULL,
  canonical_email TEXT,
  canonical_phone TEXT,
  canonical_name TEXT,
  record_count INTEGER NOT NULL CHECK (record_count >= 0),
  survivorship_snapshot TEXT NOT NULL,
  valid_from TEXT NOT NULL,
  valid_to TEXT,
  is_current INTEGER NOT NULL CHECK (is_current IN (0, 1)),
  CHECK (
    (is_current = 1 AND valid_to IS NULL)
    OR (is_current = 0 AND valid_to IS NOT NULL)
  )
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_golden_customer_history_current
  ON golden_customer_history(global_customer_id)
  WHERE is_current = 1;

CREATE INDEX IF NOT EXISTS idx_golden_customer_history_global_id
  ON golden_customer_history(global_customer_id, history_id);

CREATE TRIGGER IF NOT EXISTS trg_golden_customer_history_no_delete
BEFORE DELETE ON golden_customer_history
BEGIN
  SELECT RAISE(FAIL, 'golden_customer_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_golden_customer_history_expiry_only
BEFORE UPDATE ON golden_customer_history
WHEN NOT (
  OLD.is_current = 1
  AND NEW.is_current = 0
  AND NEW.valid_to IS NOT NULL
  AND NEW.history_id = OLD.history_id
  AND NEW.global_customer_id = OLD.global_customer_id
  AND NEW.canonical_email IS OLD.canonical_email
  AND NEW.canonical_phone IS OLD.canonical_phone
  AND NEW.canonical_name IS OLD.canonical_name
  AND NEW.record_count = OLD.record_count
  AND NEW.survivorship_snapshot = OLD.survivorship_snapshot
  AND NEW.valid_from = OLD.valid_from
)
BEGIN
  SELECT RAISE(FAIL, 'golden_customer_history rows only permit a single expiry');
END;

CREATE TABLE IF NOT EXISTS change_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  history_id INTEGER NOT NULL UNIQUE REFERENCES golden_customer_history(history_id),
  global_customer_id TEXT NOT NULL,
  change_type TEXT NOT NULL CHECK (change_type IN ('INSERT', 'UPDATE')),
  old_snapshot TEXT,
  new_snapshot TEXT NOT NULL,
  changed_at TEXT NOT NULL,
  CHECK (
    (change_type = 'INSERT' AND old_snapshot IS NULL)
    OR (change_type = 'UPDATE' AND old_snapshot IS NOT NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_change_events_global_id
  ON change_events(global_customer_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_change_events_no_update
BEFORE UPDATE ON change_events
BEGIN
  SELECT RAISE(FAIL, 'change_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_change_events_no_delete
BEFORE DELETE ON change_events
BEGIN
  SELECT RAISE(FAIL, 'change_events is append-only');
END;

CREATE TABLE IF NOT EXISTS attribute_conflicts (
  global_customer_id TEXT NOT NULL,
  attribute_name TEXT NOT NULL CHECK (attribute_name IN ('email', 'phone', 'name')),
  distinct_value_count INTEGER NOT NULL CHECK (distinct_value_count > 1),
  detected_at TEXT NOT NULL,
  PRIMARY KEY (global_customer_id, attribute_name)
);

CREATE TABLE IF NOT EXISTS stage_runs (
  run_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  stage TEXT NOT NULL CHECK (
    stage IN ('score', 'resolve', 'golden', 'history', 'events', 'conflicts')
  ),
  status TEXT NOT NULL CHECK (status IN ('succeeded', 'failed')),
  processed INTEGER NOT NULL,
  inserted INTEGER NOT NULL,
  updated INTEGER NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  error TEXT
);
";

/// Tables rebuilt from scratch by their owning stage. Nothing outside this
/// set may be truncated.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum DerivedTable {
    MatchCandidates,
    MergeProposals,
    GoldenCustomers,
    AttributeConflicts,
}

impl DerivedTable {
    fn table_name(self) -> &'static str {
        match self {
            Self::MatchCandidates => "match_candidates",
            Self::MergeProposals => "merge_proposals",
            Self::GoldenCustomers => "golden_customers",
            Self::AttributeConflicts => "attribute_conflicts",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Score,
    Resolve,
    Golden,
    History,
    Events,
    Conflicts,
}

impl Stage {
    /// Pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Score,
        Self::Resolve,
        Self::Golden,
        Self::History,
        Self::Events,
        Self::Conflicts,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::Resolve => "resolve",
            Self::Golden => "golden",
            Self::History => "history",
            Self::Events => "events",
            Self::Conflicts => "conflicts",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

impl StageStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
struct StageCounts {
    processed: usize,
    inserted: usize,
    updated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub processed: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineReport {
    #[serde(with = "time::serde::rfc3339")]
    pub run_at: OffsetDateTime,
    pub succeeded: bool,
    pub stages: Vec<StageReport>,
    pub failure: Option<StageFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRun {
    pub run_seq: i64,
    pub stage: Stage,
    pub status: StageStatus,
    pub processed: i64,
    pub inserted: i64,
    pub updated: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityCheck {
    pub healthy: bool,
    pub table_counts: BTreeMap<String, i64>,
    pub issues: Vec<IntegrityIssue>,
}

pub struct SqliteGoldenStore {
    conn: Connection,
}

impl SqliteGoldenStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_GOLDEN_IDENTITY_V1)
            .context("failed to apply golden identity schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![GOLDEN_IDENTITY_MIGRATION_VERSION, now],
            )
            .context("failed to register golden identity schema migration")?;

        Ok(())
    }

    /// Replaces the staged input records wholesale.
    pub fn replace_identity_inputs(&mut self, inputs: &[IdentityInputRecord]) -> Result<usize> {
        for input in inputs {
            input
                .validate()
                .with_context(|| format!("invalid input record {}", input.reference()))?;
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start input import transaction")?;
        tx.execute("DELETE FROM identity_inputs", [])
            .context("failed to clear identity_inputs")?;

        for input in inputs {
            tx.execute(
                "INSERT INTO identity_inputs(
                    source_system, source_record_id,
                    normalized_email, normalized_phone, normalized_name, event_ts
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    input.source_system,
                    input.source_record_id,
                    input.normalized_email,
                    input.normalized_phone,
                    input.normalized_name,
                    format_rfc3339(input.event_ts)?,
                ],
            )
            .with_context(|| format!("failed to stage input record {}", input.reference()))?;
        }

        tx.commit().context("failed to commit input import")?;
        info!(records = inputs.len(), "staged identity inputs");
        Ok(inputs.len())
    }

    /// Replaces the staged blocked pairs wholesale.
    pub fn replace_blocked_pairs(&mut self, pairs: &[CandidatePair]) -> Result<usize> {
        for pair in pairs {
            pair.validate().context("invalid blocked pair")?;
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start pair import transaction")?;
        tx.execute("DELETE FROM blocked_pairs", [])
            .context("failed to clear blocked_pairs")?;

        for pair in pairs {
            tx.execute(
                "INSERT INTO blocked_pairs(
                    left_source_system, left_source_record_id,
                    left_email, left_phone, left_name,
                    right_source_system, right_source_record_id,
                    right_email, right_phone, right_name
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    pair.left.reference.source_system,
                    pair.left.reference.source_record_id,
                    pair.left.email,
                    pair.left.phone,
                    pair.left.name,
                    pair.right.reference.source_system,
                    pair.right.reference.source_record_id,
                    pair.right.email,
                    pair.right.phone,
                    pair.right.name,
                ],
            )
            .context("failed to stage blocked pair")?;
        }

        tx.commit().context("failed to commit pair import")?;
        info!(pairs = pairs.len(), "staged blocked pairs");
        Ok(pairs.len())
    }

    /// Runs every stage in order, stopping at the first failure.
    ///
    /// An invalid configuration is returned as an error before any stage
    /// runs. Stage failures are reported in [`PipelineReport::failure`].
    pub fn run_pipeline(
        &mut self,
        config: &EngineConfig,
        now: OffsetDateTime,
    ) -> Result<PipelineReport> {
        config
            .validate()
            .context("engine configuration rejected before pipeline start")?;

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut failure = None;
        for stage in Stage::ALL {
            match self.run_stage(stage, config, now) {
                Ok(report) => stages.push(report),
                Err(err) => {
                    failure = Some(StageFailure {
                        stage,
                        processed: 0,
                        error: format!("{err:#}"),
                    });
                    break;
                }
            }
        }

        let succeeded = failure.is_none();
        info!(
            succeeded,
            completed_stages = stages.len(),
            "pipeline finished"
        );
        Ok(PipelineReport {
            run_at: now,
            succeeded,
            stages,
            failure,
        })
    }

    pub fn run_stage(
        &mut self,
        stage: Stage,
        config: &EngineConfig,
        now: OffsetDateTime,
    ) -> Result<StageReport> {
        match stage {
            Stage::Score => self.score_candidates(&config.match_rules, now),
            Stage::Resolve => self.resolve_identities(&config.resolution, now),
            Stage::Golden => self.build_golden_records(&config.survivorship, now),
            Stage::History => self.track_history(now),
            Stage::Events => self.emit_change_events(now),
            Stage::Conflicts => self.detect_conflicts(now),
        }
    }

    pub fn score_candidates(
        &mut self,
        rules: &MatchRules,
        now: OffsetDateTime,
    ) -> Result<StageReport> {
        self.execute_stage(Stage::Score, |conn| score_stage(conn, rules, now))
    }

    pub fn resolve_identities(
        &mut self,
        config: &ResolutionConfig,
        now: OffsetDateTime,
    ) -> Result<StageReport> {
        self.execute_stage(Stage::Resolve, |conn| resolve_stage(conn, config, now))
    }

    pub fn build_golden_records(
        &mut self,
        config: &SurvivorshipConfig,
        now: OffsetDateTime,
    ) -> Result<StageReport> {
        self.execute_stage(Stage::Golden, |conn| golden_stage(conn, config, now))
    }

    /// Versions golden records and emits one change event per new current
    /// row in the same transaction.
    pub fn track_history(&mut self, now: OffsetDateTime) -> Result<StageReport> {
        self.execute_stage(Stage::History, |conn| history_stage(conn, now))
    }

    /// Emits events for current history rows that have none yet.
    pub fn emit_change_events(&mut self, now: OffsetDateTime) -> Result<StageReport> {
        self.execute_stage(Stage::Events, |conn| events_stage(conn, now))
    }

    pub fn detect_conflicts(&mut self, now: OffsetDateTime) -> Result<StageReport> {
        self.execute_stage(Stage::Conflicts, |conn| conflicts_stage(conn, now))
    }

    pub fn list_identity_map(
        &self,
        global_id: Option<GlobalCustomerId>,
    ) -> Result<Vec<IdentityMapEntry>> {
        load_identity_map(&self.conn, global_id)
    }

    pub fn global_id_for(&self, record: &RecordRef) -> Result<Option<GlobalCustomerId>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT global_customer_id FROM identity_map
                 WHERE source_system = ?1 AND source_record_id = ?2",
                params![record.source_system, record.source_record_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up global id for {record}"))?;

        raw.as_deref()
            .map(GlobalCustomerId::parse)
            .transpose()
            .map_err(anyhow::Error::from)
    }

    pub fn list_match_candidates(&self) -> Result<Vec<MatchCandidate>> {
        load_match_candidates(&self.conn)
    }

    pub fn list_merge_proposals(&self) -> Result<Vec<MergeProposal>> {
        let mut stmt = self.conn.prepare(
            "SELECT left_source_system, left_source_record_id,
                    right_source_system, right_source_record_id,
                    total_score, proposed_at
             FROM merge_proposals
             ORDER BY proposal_seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MergeProposal {
                left_ref: RecordRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                right_ref: RecordRef::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
                total_score: row.get(4)?,
                proposed_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn list_retired_ids(&self) -> Result<Vec<RetiredGlobalId>> {
        let mut stmt = self.conn.prepare(
            "SELECT retired_id, surviving_id, reassigned_records, merged_at
             FROM identity_merges
             ORDER BY merge_seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RetiredGlobalId {
                retired_id: parse_global_id(0, &row.get::<_, String>(0)?)?,
                surviving_id: parse_global_id(1, &row.get::<_, String>(1)?)?,
                reassigned_records: row.get(2)?,
                merged_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn list_golden_records(
        &self,
        global_id: Option<GlobalCustomerId>,
    ) -> Result<Vec<GoldenCustomerRecord>> {
        load_golden_records(&self.conn, global_id)
    }

    pub fn list_history(&self, global_id: Option<GlobalCustomerId>) -> Result<Vec<HistoryEntry>> {
        load_history(&self.conn, global_id, false)
    }

    pub fn list_change_events(
        &self,
        global_id: Option<GlobalCustomerId>,
    ) -> Result<Vec<ChangeEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, history_id, global_customer_id, change_type,
                    old_snapshot, new_snapshot, changed_at
             FROM change_events
             WHERE ?1 IS NULL OR global_customer_id = ?1
             ORDER BY event_seq ASC",
        )?;
        let rows = stmt.query_map(
            params![global_id.map(|id| id.to_string())],
            parse_change_event_row,
        )?;
        collect_rows(rows)
    }

    pub fn list_conflicts(
        &self,
        global_id: Option<GlobalCustomerId>,
    ) -> Result<Vec<AttributeConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT global_customer_id, attribute_name, distinct_value_count, detected_at
             FROM attribute_conflicts
             WHERE ?1 IS NULL OR global_customer_id = ?1
             ORDER BY global_customer_id ASC, attribute_name ASC",
        )?;
        let rows = stmt.query_map(params![global_id.map(|id| id.to_string())], |row| {
            let attribute_raw: String = row.get(1)?;
            let attribute = CustomerAttribute::parse(&attribute_raw).ok_or_else(|| {
                invalid_column(
                    1,
                    rusqlite::types::Type::Text,
                    format!("invalid attribute_name: {attribute_raw}"),
                )
            })?;
            Ok(AttributeConflict {
                global_customer_id: parse_global_id(0, &row.get::<_, String>(0)?)?,
                attribute,
                distinct_value_count: row.get(2)?,
                detected_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn list_stage_runs(&self, limit: Option<usize>) -> Result<Vec<StageRun>> {
        let mut query = "SELECT run_seq, stage, status, processed, inserted, updated,
                    started_at, finished_at, error
             FROM stage_runs
             ORDER BY run_seq DESC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            let stage_raw: String = row.get(1)?;
            let status_raw: String = row.get(2)?;
            let stage = Stage::parse(&stage_raw).ok_or_else(|| {
                invalid_column(
                    1,
                    rusqlite::types::Type::Text,
                    format!("invalid stage: {stage_raw}"),
                )
            })?;
            let status = StageStatus::parse(&status_raw).ok_or_else(|| {
                invalid_column(
                    2,
                    rusqlite::types::Type::Text,
                    format!("invalid status: {status_raw}"),
                )
            })?;
            Ok(StageRun {
                run_seq: row.get(0)?,
                stage,
                status,
                processed: row.get(3)?,
                inserted: row.get(4)?,
                updated: row.get(5)?,
                started_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
                finished_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
                error: row.get(8)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Cross-table invariant check. Errors make the store unhealthy;
    /// warnings name work a later stage run would do.
    pub fn check_integrity(&self) -> Result<IntegrityCheck> {
        let mut table_counts = BTreeMap::new();
        for table in [
            "identity_inputs",
            "blocked_pairs",
            "match_candidates",
            "identity_map",
            "identity_merges",
            "merge_proposals",
            "golden_customers",
            "golden_customer_history",
            "change_events",
            "attribute_conflicts",
            "stage_runs",
        ] {
            let count = self.count(&format!("SELECT COUNT(*) FROM {table}"))?;
            table_counts.insert(table.to_string(), count);
        }

        let mut issues = Vec::new();

        for violation in check_history_invariants(&self.list_history(None)?) {
            issues.push(IntegrityIssue {
                code: violation.code,
                severity: IntegrityIssueSeverity::Error,
                message: format!("{}: {}", violation.global_customer_id, violation.message),
            });
        }

        let retired_in_use = self.count(
            "SELECT COUNT(*) FROM identity_map
             WHERE global_customer_id IN (SELECT retired_id FROM identity_merges)",
        )?;
        if retired_in_use > 0 {
            issues.push(IntegrityIssue {
                code: "mapping_holds_retired_id".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("{retired_in_use} mapping entries still hold a retired global id"),
            });
        }

        let duplicate_events = self.count(
            "SELECT COUNT(*) FROM (
                SELECT history_id FROM change_events GROUP BY history_id HAVING COUNT(*) > 1
             )",
        )?;
        if duplicate_events > 0 {
            issues.push(IntegrityIssue {
                code: "duplicate_change_events".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("{duplicate_events} history rows have more than one change event"),
            });
        }

        let stale_golden = self.count(
            "SELECT COUNT(*) FROM golden_customers
             WHERE global_customer_id NOT IN (SELECT global_customer_id FROM identity_map)",
        )?;
        if stale_golden > 0 {
            issues.push(IntegrityIssue {
                code: "stale_golden_records".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!(
                    "{stale_golden} golden records name ids absent from the mapping; rerun golden"
                ),
            });
        }

        let unversioned = self.count(
            "SELECT COUNT(*) FROM golden_customers golden
             WHERE NOT EXISTS (
                SELECT 1 FROM golden_customer_history history
                WHERE history.global_customer_id = golden.global_customer_id
                  AND history.is_current = 1
             )",
        )?;
        if unversioned > 0 {
            issues.push(IntegrityIssue {
                code: "history_behind_golden".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!(
                    "{unversioned} golden records have no current history row; rerun history"
                ),
            });
        }

        let missing_events = self.count(
            "SELECT COUNT(*) FROM golden_customer_history history
             WHERE history.is_current = 1
               AND NOT EXISTS (
                SELECT 1 FROM change_events event WHERE event.history_id = history.history_id
               )",
        )?;
        if missing_events > 0 {
            issues.push(IntegrityIssue {
                code: "missing_change_events".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!(
                    "{missing_events} current history rows have no change event; rerun events"
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityCheck {
            healthy,
            table_counts,
            issues,
        })
    }

    fn count(&self, query: &str) -> Result<i64> {
        self.conn
            .query_row(query, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {query}"))
    }

    fn execute_stage<F>(&mut self, stage: Stage, work: F) -> Result<StageReport>
    where
        F: FnOnce(&Connection) -> Result<StageCounts>,
    {
        let started_at = now_utc();
        let timer = Instant::now();
        let outcome = self.within_transaction(work);
        let finished_at = now_utc();
        let elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(counts) => {
                info!(
                    stage = stage.as_str(),
                    processed = counts.processed,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    elapsed_ms,
                    "stage succeeded"
                );
                self.record_stage_run(
                    stage,
                    StageStatus::Succeeded,
                    counts,
                    started_at,
                    finished_at,
                    None,
                )?;
                Ok(StageReport {
                    stage,
                    processed: counts.processed,
                    inserted: counts.inserted,
                    updated: counts.updated,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(
                    stage = stage.as_str(),
                    elapsed_ms,
                    error = %message,
                    "stage failed and rolled back"
                );
                if let Err(log_err) = self.record_stage_run(
                    stage,
                    StageStatus::Failed,
                    StageCounts::default(),
                    started_at,
                    finished_at,
                    Some(&message),
                ) {
                    warn!(stage = stage.as_str(), error = %log_err, "failed to record stage run");
                }
                Err(err.context(format!("stage {} failed", stage.as_str())))
            }
        }
    }

    fn within_transaction<F>(&mut self, work: F) -> Result<StageCounts>
    where
        F: FnOnce(&Connection) -> Result<StageCounts>,
    {
        let tx = self
            .conn
            .transaction()
            .context("failed to start stage transaction")?;
        let counts = work(&tx)?;
        tx.commit().context("failed to commit stage transaction")?;
        Ok(counts)
    }

    fn record_stage_run(
        &self,
        stage: Stage,
        status: StageStatus,
        counts: StageCounts,
        started_at: OffsetDateTime,
        finished_at: OffsetDateTime,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO stage_runs(
                    stage, status, processed, inserted, updated, started_at, finished_at, error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    stage.as_str(),
                    status.as_str(),
                    sql_count(counts.processed),
                    sql_count(counts.inserted),
                    sql_count(counts.updated),
                    format_rfc3339(started_at)?,
                    format_rfc3339(finished_at)?,
                    error,
                ],
            )
            .context("failed to record stage run")?;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn score_stage(conn: &Connection, rules: &MatchRules, now: OffsetDateTime) -> Result<StageCounts> {
    let pairs = load_blocked_pairs(conn)?;
    let candidates = score_pairs(&pairs, rules, now)?;

    truncate_derived(conn, DerivedTable::MatchCandidates)?;
    let evaluated_at = format_rfc3339(now)?;
    for candidate in &candidates {
        conn.execute(
            "INSERT INTO match_candidates(
                left_source_system, left_source_record_id,
                right_source_system, right_source_record_id,
                email_score, phone_score, name_score, total_score,
                decision, evaluated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                candidate.left_ref.source_system,
                candidate.left_ref.source_record_id,
                candidate.right_ref.source_system,
                candidate.right_ref.source_record_id,
                candidate.email_score,
                candidate.phone_score,
                candidate.name_score,
                candidate.total_score,
                candidate.decision.as_str(),
                evaluated_at,
            ],
        )
        .context("failed to insert match candidate")?;
    }

    Ok(StageCounts {
        processed: pairs.len(),
        inserted: candidates.len(),
        updated: 0,
    })
}

fn resolve_stage(
    conn: &Connection,
    config: &ResolutionConfig,
    now: OffsetDateTime,
) -> Result<StageCounts> {
    let existing = load_identity_map(conn, None)?;
    let candidates = load_match_candidates(conn)?;
    let plan = plan_resolution(&existing, &candidates, config, now, GlobalCustomerId::mint)?;

    let decided_at = format_rfc3339(now)?;
    let mut updated = 0_usize;
    for reassignment in &plan.reassignments {
        let moved = conn
            .execute(
                "UPDATE identity_map SET global_customer_id = ?1 WHERE global_customer_id = ?2",
                params![
                    reassignment.surviving_id.to_string(),
                    reassignment.retired_id.to_string()
                ],
            )
            .with_context(|| format!("failed to reassign {}", reassignment.retired_id))?;
        if u32::try_from(moved).ok() != Some(reassignment.affected_records) {
            return Err(IdentityError::Consistency(format!(
                "retiring {} moved {moved} entries, expected {}",
                reassignment.retired_id, reassignment.affected_records
            ))
            .into());
        }

        conn.execute(
            "INSERT INTO identity_merges(retired_id, surviving_id, reassigned_records, merged_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                reassignment.retired_id.to_string(),
                reassignment.surviving_id.to_string(),
                reassignment.affected_records,
                decided_at,
            ],
        )
        .with_context(|| format!("failed to audit retirement of {}", reassignment.retired_id))?;

        info!(
            retired = %reassignment.retired_id,
            surviving = %reassignment.surviving_id,
            records = reassignment.affected_records,
            "retired global customer id"
        );
        updated += moved;
    }

    let mut inserted = 0_usize;
    for entry in &plan.new_entries {
        inserted += conn
            .execute(
                "INSERT OR IGNORE INTO identity_map(
                    source_system, source_record_id, global_customer_id,
                    confidence_score, decision, decided_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.record.source_system,
                    entry.record.source_record_id,
                    entry.global_customer_id.to_string(),
                    entry.confidence_score,
                    entry.decision.as_str(),
                    decided_at,
                ],
            )
            .with_context(|| format!("failed to map {}", entry.record))?;
    }

    truncate_derived(conn, DerivedTable::MergeProposals)?;
    for proposal in &plan.proposals {
        conn.execute(
            "INSERT INTO merge_proposals(
                left_source_system, left_source_record_id,
                right_source_system, right_source_record_id,
                total_score, proposed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                proposal.left_ref.source_system,
                proposal.left_ref.source_record_id,
                proposal.right_ref.source_system,
                proposal.right_ref.source_record_id,
                proposal.total_score,
                decided_at,
            ],
        )
        .context("failed to insert merge proposal")?;
    }

    debug!(
        minted = plan.minted,
        proposals = plan.proposals.len(),
        noop = plan.is_noop(),
        "resolution plan applied"
    );

    Ok(StageCounts {
        processed: plan.processed,
        inserted,
        updated,
    })
}

fn golden_stage(
    conn: &Connection,
    config: &SurvivorshipConfig,
    now: OffsetDateTime,
) -> Result<StageCounts> {
    let members = load_cluster_members(conn)?;
    let records = build_golden_records(&members, config, now)?;

    truncate_derived(conn, DerivedTable::GoldenCustomers)?;
    for record in &records {
        conn.execute(
            "INSERT INTO golden_customers(
                global_customer_id, canonical_email, canonical_phone, canonical_name,
                record_count, survivorship_snapshot, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.global_customer_id.to_string(),
                record.snapshot.canonical_email,
                record.snapshot.canonical_phone,
                record.snapshot.canonical_name,
                record.snapshot.record_count,
                serde_json::to_string(&record.survivorship_snapshot)
                    .context("failed to serialize survivorship_snapshot")?,
                format_rfc3339(record.updated_at)?,
            ],
        )
        .with_context(|| format!("failed to write golden record {}", record.global_customer_id))?;
    }

    Ok(StageCounts {
        processed: members.len(),
        inserted: records.len(),
        updated: 0,
    })
}

fn history_stage(conn: &Connection, now: OffsetDateTime) -> Result<StageCounts> {
    let current = load_history(conn, None, true)?;
    let golden = load_golden_records(conn, None)?;
    let plan = plan_history(&current, &golden, now)?;

    let stamp = format_rfc3339(now)?;
    for history_id in &plan.expirations {
        let expired = conn
            .execute(
                "UPDATE golden_customer_history
                 SET valid_to = ?1, is_current = 0
                 WHERE history_id = ?2 AND is_current = 1",
                params![stamp, history_id],
            )
            .with_context(|| format!("failed to expire history row {history_id}"))?;
        if expired != 1 {
            return Err(IdentityError::Consistency(format!(
                "history row {history_id} was not current at expiry"
            ))
            .into());
        }
    }

    for version in &plan.versions {
        conn.execute(
            "INSERT INTO golden_customer_history(
                global_customer_id, canonical_email, canonical_phone, canonical_name,
                record_count, survivorship_snapshot, valid_from, valid_to, is_current
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 1)",
            params![
                version.global_customer_id.to_string(),
                version.snapshot.canonical_email,
                version.snapshot.canonical_phone,
                version.snapshot.canonical_name,
                version.snapshot.record_count,
                serde_json::to_string(&version.survivorship_snapshot)
                    .context("failed to serialize survivorship_snapshot")?,
                stamp,
            ],
        )
        .with_context(|| format!("failed to version {}", version.global_customer_id))?;

        let history_id = conn.last_insert_rowid();
        insert_change_event(conn, &change_for_version(history_id, version), &stamp)?;
    }

    Ok(StageCounts {
        processed: golden.len(),
        inserted: plan.versions.len(),
        updated: plan.expirations.len(),
    })
}

fn events_stage(conn: &Connection, now: OffsetDateTime) -> Result<StageCounts> {
    let history = load_history(conn, None, false)?;
    let emitted = load_emitted_history_ids(conn)?;
    let pending = derive_change_events(&history, &emitted);

    let stamp = format_rfc3339(now)?;
    for event in &pending {
        insert_change_event(conn, event, &stamp)?;
    }
    if !pending.is_empty() {
        warn!(backfilled = pending.len(), "emitted change events missing from history stage");
    }

    Ok(StageCounts {
        processed: history.iter().filter(|row| row.is_current).count(),
        inserted: pending.len(),
        updated: 0,
    })
}

fn conflicts_stage(conn: &Connection, now: OffsetDateTime) -> Result<StageCounts> {
    let members = load_cluster_members(conn)?;
    let conflicts = detect_conflicts(&members, now);

    truncate_derived(conn, DerivedTable::AttributeConflicts)?;
    let detected_at = format_rfc3339(now)?;
    for conflict in &conflicts {
        conn.execute(
            "INSERT INTO attribute_conflicts(
                global_customer_id, attribute_name, distinct_value_count, detected_at
             ) VALUES (?1, ?2, ?3, ?4)",
            params![
                conflict.global_customer_id.to_string(),
                conflict.attribute.as_str(),
                conflict.distinct_value_count,
                detected_at,
            ],
        )
        .context("failed to insert attribute conflict")?;
    }

    Ok(StageCounts {
        processed: members.len(),
        inserted: conflicts.len(),
        updated: 0,
    })
}

fn insert_change_event(
    conn: &Connection,
    event: &PendingChangeEvent,
    changed_at: &str,
) -> Result<()> {
    let old_snapshot = event
        .old_snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize old_snapshot")?;
    let new_snapshot =
        serde_json::to_string(&event.new_snapshot).context("failed to serialize new_snapshot")?;

    conn.execute(
        "INSERT INTO change_events(
            history_id, global_customer_id, change_type, old_snapshot, new_snapshot, changed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.history_id,
            event.global_customer_id.to_string(),
            event.change_type.as_str(),
            old_snapshot,
            new_snapshot,
            changed_at,
        ],
    )
    .with_context(|| format!("failed to emit change event for history row {}", event.history_id))?;
    Ok(())
}

fn truncate_derived(conn: &Connection, table: DerivedTable) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", table.table_name()), [])
        .with_context(|| format!("failed to truncate {}", table.table_name()))?;
    Ok(())
}

fn load_blocked_pairs(conn: &Connection) -> Result<Vec<CandidatePair>> {
    let mut stmt = conn.prepare(
        "SELECT left_source_system, left_source_record_id, left_email, left_phone, left_name,
                right_source_system, right_source_record_id, right_email, right_phone, right_name
         FROM blocked_pairs
         ORDER BY pair_seq ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CandidatePair {
            left: parse_pair_side(row, 0)?,
            right: parse_pair_side(row, 5)?,
        })
    })?;
    collect_rows(rows)
}

fn load_identity_map(
    conn: &Connection,
    global_id: Option<GlobalCustomerId>,
) -> Result<Vec<IdentityMapEntry>> {
    let mut stmt = conn.prepare(
        "SELECT global_customer_id, source_system, source_record_id,
                confidence_score, decision, decided_at
         FROM identity_map
         WHERE ?1 IS NULL OR global_customer_id = ?1
         ORDER BY source_system ASC, source_record_id ASC",
    )?;
    let rows = stmt.query_map(params![global_id.map(|id| id.to_string())], |row| {
        Ok(IdentityMapEntry {
            global_customer_id: parse_global_id(0, &row.get::<_, String>(0)?)?,
            record: RecordRef::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            confidence_score: row.get(3)?,
            decision: parse_decision(4, &row.get::<_, String>(4)?)?,
            decided_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
        })
    })?;
    collect_rows(rows)
}

fn load_match_candidates(conn: &Connection) -> Result<Vec<MatchCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT left_source_system, left_source_record_id,
                right_source_system, right_source_record_id,
                email_score, phone_score, name_score, total_score,
                decision, evaluated_at
         FROM match_candidates
         ORDER BY candidate_seq ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(MatchCandidate {
            left_ref: RecordRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            right_ref: RecordRef::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
            email_score: row.get(4)?,
            phone_score: row.get(5)?,
            name_score: row.get(6)?,
            total_score: row.get(7)?,
            decision: parse_decision(8, &row.get::<_, String>(8)?)?,
            evaluated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
        })
    })?;
    collect_rows(rows)
}

/// Inputs joined to their mapped global id. Mapping entries without a
/// staged input contribute nothing.
fn load_cluster_members(conn: &Connection) -> Result<Vec<ClusterMember>> {
    let mut stmt = conn.prepare(
        "SELECT map.global_customer_id, input.source_system, input.source_record_id,
                input.normalized_email, input.normalized_phone, input.normalized_name,
                input.event_ts
         FROM identity_map map
         JOIN identity_inputs input
           ON input.source_system = map.source_system
          AND input.source_record_id = map.source_record_id
         ORDER BY map.global_customer_id ASC, input.source_system ASC, input.source_record_id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ClusterMember {
            global_customer_id: parse_global_id(0, &row.get::<_, String>(0)?)?,
            input: IdentityInputRecord {
                source_system: row.get(1)?,
                source_record_id: row.get(2)?,
                normalized_email: row.get(3)?,
                normalized_phone: row.get(4)?,
                normalized_name: row.get(5)?,
                event_ts: parse_timestamp(6, &row.get::<_, String>(6)?)?,
            },
        })
    })?;
    collect_rows(rows)
}

fn load_golden_records(
    conn: &Connection,
    global_id: Option<GlobalCustomerId>,
) -> Result<Vec<GoldenCustomerRecord>> {
    let mut stmt = conn.prepare(
        "SELECT global_customer_id, canonical_email, canonical_phone, canonical_name,
                record_count, survivorship_snapshot, updated_at
         FROM golden_customers
         WHERE ?1 IS NULL OR global_customer_id = ?1
         ORDER BY global_customer_id ASC",
    )?;
    let rows = stmt.query_map(params![global_id.map(|id| id.to_string())], |row| {
        Ok(GoldenCustomerRecord {
            global_customer_id: parse_global_id(0, &row.get::<_, String>(0)?)?,
            snapshot: parse_snapshot(row, 1)?,
            survivorship_snapshot: parse_json(5, &row.get::<_, String>(5)?)?,
            updated_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
        })
    })?;
    collect_rows(rows)
}

fn load_history(
    conn: &Connection,
    global_id: Option<GlobalCustomerId>,
    current_only: bool,
) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT history_id, global_customer_id, canonical_email, canonical_phone,
                canonical_name, record_count, survivorship_snapshot,
                valid_from, valid_to, is_current
         FROM golden_customer_history
         WHERE (?1 IS NULL OR global_customer_id = ?1)
           AND (?2 = 0 OR is_current = 1)
         ORDER BY global_customer_id ASC, history_id ASC",
    )?;
    let rows = stmt.query_map(
        params![global_id.map(|id| id.to_string()), i64::from(current_only)],
        |row| {
            let valid_to = row
                .get::<_, Option<String>>(8)?
                .as_deref()
                .map(|raw| parse_timestamp(8, raw))
                .transpose()?;
            Ok(HistoryEntry {
                history_id: row.get(0)?,
                global_customer_id: parse_global_id(1, &row.get::<_, String>(1)?)?,
                snapshot: parse_snapshot(row, 2)?,
                survivorship_snapshot: parse_json(6, &row.get::<_, String>(6)?)?,
                valid_from: parse_timestamp(7, &row.get::<_, String>(7)?)?,
                valid_to,
                is_current: row.get::<_, i64>(9)? == 1,
            })
        },
    )?;
    collect_rows(rows)
}

fn load_emitted_history_ids(conn: &Connection) -> Result<BTreeSet<i64>> {
    let mut stmt = conn.prepare("SELECT history_id FROM change_events")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

fn parse_change_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let change_type_raw: String = row.get(3)?;
    let change_type = ChangeType::parse(&change_type_raw).ok_or_else(|| {
        invalid_column(
            3,
            rusqlite::types::Type::Text,
            format!("invalid change_type: {change_type_raw}"),
        )
    })?;

    let old_snapshot = row
        .get::<_, Option<String>>(4)?
        .as_deref()
        .map(|raw| parse_payload(4, raw))
        .transpose()?;

    Ok(ChangeEvent {
        event_seq: row.get(0)?,
        history_id: row.get(1)?,
        global_customer_id: parse_global_id(2, &row.get::<_, String>(2)?)?,
        change_type,
        old_snapshot,
        new_snapshot: parse_payload(5, &row.get::<_, String>(5)?)?,
        changed_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
    })
}

fn parse_pair_side(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<PairSide> {
    Ok(PairSide {
        reference: RecordRef::new(row.get::<_, String>(start)?, row.get::<_, String>(start + 1)?),
        email: row.get(start + 2)?,
        phone: row.get(start + 3)?,
        name: row.get(start + 4)?,
    })
}

/// Reads `canonical_email, canonical_phone, canonical_name, record_count`
/// starting at column `start`.
fn parse_snapshot(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<GoldenSnapshot> {
    Ok(GoldenSnapshot {
        canonical_email: row.get(start)?,
        canonical_phone: row.get(start + 1)?,
        canonical_name: row.get(start + 2)?,
        record_count: row.get(start + 3)?,
    })
}

fn parse_payload(index: usize, raw: &str) -> rusqlite::Result<ChangePayload> {
    serde_json::from_str(raw).map_err(|err| {
        invalid_column(
            index,
            rusqlite::types::Type::Text,
            format!("invalid change snapshot: {err}"),
        )
    })
}

fn parse_json(index: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|err| {
        invalid_column(
            index,
            rusqlite::types::Type::Text,
            format!("invalid survivorship_snapshot: {err}"),
        )
    })
}

fn parse_decision(index: usize, raw: &str) -> rusqlite::Result<MatchDecision> {
    MatchDecision::parse(raw).ok_or_else(|| {
        invalid_column(index, rusqlite::types::Type::Text, format!("invalid decision: {raw}"))
    })
}

fn parse_global_id(index: usize, raw: &str) -> rusqlite::Result<GlobalCustomerId> {
    GlobalCustomerId::parse(raw).map_err(|err| to_sql_error(index, &err))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| to_sql_error(index, &err))
}

fn to_sql_error(index: usize, err: &IdentityError) -> rusqlite::Error {
    invalid_column(index, rusqlite::types::Type::Text, err.to_string())
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Decodes a JSON array of records from `raw`, naming `what` in errors.
pub fn parse_json_array<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<Vec<T>> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid {what} JSON array: {err}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use time::Duration;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteGoldenStore {
        let store = must(SqliteGoldenStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn at(minute: i64) -> OffsetDateTime {
        must(parse_rfc3339_utc("2026-03-01T10:00:00Z").map_err(anyhow::Error::from))
            + Duration::minutes(minute)
    }

    fn input(
        source: &str,
        record_id: &str,
        email: Option<&str>,
        name: Option<&str>,
        minute: i64,
    ) -> IdentityInputRecord {
        IdentityInputRecord {
            source_system: source.to_string(),
            source_record_id: record_id.to_string(),
            normalized_email: email.map(str::to_string),
            normalized_phone: None,
            normalized_name: name.map(str::to_string),
            event_ts: at(minute),
        }
    }

    fn pair(left: &IdentityInputRecord, right: &IdentityInputRecord) -> CandidatePair {
        let side = |record: &IdentityInputRecord| PairSide {
            reference: record.reference(),
            email: record.normalized_email.clone(),
            phone: record.normalized_phone.clone(),
            name: record.normalized_name.clone(),
        };
        CandidatePair {
            left: side(left),
            right: side(right),
        }
    }

    fn scenario_inputs() -> (IdentityInputRecord, IdentityInputRecord) {
        (
            input("sales", "S-1", Some("j@x.com"), Some("john doe"), 0),
            input("marketing", "M-1", Some("j@x.com"), Some("jon doe"), 5),
        )
    }

    fn seed_scenario(store: &mut SqliteGoldenStore) {
        let (r1, r2) = scenario_inputs();
        must(store.replace_identity_inputs(&[r1.clone(), r2.clone()]));
        must(store.replace_blocked_pairs(&[pair(&r1, &r2)]));
    }

    fn run(store: &mut SqliteGoldenStore, minute: i64) -> PipelineReport {
        let report = must(store.run_pipeline(&EngineConfig::v1(), at(minute)));
        assert!(report.succeeded, "pipeline failed: {:?}", report.failure);
        report
    }

    #[test]
    fn scenario_resolves_two_sources_into_one_golden_customer() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);

        let candidates = must(store.list_match_candidates());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].decision, MatchDecision::AutoMerge);

        let mapping = must(store.list_identity_map(None));
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[0].global_customer_id, mapping[1].global_customer_id);
        let global_id = mapping[0].global_customer_id;

        let golden = must(store.list_golden_records(None));
        assert_eq!(golden.len(), 1);
        assert_eq!(golden[0].global_customer_id, global_id);
        assert_eq!(golden[0].snapshot.canonical_email.as_deref(), Some("j@x.com"));
        assert_eq!(golden[0].snapshot.canonical_name.as_deref(), Some("john doe"));
        assert_eq!(golden[0].snapshot.record_count, 2);

        let history = must(store.list_history(None));
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);

        let events = must(store.list_change_events(None));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Insert);
        assert_eq!(events[0].old_snapshot, None);
        assert_eq!(events[0].history_id, history[0].history_id);

        let conflicts = must(store.list_conflicts(None));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].attribute, CustomerAttribute::Name);
        assert_eq!(conflicts[0].distinct_value_count, 2);

        let check = must(store.check_integrity());
        assert!(check.healthy, "issues: {:?}", check.issues);
    }

    #[test]
    fn rerunning_the_pipeline_changes_nothing() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);
        let mapping = must(store.list_identity_map(None));
        let history = must(store.list_history(None));
        let events = must(store.list_change_events(None));

        let second = run(&mut store, 120);
        assert_eq!(must(store.list_identity_map(None)), mapping);
        assert_eq!(must(store.list_history(None)), history);
        assert_eq!(must(store.list_change_events(None)), events);

        let resolve = second.stages.iter().find(|report| report.stage == Stage::Resolve);
        match resolve {
            Some(report) => {
                assert_eq!(report.inserted, 0);
                assert_eq!(report.updated, 0);
            }
            None => panic!("expected a resolve stage report"),
        }
    }

    #[test]
    fn merging_two_existing_clusters_retires_the_right_operand() {
        let mut store = fixture_store();
        let a = input("sales", "A", Some("a@x.com"), None, 0);
        let b = input("sales", "B", Some("a@x.com"), None, 1);
        let c = input("support", "C", Some("c@x.com"), None, 2);
        let d = input("support", "D", Some("c@x.com"), None, 3);
        must(store.replace_identity_inputs(&[a.clone(), b.clone(), c.clone(), d.clone()]));

        must(store.replace_blocked_pairs(&[pair(&a, &b), pair(&c, &d)]));
        run(&mut store, 10);
        let left_id = match must(store.global_id_for(&b.reference())) {
            Some(value) => value,
            None => panic!("expected B to be mapped"),
        };
        let right_id = match must(store.global_id_for(&c.reference())) {
            Some(value) => value,
            None => panic!("expected C to be mapped"),
        };
        assert_ne!(left_id, right_id);

        let mut bridge = pair(&b, &c);
        bridge.right.email = Some("a@x.com".to_string());
        must(store.replace_blocked_pairs(&[bridge]));
        run(&mut store, 20);

        let mapping = must(store.list_identity_map(None));
        assert!(mapping.iter().all(|entry| entry.global_customer_id == left_id));

        let retired = must(store.list_retired_ids());
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].retired_id, right_id);
        assert_eq!(retired[0].surviving_id, left_id);
        assert_eq!(retired[0].reassigned_records, 2);

        // The retired id keeps its last history row; the survivor gets an update.
        let retired_history = must(store.list_history(Some(right_id)));
        assert_eq!(retired_history.len(), 1);
        assert!(retired_history[0].is_current);

        let survivor_events = must(store.list_change_events(Some(left_id)));
        assert_eq!(survivor_events.len(), 2);
        assert_eq!(survivor_events[1].change_type, ChangeType::Update);
        match &survivor_events[1].old_snapshot {
            Some(old) => assert_eq!(old.snapshot.record_count, 2),
            None => panic!("expected an old snapshot on update"),
        }
        assert_eq!(survivor_events[1].new_snapshot.snapshot.record_count, 4);

        let check = must(store.check_integrity());
        assert!(check.healthy, "issues: {:?}", check.issues);
    }

    #[test]
    fn changed_golden_record_is_versioned() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);

        let (r1, r2) = scenario_inputs();
        let r3 = input("support", "T-1", Some("j@x.com"), Some("john doe"), 9);
        must(store.replace_identity_inputs(&[r1.clone(), r2.clone(), r3.clone()]));
        must(store.replace_blocked_pairs(&[pair(&r1, &r2), pair(&r1, &r3)]));
        run(&mut store, 120);

        let history = must(store.list_history(None));
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_current);
        assert_eq!(history[0].valid_to, Some(at(120)));
        assert!(history[1].is_current);
        assert_eq!(history[1].valid_from, at(120));
        assert_eq!(history[1].snapshot.record_count, 3);

        let events = must(store.list_change_events(None));
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].change_type, ChangeType::Update);
        assert_eq!(events[1].history_id, history[1].history_id);
    }

    #[test]
    fn stalled_history_clock_fails_the_stage_and_rolls_back() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);
        let history = must(store.list_history(None));

        let (r1, r2) = scenario_inputs();
        let r3 = input("support", "T-1", Some("j@x.com"), None, 9);
        must(store.replace_identity_inputs(&[r1.clone(), r2.clone(), r3.clone()]));
        must(store.replace_blocked_pairs(&[pair(&r1, &r2), pair(&r1, &r3)]));

        let report = must(store.run_pipeline(&EngineConfig::v1(), at(60)));
        assert!(!report.succeeded);
        match &report.failure {
            Some(failure) => {
                assert_eq!(failure.stage, Stage::History);
                assert_eq!(failure.processed, 0);
                assert!(failure.error.contains("history clock did not advance"));
            }
            None => panic!("expected a history failure"),
        }
        assert_eq!(report.stages.len(), 3);
        assert_eq!(must(store.list_history(None)), history);
        assert_eq!(must(store.list_change_events(None)).len(), 1);

        let runs = must(store.list_stage_runs(Some(1)));
        assert_eq!(runs[0].stage, Stage::History);
        assert_eq!(runs[0].status, StageStatus::Failed);
        assert!(runs[0].error.is_some());
    }

    #[test]
    fn history_failure_after_partial_writes_rolls_back_the_stage() {
        let mut store = fixture_store();
        let (r1, r2) = scenario_inputs();
        let a = input("support", "A-1", Some("a@x.com"), Some("ann lee"), 1);
        let b = input("marketing", "B-1", Some("a@x.com"), Some("ann lee"), 2);
        must(store.replace_identity_inputs(&[r1.clone(), r2.clone(), a.clone(), b.clone()]));
        must(store.replace_blocked_pairs(&[pair(&r1, &r2), pair(&a, &b)]));

        must(
            store
                .connection()
                .execute_batch(
                    "CREATE TRIGGER trg_reject_second_event
                     BEFORE INSERT ON change_events
                     WHEN (SELECT COUNT(*) FROM change_events) >= 1
                     BEGIN
                       SELECT RAISE(ABORT, 'second change event rejected');
                     END;",
                )
                .map_err(anyhow::Error::from),
        );

        let report = must(store.run_pipeline(&EngineConfig::v1(), at(60)));
        assert!(!report.succeeded);
        match &report.failure {
            Some(failure) => {
                assert_eq!(failure.stage, Stage::History);
                assert_eq!(failure.processed, 0);
                assert!(failure.error.contains("second change event rejected"));
            }
            None => panic!("expected a history failure"),
        }
        assert_eq!(must(store.list_golden_records(None)).len(), 2);
        assert!(must(store.list_history(None)).is_empty());
        assert!(must(store.list_change_events(None)).is_empty());

        must(
            store
                .connection()
                .execute_batch("DROP TRIGGER trg_reject_second_event;")
                .map_err(anyhow::Error::from),
        );
        run(&mut store, 61);
        assert_eq!(must(store.list_history(None)).len(), 2);
        assert_eq!(must(store.list_change_events(None)).len(), 2);
    }

    #[test]
    fn self_referencing_pairs_are_skipped_not_fatal() {
        let mut store = fixture_store();
        let (r1, r2) = scenario_inputs();
        must(store.replace_identity_inputs(&[r1.clone(), r2.clone()]));
        must(store.replace_blocked_pairs(&[pair(&r1, &r1), pair(&r1, &r2)]));

        let report = run(&mut store, 60);
        assert_eq!(report.stages[0].processed, 2);
        assert_eq!(report.stages[0].inserted, 1);
        assert_eq!(must(store.list_match_candidates()).len(), 1);
        assert_eq!(must(store.list_golden_records(None)).len(), 1);
    }

    #[test]
    fn invalid_configuration_aborts_before_any_stage() {
        let mut store = fixture_store();
        seed_scenario(&mut store);

        let mut config = EngineConfig::v1();
        config.survivorship.strategy_map.remove(&CustomerAttribute::Name);
        assert!(store.run_pipeline(&config, at(60)).is_err());

        assert!(must(store.list_match_candidates()).is_empty());
        assert!(must(store.list_stage_runs(None)).is_empty());
    }

    #[test]
    fn propose_only_records_review_pairs_without_merging() {
        let mut store = fixture_store();
        let mut a = input("sales", "A", None, Some("ann lee"), 0);
        let mut b = input("support", "B", None, Some("bob ray"), 1);
        a.normalized_phone = Some("555-0100".to_string());
        b.normalized_phone = Some("555-0100".to_string());
        must(store.replace_identity_inputs(&[a.clone(), b.clone()]));
        must(store.replace_blocked_pairs(&[pair(&a, &b)]));

        let mut config = EngineConfig::v1();
        config.resolution.review_policy = golden_identity_core::ReviewPolicy::ProposeOnly;
        let report = must(store.run_pipeline(&config, at(10)));
        assert!(report.succeeded);

        assert!(must(store.list_identity_map(None)).is_empty());
        let proposals = must(store.list_merge_proposals());
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].total_score, 70);
    }

    #[test]
    fn emitter_backfills_current_rows_without_events() {
        let mut store = fixture_store();
        let global_id = GlobalCustomerId::mint();
        let stamp = must(format_rfc3339(at(0)).map_err(anyhow::Error::from));
        let inserted = store.connection().execute(
            "INSERT INTO golden_customer_history(
                global_customer_id, canonical_email, canonical_phone, canonical_name,
                record_count, survivorship_snapshot, valid_from, valid_to, is_current
             ) VALUES (?1, 'a@x.com', NULL, NULL, 1, '{}', ?2, NULL, 1)",
            params![global_id.to_string(), stamp],
        );
        if let Err(err) = inserted {
            panic!("test failure: {err}");
        }

        let first = must(store.emit_change_events(at(5)));
        assert_eq!(first.inserted, 1);
        let second = must(store.emit_change_events(at(6)));
        assert_eq!(second.inserted, 0);

        let events = must(store.list_change_events(Some(global_id)));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Insert);
    }

    #[test]
    fn audited_tables_reject_deletes_and_rewrites() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);

        let conn = store.connection();
        assert!(conn.execute("DELETE FROM identity_map", []).is_err());
        assert!(conn.execute("DELETE FROM golden_customer_history", []).is_err());
        assert!(conn.execute("DELETE FROM change_events", []).is_err());
        assert!(conn
            .execute("UPDATE golden_customer_history SET record_count = 9", [])
            .is_err());
        assert!(conn
            .execute("UPDATE identity_map SET source_record_id = 'X'", [])
            .is_err());
        assert!(conn
            .execute("UPDATE change_events SET change_type = 'UPDATE'", [])
            .is_err());
    }

    #[test]
    fn one_current_history_row_per_id_is_enforced_by_the_schema() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);
        let global_id = must(store.list_golden_records(None))[0].global_customer_id;

        let duplicate = store.connection().execute(
            "INSERT INTO golden_customer_history(
                global_customer_id, canonical_email, canonical_phone, canonical_name,
                record_count, survivorship_snapshot, valid_from, valid_to, is_current
             ) VALUES (?1, NULL, NULL, NULL, 1, '{}', '2026-03-02T00:00:00Z', NULL, 1)",
            params![global_id.to_string()],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn mapping_without_inputs_yields_no_golden_record() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);

        must(store.replace_identity_inputs(&[]));
        let report = must(store.build_golden_records(&SurvivorshipConfig::v1(), at(70)));
        assert_eq!(report.inserted, 0);
        assert!(must(store.list_golden_records(None)).is_empty());
    }

    #[test]
    fn stage_runs_are_logged_newest_first() {
        let mut store = fixture_store();
        seed_scenario(&mut store);
        run(&mut store, 60);

        let runs = must(store.list_stage_runs(None));
        let stages: Vec<Stage> = runs.iter().map(|run| run.stage).collect();
        let mut expected = Stage::ALL.to_vec();
        expected.reverse();
        assert_eq!(stages, expected);
        assert!(runs.iter().all(|run| run.status == StageStatus::Succeeded));
    }

    fn components(edges: &[(usize, usize)]) -> BTreeSet<BTreeSet<usize>> {
        let mut parent: BTreeMap<usize, usize> = BTreeMap::new();
        fn root(parent: &mut BTreeMap<usize, usize>, node: usize) -> usize {
            let next = *parent.entry(node).or_insert(node);
            if next == node {
                return node;
            }
            let top = root(parent, next);
            parent.insert(node, top);
            top
        }
        for (left, right) in edges {
            let left_root = root(&mut parent, *left);
            let right_root = root(&mut parent, *right);
            parent.insert(left_root, right_root);
        }
        let nodes: Vec<usize> = parent.keys().copied().collect();
        let mut grouped: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for node in nodes {
            let top = root(&mut parent, node);
            grouped.entry(top).or_default().insert(node);
        }
        grouped.into_values().collect()
    }

    fn linked_pair(left: usize, right: usize) -> CandidatePair {
        let side = |index: usize| PairSide {
            reference: RecordRef::new("sales", format!("R{index:02}")),
            email: Some("shared@x.com".to_string()),
            phone: None,
            name: None,
        };
        CandidatePair {
            left: side(left),
            right: side(right),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_incremental_batches_match_connected_components(
            raw_edges in prop::collection::vec((0usize..12, 0usize..12), 1..24),
            split in 0usize..24,
        ) {
            let edges: Vec<(usize, usize)> = raw_edges
                .into_iter()
                .filter(|(left, right)| left != right)
                .collect();
            let split = split.min(edges.len());
            let mut store = fixture_store();
            let rules = MatchRules::v1();
            let config = ResolutionConfig::default();

            for (batch, minute) in [(&edges[..split], 1), (&edges[split..], 2)] {
                let pairs: Vec<CandidatePair> = batch
                    .iter()
                    .map(|(left, right)| linked_pair(*left, *right))
                    .collect();
                must(store.replace_blocked_pairs(&pairs));
                must(store.score_candidates(&rules, at(minute)));
                must(store.resolve_identities(&config, at(minute)));
            }

            let mut grouped: BTreeMap<GlobalCustomerId, BTreeSet<usize>> = BTreeMap::new();
            for entry in must(store.list_identity_map(None)) {
                let index = must(
                    entry.record.source_record_id[1..]
                        .parse::<usize>()
                        .map_err(anyhow::Error::from),
                );
                grouped.entry(entry.global_customer_id).or_default().insert(index);
            }
            let partition: BTreeSet<BTreeSet<usize>> = grouped.into_values().collect();
            prop_assert_eq!(partition, components(&edges));

            let check = must(store.check_integrity());
            prop_assert!(check.healthy);
        }
    }
}
