//! SQLite-backed record store for referrals and their event log.
//!
//! All mutation goes through a compare-and-swap guarded on
//! `(id, stage, attempt_count)`: concurrent schedulers racing on the same
//! record resolve to exactly one applied update and one `Conflict`, which
//! callers skip without surfacing an error.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::domain::{EventOutcome, InboundReferral, Referral, Stage, StageEvent};

/// Errors surfaced by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("referral not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Result of a compare-and-swap update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// The update was applied; this actor won the record for this cycle
    Applied,

    /// Another actor moved the record first; skip it this cycle
    Conflict,
}

/// Result of an idempotent inbound upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New row created
    Created(String),

    /// A row for this natural key already exists; nothing changed
    Existing(String),
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Existing(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

/// Result of claiming a dispatch slot before firing an external effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This actor holds the claim; fire the effect with this token
    Claimed(String),

    /// An earlier attempt claimed but never confirmed; follow up
    /// idempotently with the persisted token instead of firing blind
    AlreadyClaimed(String),

    /// A concurrent actor claimed first; skip this cycle
    Conflict,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS referrals (
    id TEXT PRIMARY KEY,
    subject_key TEXT NOT NULL,
    stage TEXT NOT NULL,
    stage_entered_at TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    last_error TEXT,
    patient_email TEXT,
    patient_mobile TEXT,
    patient_dob TEXT,
    referrer_name TEXT,
    referrer_email TEXT,
    raw_subject TEXT NOT NULL,
    raw_body TEXT NOT NULL,
    received_at TEXT NOT NULL,
    confirmed_at TEXT,
    test_requested_at TEXT,
    report_detected_at TEXT,
    report_processed_at TEXT,
    delivered_at TEXT,
    request_receipt TEXT,
    test_link TEXT,
    report_ref TEXT,
    processed_report_path TEXT,
    processed_report_digest TEXT,
    dispatch_token TEXT,
    dispatch_started_at TEXT,
    reminder_level INTEGER NOT NULL DEFAULT 0,
    resend_count INTEGER NOT NULL DEFAULT 0,
    last_resent_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_referrals_stage ON referrals(stage);
CREATE INDEX IF NOT EXISTS idx_referrals_subject ON referrals(subject_key);

CREATE TABLE IF NOT EXISTS stage_events (
    referral_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    at TEXT NOT NULL,
    from_stage TEXT,
    to_stage TEXT,
    outcome TEXT NOT NULL,
    detail TEXT NOT NULL,
    error TEXT,
    PRIMARY KEY (referral_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_events_at ON stage_events(at);
";

/// SQLite-backed store; `Send + Sync`, share via `Arc`.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Create a row for an inbound payload, idempotent on its natural key.
    ///
    /// Duplicate inbound messages for an already-known identifier never
    /// create a second row.
    pub fn upsert_inbound(&self, payload: &InboundReferral) -> Result<UpsertOutcome, StoreError> {
        let referral = Referral::from_inbound(payload);
        let conn = self.conn()?;
        let inserted = insert_row(&conn, &referral, true)?;
        if inserted {
            Ok(UpsertOutcome::Created(referral.id))
        } else {
            Ok(UpsertOutcome::Existing(referral.id))
        }
    }

    /// Insert a fully-formed referral row. Fails if the id already exists.
    pub fn insert(&self, referral: &Referral) -> Result<(), StoreError> {
        let conn = self.conn()?;
        insert_row(&conn, referral, false)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Referral>, StoreError> {
        let conn = self.conn()?;
        let referral = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM referrals WHERE id = ?1"),
                params![id],
                row_to_referral,
            )
            .optional()?;
        Ok(referral)
    }

    /// Records in `stage` whose backoff window has elapsed, oldest first.
    pub fn find_eligible(&self, stage: Stage, now: DateTime<Utc>) -> Result<Vec<Referral>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM referrals
             WHERE stage = ?1 AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
             ORDER BY stage_entered_at ASC"
        ))?;
        let rows = stmt.query_map(params![stage.as_str(), ts(now)], row_to_referral)?;
        collect(rows)
    }

    /// All records currently in `stage`, regardless of backoff.
    pub fn find_in_stage(&self, stage: Stage) -> Result<Vec<Referral>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM referrals WHERE stage = ?1 ORDER BY stage_entered_at ASC"
        ))?;
        let rows = stmt.query_map(params![stage.as_str()], row_to_referral)?;
        collect(rows)
    }

    /// Recent records, optionally filtered by stage.
    pub fn list(&self, stage: Option<Stage>, limit: usize) -> Result<Vec<Referral>, StoreError> {
        let conn = self.conn()?;
        match stage {
            Some(stage) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM referrals WHERE stage = ?1
                     ORDER BY received_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![stage.as_str(), limit as i64], row_to_referral)?;
                collect(rows)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM referrals ORDER BY received_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], row_to_referral)?;
                collect(rows)
            }
        }
    }

    /// Compare-and-swap the full row against the caller's snapshot.
    ///
    /// The guard covers every counter the update rewrites (stage, attempt
    /// count, reminder level, resend count), so a concurrent bump of any of
    /// them conflicts instead of being silently overwritten. Returns
    /// `Conflict` when another actor already moved the record; the caller
    /// must skip it this cycle.
    pub fn compare_and_swap(
        &self,
        updated: &Referral,
        expected: &Referral,
    ) -> Result<CasResult, StoreError> {
        if updated.stage != expected.stage && !expected.stage.can_advance_to(updated.stage) {
            return Err(StoreError::InvalidTransition {
                from: expected.stage,
                to: updated.stage,
            });
        }

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE referrals SET
                subject_key = ?1, stage = ?2, stage_entered_at = ?3,
                attempt_count = ?4, next_attempt_at = ?5, last_error = ?6,
                patient_email = ?7, patient_mobile = ?8, patient_dob = ?9,
                referrer_name = ?10, referrer_email = ?11,
                raw_subject = ?12, raw_body = ?13, received_at = ?14,
                confirmed_at = ?15, test_requested_at = ?16,
                report_detected_at = ?17, report_processed_at = ?18,
                delivered_at = ?19, request_receipt = ?20, test_link = ?21,
                report_ref = ?22, processed_report_path = ?23,
                processed_report_digest = ?24, dispatch_token = ?25,
                dispatch_started_at = ?26, reminder_level = ?27,
                resend_count = ?28, last_resent_at = ?29
             WHERE id = ?30 AND stage = ?31 AND attempt_count = ?32
               AND reminder_level = ?33 AND resend_count = ?34",
            params![
                updated.subject_key,
                updated.stage.as_str(),
                ts(updated.stage_entered_at),
                updated.attempt_count,
                opt_ts(&updated.next_attempt_at),
                updated.last_error,
                updated.patient_email,
                updated.patient_mobile,
                updated.patient_dob,
                updated.referrer_name,
                updated.referrer_email,
                updated.raw_subject,
                updated.raw_body,
                ts(updated.received_at),
                opt_ts(&updated.confirmed_at),
                opt_ts(&updated.test_requested_at),
                opt_ts(&updated.report_detected_at),
                opt_ts(&updated.report_processed_at),
                opt_ts(&updated.delivered_at),
                updated.request_receipt,
                updated.test_link,
                updated.report_ref,
                updated.processed_report_path,
                updated.processed_report_digest,
                updated.dispatch_token,
                opt_ts(&updated.dispatch_started_at),
                updated.reminder_level,
                updated.resend_count,
                opt_ts(&updated.last_resent_at),
                updated.id,
                expected.stage.as_str(),
                expected.attempt_count,
                expected.reminder_level,
                expected.resend_count,
            ],
        )?;

        if changed == 1 {
            Ok(CasResult::Applied)
        } else {
            Ok(CasResult::Conflict)
        }
    }

    /// Persist "attempt started" before firing an external effect.
    ///
    /// `current` is the caller's eligibility snapshot. If it already carries
    /// a token, a prior attempt claimed but never confirmed: the caller must
    /// follow up idempotently with that token. Otherwise exactly one
    /// concurrent claimant wins; the rest observe `Conflict` before any
    /// side effect has fired.
    pub fn claim_dispatch(
        &self,
        current: &Referral,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        if let Some(existing) = &current.dispatch_token {
            return Ok(ClaimOutcome::AlreadyClaimed(existing.clone()));
        }

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE referrals SET dispatch_token = ?1, dispatch_started_at = ?2
             WHERE id = ?3 AND stage = ?4 AND dispatch_token IS NULL",
            params![token, ts(now), current.id, current.stage.as_str()],
        )?;

        if changed == 1 {
            Ok(ClaimOutcome::Claimed(token.to_string()))
        } else {
            Ok(ClaimOutcome::Conflict)
        }
    }

    /// Roll back a claim whose effect never fired (e.g. the governor denied
    /// the dispatch after the claim was taken). Guarded on the token so a
    /// claim held by another actor is never cleared.
    pub fn release_dispatch(&self, id: &str, token: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE referrals SET dispatch_token = NULL, dispatch_started_at = NULL
             WHERE id = ?1 AND dispatch_token = ?2",
            params![id, token],
        )?;
        Ok(())
    }

    /// Append an event, assigning the next per-referral sequence number.
    pub fn append_event(&self, mut event: StageEvent) -> Result<StageEvent, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM stage_events WHERE referral_id = ?1",
            params![event.referral_id],
            |row| row.get(0),
        )?;
        event.seq = next_seq as u64;

        tx.execute(
            "INSERT INTO stage_events
                (referral_id, seq, at, from_stage, to_stage, outcome, detail, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.referral_id,
                event.seq as i64,
                ts(event.at),
                event.from_stage.map(|s| s.as_str()),
                event.to_stage.map(|s| s.as_str()),
                event.outcome.as_str(),
                event.detail,
                event.error,
            ],
        )?;

        tx.commit()?;
        Ok(event)
    }

    /// All events for a referral, in append order.
    pub fn events_for(&self, referral_id: &str) -> Result<Vec<StageEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT referral_id, seq, at, from_stage, to_stage, outcome, detail, error
             FROM stage_events WHERE referral_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![referral_id], row_to_event)?;
        collect(rows)
    }

    /// Test requests attributed to a subject since `since` (rate window).
    ///
    /// Rebuilt from the event log rather than tracked in mutable state:
    /// successful advances into `test_requested` plus operator resends.
    pub fn subject_requests_since(
        &self,
        subject_key: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM stage_events e
             JOIN referrals r ON r.id = e.referral_id
             WHERE r.subject_key = ?1 AND e.at >= ?2
               AND ((e.outcome = 'advanced' AND e.to_stage = 'test_requested')
                    OR e.outcome = 'resent')",
            params![subject_key, ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Subjects whose request count since `since` exceeds `cap`, with the
    /// most recent referral id carrying them (for the anomaly event).
    pub fn subjects_over_request_cap(
        &self,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<Vec<(String, u32, String)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.subject_key, COUNT(*) AS n, MAX(e.referral_id)
             FROM stage_events e
             JOIN referrals r ON r.id = e.referral_id
             WHERE e.at >= ?1
               AND ((e.outcome = 'advanced' AND e.to_stage = 'test_requested')
                    OR e.outcome = 'resent')
             GROUP BY r.subject_key
             HAVING n > ?2",
        )?;
        let rows = stmt.query_map(params![ts(since), cap], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        collect(rows)
    }
}

/// Column list shared by every referral SELECT.
const COLUMNS: &str = "id, subject_key, stage, stage_entered_at, attempt_count, \
    next_attempt_at, last_error, patient_email, patient_mobile, patient_dob, \
    referrer_name, referrer_email, raw_subject, raw_body, received_at, \
    confirmed_at, test_requested_at, report_detected_at, report_processed_at, \
    delivered_at, request_receipt, test_link, report_ref, processed_report_path, \
    processed_report_digest, dispatch_token, dispatch_started_at, reminder_level, \
    resend_count, last_resent_at";

fn insert_row(conn: &Connection, referral: &Referral, ignore_existing: bool) -> Result<bool, StoreError> {
    let verb = if ignore_existing {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let changed = conn.execute(
        &format!(
            "{verb} INTO referrals ({COLUMNS}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
              ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)"
        ),
        params![
            referral.id,
            referral.subject_key,
            referral.stage.as_str(),
            ts(referral.stage_entered_at),
            referral.attempt_count,
            opt_ts(&referral.next_attempt_at),
            referral.last_error,
            referral.patient_email,
            referral.patient_mobile,
            referral.patient_dob,
            referral.referrer_name,
            referral.referrer_email,
            referral.raw_subject,
            referral.raw_body,
            ts(referral.received_at),
            opt_ts(&referral.confirmed_at),
            opt_ts(&referral.test_requested_at),
            opt_ts(&referral.report_detected_at),
            opt_ts(&referral.report_processed_at),
            opt_ts(&referral.delivered_at),
            referral.request_receipt,
            referral.test_link,
            referral.report_ref,
            referral.processed_report_path,
            referral.processed_report_digest,
            referral.dispatch_token,
            opt_ts(&referral.dispatch_started_at),
            referral.reminder_level,
            referral.resend_count,
            opt_ts(&referral.last_resent_at),
        ],
    )?;
    Ok(changed == 1)
}

/// Fixed-width RFC3339 so lexicographic ordering matches chronological.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

fn parse_stage(idx: usize, raw: &str) -> rusqlite::Result<Stage> {
    Stage::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown stage: {raw}").into(),
        )
    })
}

fn row_to_referral(row: &Row<'_>) -> rusqlite::Result<Referral> {
    Ok(Referral {
        id: row.get(0)?,
        subject_key: row.get(1)?,
        stage: parse_stage(2, &row.get::<_, String>(2)?)?,
        stage_entered_at: parse_ts(3, row.get(3)?)?,
        attempt_count: row.get(4)?,
        next_attempt_at: parse_opt_ts(5, row.get(5)?)?,
        last_error: row.get(6)?,
        patient_email: row.get(7)?,
        patient_mobile: row.get(8)?,
        patient_dob: row.get(9)?,
        referrer_name: row.get(10)?,
        referrer_email: row.get(11)?,
        raw_subject: row.get(12)?,
        raw_body: row.get(13)?,
        received_at: parse_ts(14, row.get(14)?)?,
        confirmed_at: parse_opt_ts(15, row.get(15)?)?,
        test_requested_at: parse_opt_ts(16, row.get(16)?)?,
        report_detected_at: parse_opt_ts(17, row.get(17)?)?,
        report_processed_at: parse_opt_ts(18, row.get(18)?)?,
        delivered_at: parse_opt_ts(19, row.get(19)?)?,
        request_receipt: row.get(20)?,
        test_link: row.get(21)?,
        report_ref: row.get(22)?,
        processed_report_path: row.get(23)?,
        processed_report_digest: row.get(24)?,
        dispatch_token: row.get(25)?,
        dispatch_started_at: parse_opt_ts(26, row.get(26)?)?,
        reminder_level: row.get(27)?,
        resend_count: row.get(28)?,
        last_resent_at: parse_opt_ts(29, row.get(29)?)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StageEvent> {
    let from_stage: Option<String> = row.get(3)?;
    let to_stage: Option<String> = row.get(4)?;
    let outcome_raw: String = row.get(5)?;

    Ok(StageEvent {
        referral_id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        at: parse_ts(2, row.get(2)?)?,
        from_stage: from_stage.as_deref().map(|s| parse_stage(3, s)).transpose()?,
        to_stage: to_stage.as_deref().map(|s| parse_stage(4, s)).transpose()?,
        outcome: EventOutcome::parse(&outcome_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown outcome: {outcome_raw}").into(),
            )
        })?,
        detail: row.get(6)?,
        error: row.get(7)?,
    })
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
