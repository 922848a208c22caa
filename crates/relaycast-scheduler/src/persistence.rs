//! SQLite-backed campaign store.
//!
//! Variable maps are stored as JSON text; everything else is plain columns.
//! Recipient writes are compare-and-set on (status, retry_count) and counter
//! refreshes recount inside a transaction, so the scheduler and concurrent
//! webhook handlers can share one database without coordination.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use relaycast_core::error::{RelayError, Result};
use relaycast_core::traits::CampaignStore;
use relaycast_core::types::{
    BusinessAccount, Campaign, CampaignCounters, CampaignRecipient, CampaignStatus,
    RecipientStatus, RecipientTransition, RetrySettings,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite persistence store for campaigns, recipients and accounts.
pub struct CampaignDb {
    conn: Mutex<Connection>,
}

const CAMPAIGN_SELECT: &str = "SELECT id, tenant_id, account_id, template_name, template_language, \
    template_variables, header_media, template_body, status, scheduled_at, started_at, completed_at, \
    total_recipients, sent_count, delivered_count, read_count, failed_count, \
    max_retries, retry_delay_minutes, auto_retry_enabled, created_at FROM campaigns";

const RECIPIENT_SELECT: &str = "SELECT id, campaign_id, phone_number, name, variables, status, \
    provider_message_id, error_message, retry_count, last_retry_at, sent_at, delivered_at, read_at \
    FROM campaign_recipients";

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> RelayError + '_ {
    move |e| RelayError::Database(format!("{context}: {e}"))
}

fn bad_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), rusqlite::types::Type::Text)
}

/// Decode a JSON text column; a corrupt value fails the row.
fn json_column<T: serde::de::DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_campaign(row: &rusqlite::Row) -> rusqlite::Result<Campaign> {
    let status_str: String = row.get(8)?;
    let status = CampaignStatus::parse(&status_str).ok_or_else(|| bad_column(8, "status"))?;

    let total: u32 = row.get(12)?;
    let sent: u32 = row.get(13)?;
    let failed: u32 = row.get(16)?;

    Ok(Campaign {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        account_id: row.get(2)?,
        template_name: row.get(3)?,
        template_language: row.get(4)?,
        template_variables: json_column(row, 5)?,
        header_media: row.get(6)?,
        template_body: row.get(7)?,
        status,
        scheduled_at: parse_ts(row.get(9)?),
        started_at: parse_ts(row.get(10)?),
        completed_at: parse_ts(row.get(11)?),
        counters: CampaignCounters {
            total_recipients: total,
            sent_count: sent,
            delivered_count: row.get(14)?,
            read_count: row.get(15)?,
            failed_count: failed,
            pending_count: total.saturating_sub(sent + failed),
        },
        retry: RetrySettings {
            max_retries: row.get(17)?,
            retry_delay_minutes: row.get(18)?,
            auto_retry_enabled: row.get::<_, i32>(19)? != 0,
        },
        created_at: parse_ts(row.get(20)?).unwrap_or_else(Utc::now),
    })
}

fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<CampaignRecipient> {
    let status_str: String = row.get(5)?;
    let status = RecipientStatus::parse(&status_str).ok_or_else(|| bad_column(5, "status"))?;

    Ok(CampaignRecipient {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        phone_number: row.get(2)?,
        name: row.get(3)?,
        variables: json_column(row, 4)?,
        status,
        provider_message_id: row.get(6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        last_retry_at: parse_ts(row.get(9)?),
        sent_at: parse_ts(row.get(10)?),
        delivered_at: parse_ts(row.get(11)?),
        read_at: parse_ts(row.get(12)?),
    })
}

impl CampaignDb {
    /// Open or create the campaign database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;

        // WAL lets webhook readers proceed while the scheduler writes.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(db_err("DB pragma"))?;

        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("DB pragma"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS business_accounts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                phone_number_id TEXT NOT NULL,
                waba_id TEXT NOT NULL,
                access_token TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                template_name TEXT NOT NULL,
                template_language TEXT NOT NULL,
                template_variables TEXT NOT NULL DEFAULT '{}',  -- JSON map
                header_media TEXT,
                template_body TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                scheduled_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                total_recipients INTEGER NOT NULL DEFAULT 0,
                sent_count INTEGER NOT NULL DEFAULT 0,
                delivered_count INTEGER NOT NULL DEFAULT 0,
                read_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_delay_minutes INTEGER NOT NULL DEFAULT 30,
                auto_retry_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_status
                ON campaigns(status, scheduled_at);

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                phone_number TEXT NOT NULL,
                name TEXT,
                variables TEXT NOT NULL DEFAULT '{}',           -- JSON map
                status TEXT NOT NULL DEFAULT 'pending',
                provider_message_id TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at TEXT,
                sent_at TEXT,
                delivered_at TEXT,
                read_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_campaign_status
                ON campaign_recipients(campaign_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_recipients_message_id
                ON campaign_recipients(provider_message_id)
                WHERE provider_message_id IS NOT NULL;
            ",
        )
        .map_err(db_err("Migration"))?;
        Ok(())
    }

    fn query_recipients<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        args: P,
    ) -> Result<Vec<CampaignRecipient>> {
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map(args, row_to_recipient)
            .map_err(db_err("Query recipients"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read recipient"))
    }

    fn query_campaigns<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        args: P,
    ) -> Result<Vec<Campaign>> {
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map(args, row_to_campaign)
            .map_err(db_err("Query campaigns"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read campaign"))
    }
}

#[async_trait]
impl CampaignStore for CampaignDb {
    async fn insert_campaign(&self, c: &Campaign) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO campaigns
             (id, tenant_id, account_id, template_name, template_language, template_variables,
              header_media, template_body, status, scheduled_at, started_at, completed_at,
              max_retries, retry_delay_minutes, auto_retry_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                c.id,
                c.tenant_id,
                c.account_id,
                c.template_name,
                c.template_language,
                serde_json::to_string(&c.template_variables)?,
                c.header_media,
                c.template_body,
                c.status.as_str(),
                c.scheduled_at.map(ts),
                c.started_at.map(ts),
                c.completed_at.map(ts),
                c.retry.max_retries,
                c.retry.retry_delay_minutes,
                c.retry.auto_retry_enabled as i32,
                ts(c.created_at),
            ],
        )
        .map_err(db_err("Insert campaign"))?;
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let conn = self.lock()?;
        conn.query_row(&format!("{CAMPAIGN_SELECT} WHERE id = ?1"), [id], row_to_campaign)
            .optional()
            .map_err(db_err("Get campaign"))
    }

    async fn transition_campaign(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row("SELECT status FROM campaigns WHERE id = ?1", [id], |r| r.get(0))
            .optional()
            .map_err(db_err("Read campaign status"))?;
        let Some(current) = current else {
            return Err(RelayError::CampaignNotFound(id.to_string()));
        };
        if !from.iter().any(|s| s.as_str() == current) {
            return Ok(false);
        }

        let stamp = ts(at);
        let changed = conn
            .execute(
                "UPDATE campaigns SET
                    status = ?1,
                    started_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?2 ELSE completed_at END
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), stamp, id, current],
            )
            .map_err(db_err("Update campaign status"))?;
        Ok(changed == 1)
    }

    async fn list_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let conn = self.lock()?;
        Self::query_campaigns(
            &conn,
            &format!(
                "{CAMPAIGN_SELECT} WHERE status = 'scheduled' AND scheduled_at IS NOT NULL
                 AND scheduled_at <= ?1 ORDER BY scheduled_at"
            ),
            [ts(now)],
        )
    }

    async fn list_running_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.lock()?;
        Self::query_campaigns(
            &conn,
            &format!("{CAMPAIGN_SELECT} WHERE status = 'running' ORDER BY started_at"),
            [],
        )
    }

    async fn list_auto_retry_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.lock()?;
        Self::query_campaigns(
            &conn,
            &format!(
                "{CAMPAIGN_SELECT} WHERE auto_retry_enabled = 1
                 AND status IN ('completed', 'paused', 'failed') ORDER BY created_at"
            ),
            [],
        )
    }

    async fn insert_recipients(&self, recipients: &[CampaignRecipient]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO campaign_recipients
                     (id, campaign_id, phone_number, name, variables, status, provider_message_id,
                      error_message, retry_count, last_retry_at, sent_at, delivered_at, read_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .map_err(db_err("Prepare"))?;
            for r in recipients {
                stmt.execute(params![
                    r.id,
                    r.campaign_id,
                    r.phone_number,
                    r.name,
                    serde_json::to_string(&r.variables)?,
                    r.status.as_str(),
                    r.provider_message_id,
                    r.error_message,
                    r.retry_count,
                    r.last_retry_at.map(ts),
                    r.sent_at.map(ts),
                    r.delivered_at.map(ts),
                    r.read_at.map(ts),
                ])
                .map_err(db_err("Insert recipient"))?;
            }
        }
        tx.commit().map_err(db_err("Commit"))?;
        Ok(())
    }

    async fn get_recipient(&self, id: &str) -> Result<Option<CampaignRecipient>> {
        let conn = self.lock()?;
        conn.query_row(&format!("{RECIPIENT_SELECT} WHERE id = ?1"), [id], row_to_recipient)
            .optional()
            .map_err(db_err("Get recipient"))
    }

    async fn recipients_by_status(
        &self,
        campaign_id: &str,
        status: RecipientStatus,
    ) -> Result<Vec<CampaignRecipient>> {
        let conn = self.lock()?;
        Self::query_recipients(
            &conn,
            &format!("{RECIPIENT_SELECT} WHERE campaign_id = ?1 AND status = ?2 ORDER BY rowid"),
            params![campaign_id, status.as_str()],
        )
    }

    async fn retry_eligible_recipients(
        &self,
        campaign_id: &str,
        max_retries: u32,
        cooldown_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignRecipient>> {
        let conn = self.lock()?;
        match cooldown_minutes {
            Some(minutes) => {
                let cutoff = ts(now - chrono::Duration::minutes(i64::from(minutes)));
                Self::query_recipients(
                    &conn,
                    &format!(
                        "{RECIPIENT_SELECT} WHERE campaign_id = ?1 AND status = 'failed'
                         AND retry_count < ?2
                         AND (last_retry_at IS NULL OR last_retry_at <= ?3)
                         ORDER BY rowid"
                    ),
                    params![campaign_id, max_retries, cutoff],
                )
            }
            None => Self::query_recipients(
                &conn,
                &format!(
                    "{RECIPIENT_SELECT} WHERE campaign_id = ?1 AND status = 'failed'
                     AND retry_count < ?2 ORDER BY rowid"
                ),
                params![campaign_id, max_retries],
            ),
        }
    }

    async fn recipient_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignRecipient>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{RECIPIENT_SELECT} WHERE provider_message_id = ?1"),
            [provider_message_id],
            row_to_recipient,
        )
        .optional()
        .map_err(db_err("Get recipient by message id"))
    }

    async fn apply_transition(&self, t: &RecipientTransition) -> Result<bool> {
        let conn = self.lock()?;
        let n = &t.next;
        let changed = conn
            .execute(
                "UPDATE campaign_recipients SET
                    status = ?1, provider_message_id = ?2, error_message = ?3, retry_count = ?4,
                    last_retry_at = ?5, sent_at = ?6, delivered_at = ?7, read_at = ?8
                 WHERE id = ?9 AND status = ?10 AND retry_count = ?11",
                params![
                    n.status.as_str(),
                    n.provider_message_id,
                    n.error_message,
                    n.retry_count,
                    n.last_retry_at.map(ts),
                    n.sent_at.map(ts),
                    n.delivered_at.map(ts),
                    n.read_at.map(ts),
                    t.recipient_id,
                    t.expected_status.as_str(),
                    t.expected_retry_count,
                ],
            )
            .map_err(db_err("Update recipient"))?;
        Ok(changed == 1)
    }

    async fn refresh_campaign_counters(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CampaignCounters> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;

        let counters = {
            let mut stmt = tx
                .prepare(
                    "SELECT status, COUNT(*) FROM campaign_recipients
                     WHERE campaign_id = ?1 GROUP BY status",
                )
                .map_err(db_err("Prepare"))?;
            let rows = stmt
                .query_map([campaign_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))
                .map_err(db_err("Count recipients"))?;

            let mut statuses = Vec::new();
            for row in rows {
                let (status, count) = row.map_err(db_err("Count recipients"))?;
                let status = RecipientStatus::parse(&status)
                    .ok_or_else(|| RelayError::Database(format!("Unknown recipient status '{status}'")))?;
                statuses.extend(std::iter::repeat_n(status, count as usize));
            }
            CampaignCounters::tally(statuses)
        };

        let changed = tx
            .execute(
                "UPDATE campaigns SET total_recipients = ?1, sent_count = ?2, delivered_count = ?3,
                    read_count = ?4, failed_count = ?5
                 WHERE id = ?6",
                params![
                    counters.total_recipients,
                    counters.sent_count,
                    counters.delivered_count,
                    counters.read_count,
                    counters.failed_count,
                    campaign_id,
                ],
            )
            .map_err(db_err("Update counters"))?;
        if changed == 0 {
            return Err(RelayError::CampaignNotFound(campaign_id.to_string()));
        }

        if counters.pending_count == 0 {
            tx.execute(
                "UPDATE campaigns SET status = 'completed', completed_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![ts(now), campaign_id],
            )
            .map_err(db_err("Complete campaign"))?;
        }

        tx.commit().map_err(db_err("Commit"))?;
        Ok(counters)
    }

    async fn get_business_account(&self, id: &str) -> Result<Option<BusinessAccount>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, tenant_id, phone_number_id, waba_id, access_token
             FROM business_accounts WHERE id = ?1",
            [id],
            |row| {
                Ok(BusinessAccount {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    phone_number_id: row.get(2)?,
                    waba_id: row.get(3)?,
                    access_token: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err("Get business account"))
    }

    async fn upsert_business_account(&self, a: &BusinessAccount) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO business_accounts
             (id, tenant_id, phone_number_id, waba_id, access_token)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![a.id, a.tenant_id, a.phone_number_id, a.waba_id, a.access_token],
        )
        .map_err(db_err("Upsert business account"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient;
    use chrono::Duration;
    use relaycast_core::types::VariableValue;

    fn temp_db() -> CampaignDb {
        CampaignDb::open_in_memory().unwrap()
    }

    async fn seeded(db: &CampaignDb, status: CampaignStatus, n: usize) -> (Campaign, Vec<CampaignRecipient>) {
        let mut c = Campaign::new("t1", "acct-1", "promo", "en_US");
        c.status = status;
        c.template_variables.insert("name".into(), VariableValue::RecipientName);
        db.insert_campaign(&c).await.unwrap();
        let recipients: Vec<_> = (0..n)
            .map(|i| CampaignRecipient::new(&c.id, &format!("62810000{i}"), Some("Ana")).with_variable("1", "x"))
            .collect();
        db.insert_recipients(&recipients).await.unwrap();
        (c, recipients)
    }

    #[tokio::test]
    async fn test_campaign_round_trip() {
        let db = temp_db();
        let (c, _) = seeded(&db, CampaignStatus::Draft, 0).await;
        let loaded = db.get_campaign(&c.id).await.unwrap().unwrap();
        assert_eq!(loaded.template_variables, c.template_variables);
        assert_eq!(loaded.status, CampaignStatus::Draft);
        assert_eq!(loaded.retry, c.retry);
        assert!(db.get_campaign("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recipient_round_trip_and_message_lookup() {
        let db = temp_db();
        let (_, rs) = seeded(&db, CampaignStatus::Running, 1).await;
        let loaded = db.get_recipient(&rs[0].id).await.unwrap().unwrap();
        assert_eq!(loaded.variables["1"], "x");

        let sent = recipient::mark_sent(&loaded, "wamid.XYZ", Utc::now()).unwrap();
        assert!(db.apply_transition(&RecipientTransition::between(&loaded, sent)).await.unwrap());
        let found = db.recipient_by_provider_message_id("wamid.XYZ").await.unwrap().unwrap();
        assert_eq!(found.id, rs[0].id);
        assert_eq!(found.status, RecipientStatus::Sent);
        assert!(db.recipient_by_provider_message_id("wamid.nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_conflict() {
        let db = temp_db();
        let (_, rs) = seeded(&db, CampaignStatus::Running, 1).await;
        let r = &rs[0];

        let a = recipient::mark_sent(r, "wamid.a", Utc::now()).unwrap();
        let b = recipient::mark_send_failed(r, "boom").unwrap();
        assert!(db.apply_transition(&RecipientTransition::between(r, a)).await.unwrap());
        // Second writer started from the same stale row and loses.
        assert!(!db.apply_transition(&RecipientTransition::between(r, b)).await.unwrap());

        let stored = db.get_recipient(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecipientStatus::Sent);
    }

    #[tokio::test]
    async fn test_refresh_counters_and_completion() {
        let db = temp_db();
        let (c, rs) = seeded(&db, CampaignStatus::Running, 3).await;

        let counters = db.refresh_campaign_counters(&c.id, Utc::now()).await.unwrap();
        assert_eq!(counters.total_recipients, 3);
        assert_eq!(counters.pending_count, 3);

        let now = Utc::now();
        let s0 = recipient::mark_sent(&rs[0], "m0", now).unwrap();
        let d0 = recipient::apply_delivery_event(&s0, relaycast_core::types::DeliveryStatus::Read, now, "").unwrap();
        db.apply_transition(&RecipientTransition::between(&rs[0], d0)).await.unwrap();
        let s1 = recipient::mark_sent(&rs[1], "m1", now).unwrap();
        db.apply_transition(&RecipientTransition::between(&rs[1], s1)).await.unwrap();

        let partial = db.refresh_campaign_counters(&c.id, now).await.unwrap();
        assert_eq!((partial.sent_count, partial.delivered_count, partial.read_count), (2, 1, 1));
        assert_eq!(db.get_campaign(&c.id).await.unwrap().unwrap().status, CampaignStatus::Running);

        let f2 = recipient::mark_send_failed(&rs[2], "invalid number").unwrap();
        db.apply_transition(&RecipientTransition::between(&rs[2], f2)).await.unwrap();
        let done = db.refresh_campaign_counters(&c.id, now).await.unwrap();
        assert_eq!(done.sent_count + done.failed_count + done.pending_count, done.total_recipients);

        let stored = db.get_campaign(&c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.counters, done);
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let db = temp_db();
        let (c, _) = seeded(&db, CampaignStatus::Scheduled, 0).await;
        let now = Utc::now();

        assert!(!db
            .transition_campaign(&c.id, &[CampaignStatus::Draft], CampaignStatus::Running, now)
            .await
            .unwrap());
        assert!(db
            .transition_campaign(&c.id, &[CampaignStatus::Scheduled], CampaignStatus::Running, now)
            .await
            .unwrap());
        let stored = db.get_campaign(&c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Running);
        assert!(stored.started_at.is_some());

        let missing = db
            .transition_campaign("nope", &[CampaignStatus::Draft], CampaignStatus::Running, now)
            .await;
        assert!(matches!(missing, Err(RelayError::CampaignNotFound(_))));
    }

    #[tokio::test]
    async fn test_due_and_retry_listings() {
        let db = temp_db();
        let now = Utc::now();

        let due = Campaign::new("t1", "a", "promo", "en").schedule_at(now - Duration::minutes(1));
        let future = Campaign::new("t1", "a", "promo", "en").schedule_at(now + Duration::hours(1));
        let mut sweep = Campaign::new("t1", "a", "promo", "en");
        sweep.status = CampaignStatus::Completed;
        sweep.retry.auto_retry_enabled = true;
        let mut running = Campaign::new("t1", "a", "promo", "en");
        running.status = CampaignStatus::Running;
        running.retry.auto_retry_enabled = true;
        for c in [&due, &future, &sweep, &running] {
            db.insert_campaign(c).await.unwrap();
        }

        let listed = db.list_due_campaigns(now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);

        let retry = db.list_auto_retry_campaigns().await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].id, sweep.id);

        let resumable = db.list_running_campaigns().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, running.id);
    }

    #[tokio::test]
    async fn test_corrupt_variables_surface_as_database_error() {
        let db = temp_db();
        let (c, rs) = seeded(&db, CampaignStatus::Running, 1).await;
        {
            let conn = db.lock().unwrap();
            conn.execute("UPDATE campaign_recipients SET variables = '{\"1\":' WHERE id = ?1", [&rs[0].id])
                .unwrap();
            conn.execute("UPDATE campaigns SET template_variables = 'not json' WHERE id = ?1", [&c.id])
                .unwrap();
        }

        assert!(matches!(db.get_recipient(&rs[0].id).await, Err(RelayError::Database(_))));
        assert!(matches!(
            db.recipients_by_status(&c.id, RecipientStatus::Pending).await,
            Err(RelayError::Database(_))
        ));
        assert!(matches!(db.get_campaign(&c.id).await, Err(RelayError::Database(_))));
    }

    #[tokio::test]
    async fn test_business_account_upsert() {
        let db = temp_db();
        let mut acct = BusinessAccount {
            id: "acct-1".into(),
            tenant_id: "t1".into(),
            phone_number_id: "1055".into(),
            waba_id: "2077".into(),
            access_token: "EAAG".into(),
        };
        db.upsert_business_account(&acct).await.unwrap();
        acct.access_token = "EAAH".into();
        db.upsert_business_account(&acct).await.unwrap();
        assert_eq!(db.get_business_account("acct-1").await.unwrap(), Some(acct));
        assert!(db.get_business_account("other").await.unwrap().is_none());
    }
}
