use crate::data::find_pack;
use crate::models::{Fact, PackMeta, UserConfig};
use crate::session::{ProvisionRequest, Provisioner};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    ConnectOptions, Pool, Row, Sqlite, SqliteConnection,
};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::str::FromStr;

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Fact {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let operands_json: String = row.try_get("operands")?;
        let operands: Vec<i64> =
            serde_json::from_str(&operands_json).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        let level: i64 = row.try_get("level")?;
        let difficulty: i64 = row.try_get("difficulty").unwrap_or(0);
        let box_level: i64 = row.try_get("box")?;
        let last_elapsed_time: i64 = row.try_get("last_elapsed_time").unwrap_or(0);
        let seen: i64 = row.try_get("seen")?;
        let correct: i64 = row.try_get("correct")?;
        let incorrect: i64 = row.try_get("incorrect")?;

        Ok(Fact {
            id: row.try_get("id")?,
            pack: row.try_get("pack")?,
            operands,
            answer: row.try_get("answer")?,
            level: level as u32,
            difficulty: difficulty as u32,
            box_level: box_level.max(1) as u32,
            next_due_time: row.try_get("next_due_time")?,
            last_reviewed: row.try_get("last_reviewed")?,
            was_last_review_correct: row.try_get("was_last_review_correct").unwrap_or(false),
            last_elapsed_time: last_elapsed_time as u32,
            avg_response_time: row.try_get("avg_response_time")?,
            seen: seen as u32,
            correct: correct as u32,
            incorrect: incorrect as u32,
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for UserConfig {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let active_group: i64 = row.try_get("active_group")?;
        let max_new: i64 = row.try_get("max_new_cards_per_day")?;
        let seen_today: i64 = row.try_get("new_cards_seen_today")?;

        Ok(UserConfig {
            id: row.try_get("id")?,
            active_pack: row.try_get("active_pack")?,
            active_group: active_group.max(1) as u32,
            table: row.try_get("table_filter")?,
            max_new_cards_per_day: max_new as u32,
            new_cards_seen_today: seen_today as u32,
            last_new_card_date: row.try_get::<Option<NaiveDate>, _>("last_new_card_date")?,
        })
    }
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database, kept alive on a single connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                pack TEXT NOT NULL,
                seq INTEGER NOT NULL,
                operands TEXT NOT NULL,
                answer INTEGER NOT NULL,
                level INTEGER NOT NULL DEFAULT 1,
                difficulty INTEGER NOT NULL DEFAULT 0,
                box INTEGER NOT NULL DEFAULT 1,
                next_due_time DATETIME NOT NULL,
                last_reviewed DATETIME,
                was_last_review_correct BOOLEAN NOT NULL DEFAULT 0,
                last_elapsed_time INTEGER NOT NULL DEFAULT 0,
                avg_response_time REAL,
                seen INTEGER NOT NULL DEFAULT 0,
                correct INTEGER NOT NULL DEFAULT 0,
                incorrect INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS facts_pack_seq ON facts (pack, seq)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pack_meta (
                pack TEXT PRIMARY KEY,
                total_facts INTEGER NOT NULL,
                next_seq_to_introduce INTEGER NOT NULL DEFAULT 0,
                is_completed BOOLEAN NOT NULL DEFAULT 0,
                last_activity DATETIME
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                active_pack TEXT NOT NULL,
                active_group INTEGER NOT NULL DEFAULT 1,
                table_filter INTEGER,
                max_new_cards_per_day INTEGER NOT NULL DEFAULT 10,
                new_cards_seen_today INTEGER NOT NULL DEFAULT 0,
                last_new_card_date TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn facts_for_pack(&self, pack: &str) -> anyhow::Result<Vec<Fact>> {
        let facts = sqlx::query_as::<_, Fact>("SELECT * FROM facts WHERE pack = ? ORDER BY seq ASC")
            .bind(pack)
            .fetch_all(&self.pool)
            .await?;
        Ok(facts)
    }

    /// Writes back review progress, and the learner profile when given, in one transaction.
    pub async fn save_progress(&self, facts: &[Fact], user: Option<&UserConfig>) -> anyhow::Result<()> {
        if facts.is_empty() && user.is_none() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for fact in facts {
            sqlx::query(
                r#"
                UPDATE facts SET
                    box = ?, next_due_time = ?, last_reviewed = ?, was_last_review_correct = ?,
                    last_elapsed_time = ?, avg_response_time = ?, seen = ?, correct = ?, incorrect = ?
                WHERE id = ?
                "#,
            )
            .bind(fact.box_level as i64)
            .bind(fact.next_due_time)
            .bind(fact.last_reviewed)
            .bind(fact.was_last_review_correct)
            .bind(fact.last_elapsed_time as i64)
            .bind(fact.avg_response_time)
            .bind(fact.seen as i64)
            .bind(fact.correct as i64)
            .bind(fact.incorrect as i64)
            .bind(&fact.id)
            .execute(&mut *tx)
            .await?;
        }

        let now = Utc::now();
        let packs: BTreeSet<&str> = facts.iter().map(|f| f.pack.as_str()).collect();
        for pack in packs {
            sqlx::query("UPDATE pack_meta SET last_activity = ? WHERE pack = ?")
                .bind(now)
                .bind(pack)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(user) = user {
            write_user(&mut tx, user).await?;
        }

        tx.commit().await?;
        log::debug!("saved {} facts", facts.len());
        Ok(())
    }

    pub async fn pack_meta(&self, pack: &str) -> anyhow::Result<Option<PackMeta>> {
        let row = sqlx::query("SELECT * FROM pack_meta WHERE pack = ?")
            .bind(pack)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let total: i64 = row.try_get("total_facts")?;
        let next_seq: i64 = row.try_get("next_seq_to_introduce")?;

        Ok(Some(PackMeta {
            total_facts: total as u32,
            next_seq_to_introduce: next_seq as u32,
            is_completed: row.try_get("is_completed")?,
            last_activity: row.try_get::<Option<DateTime<Utc>>, _>("last_activity")?,
        }))
    }

    /// Introduces up to `request.count` facts the learner can actually be served:
    /// facts matching the table filter, from groups up to `active_group`. Once
    /// those groups are fully introduced the batch comes from the lowest group
    /// that still has facts left. Returns how many were added.
    pub async fn introduce_facts(&self, request: &ProvisionRequest) -> anyhow::Result<usize> {
        let pack = request.pack_name.as_str();
        let Some(def) = find_pack(pack) else {
            anyhow::bail!("unknown fact pack '{}'", pack);
        };

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: HashSet<String> = sqlx::query_scalar::<_, String>("SELECT id FROM facts WHERE pack = ?")
            .bind(pack)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        // seq is the position in the pack's introduction order
        let candidates: Vec<(usize, Fact)> = def
            .facts_in_order(now)
            .into_iter()
            .enumerate()
            .filter(|(_, f)| !existing.contains(&f.id))
            .filter(|(_, f)| request.table.map_or(true, |t| f.operands.contains(&t)))
            .collect();

        let group = request.active_group.max(1);
        let ceiling = if candidates.iter().any(|(_, f)| f.level <= group) {
            group
        } else {
            candidates.first().map_or(group, |(_, f)| f.level)
        };

        let batch: Vec<(usize, Fact)> = candidates
            .into_iter()
            .filter(|(_, f)| f.level <= ceiling)
            .take(request.count)
            .collect();

        for (seq, fact) in &batch {
            let operands = serde_json::to_string(&fact.operands)?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO facts (id, pack, seq, operands, answer, level, difficulty, box, next_due_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&fact.id)
            .bind(&fact.pack)
            .bind(*seq as i64)
            .bind(operands)
            .bind(fact.answer)
            .bind(fact.level as i64)
            .bind(fact.difficulty as i64)
            .bind(fact.box_level as i64)
            .bind(fact.next_due_time)
            .execute(&mut *tx)
            .await?;
        }

        let total = def.total_facts() as usize;
        let introduced = existing.len() + batch.len();
        sqlx::query(
            r#"
            INSERT INTO pack_meta (pack, total_facts, next_seq_to_introduce, is_completed, last_activity)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(pack) DO UPDATE SET
                total_facts = excluded.total_facts,
                next_seq_to_introduce = excluded.next_seq_to_introduce,
                is_completed = excluded.is_completed,
                last_activity = excluded.last_activity
            "#,
        )
        .bind(pack)
        .bind(total as i64)
        .bind(introduced as i64)
        .bind(introduced >= total)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        log::info!(
            "introduced {} facts into pack {} up to group {} ({}/{})",
            batch.len(),
            pack,
            ceiling,
            introduced,
            total
        );
        Ok(batch.len())
    }

    /// Loads a profile, creating a default one on first use.
    pub async fn load_user(&self, id: &str, default_pack: &str) -> anyhow::Result<UserConfig> {
        let existing = sqlx::query_as::<_, UserConfig>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some(user) => Ok(user),
            None => {
                let user = UserConfig::new(id, default_pack);
                self.save_user(&user).await?;
                Ok(user)
            }
        }
    }

    pub async fn save_user(&self, user: &UserConfig) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_user(&mut conn, user).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn write_user(conn: &mut SqliteConnection, user: &UserConfig) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users (id, active_pack, active_group, table_filter, max_new_cards_per_day,
                           new_cards_seen_today, last_new_card_date)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            active_pack = excluded.active_pack,
            active_group = excluded.active_group,
            table_filter = excluded.table_filter,
            max_new_cards_per_day = excluded.max_new_cards_per_day,
            new_cards_seen_today = excluded.new_cards_seen_today,
            last_new_card_date = excluded.last_new_card_date
        "#,
    )
    .bind(&user.id)
    .bind(&user.active_pack)
    .bind(user.active_group as i64)
    .bind(user.table)
    .bind(user.max_new_cards_per_day as i64)
    .bind(user.new_cards_seen_today as i64)
    .bind(user.last_new_card_date)
    .execute(conn)
    .await?;
    Ok(())
}

/// Provisioning backed by the built-in packs: introduces the next facts in sequence.
#[derive(Clone)]
pub struct DbProvisioner {
    db: Db,
}

impl DbProvisioner {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl Provisioner for DbProvisioner {
    fn provision_facts(
        &self,
        request: ProvisionRequest,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send {
        async move { self.db.introduce_facts(&request).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pack: &str, count: usize, active_group: u32) -> ProvisionRequest {
        ProvisionRequest {
            pack_name: pack.to_string(),
            count,
            active_group,
            table: None,
        }
    }

    #[tokio::test]
    async fn test_introduce_facts_in_sequence() {
        let db = Db::in_memory().await.unwrap();

        assert_eq!(db.introduce_facts(&request("mul", 3, 2)).await.unwrap(), 3);
        assert_eq!(db.introduce_facts(&request("mul", 7, 2)).await.unwrap(), 7);

        let facts = db.facts_for_pack("mul").await.unwrap();
        assert_eq!(facts.len(), 10);
        assert_eq!(facts[0].id, "mul:1:1");
        assert!(facts.iter().all(|f| f.is_new() && f.box_level == 1));
        assert!(facts.windows(2).all(|w| w[0].level <= w[1].level));

        let meta = db.pack_meta("mul").await.unwrap().unwrap();
        assert_eq!(meta.total_facts, 144);
        assert_eq!(meta.next_seq_to_introduce, 10);
        assert!(!meta.is_completed);
    }

    #[tokio::test]
    async fn test_introduce_stays_in_active_group() {
        let db = Db::in_memory().await.unwrap();

        // mul group 1 holds the nine facts with operands up to 3
        assert_eq!(db.introduce_facts(&request("mul", 10, 1)).await.unwrap(), 9);
        let facts = db.facts_for_pack("mul").await.unwrap();
        assert!(facts.iter().all(|f| f.level == 1));
    }

    #[tokio::test]
    async fn test_introduce_moves_to_next_group_when_exhausted() {
        let db = Db::in_memory().await.unwrap();
        db.introduce_facts(&request("mul", 10, 1)).await.unwrap();

        assert_eq!(db.introduce_facts(&request("mul", 10, 1)).await.unwrap(), 10);

        let facts = db.facts_for_pack("mul").await.unwrap();
        assert_eq!(facts.len(), 19);
        assert_eq!(facts.iter().filter(|f| f.level == 2).count(), 10);
        assert!(facts.iter().all(|f| f.level <= 2));
    }

    #[tokio::test]
    async fn test_introduce_respects_table_filter() {
        let db = Db::in_memory().await.unwrap();
        let mut sevens = request("mul", 10, 1);
        sevens.table = Some(7);

        assert_eq!(db.introduce_facts(&sevens).await.unwrap(), 10);

        let facts = db.facts_for_pack("mul").await.unwrap();
        assert!(facts.iter().all(|f| f.operands.contains(&7)));
        // sevens start in group 3
        assert!(facts.iter().all(|f| f.level == 3));
        assert_eq!(facts[0].id, "mul:1:7");
        assert_eq!(db.pack_meta("mul").await.unwrap().unwrap().next_seq_to_introduce, 10);
    }

    #[tokio::test]
    async fn test_introduce_past_end_completes_pack() {
        let db = Db::in_memory().await.unwrap();

        assert_eq!(db.introduce_facts(&request("add", 500, 3)).await.unwrap(), 121);
        assert_eq!(db.introduce_facts(&request("add", 10, 3)).await.unwrap(), 0);

        let meta = db.pack_meta("add").await.unwrap().unwrap();
        assert!(meta.is_completed);
        assert_eq!(meta.next_seq_to_introduce, 121);
    }

    #[tokio::test]
    async fn test_unknown_pack_fails() {
        let db = Db::in_memory().await.unwrap();
        assert!(db.introduce_facts(&request("div", 5, 1)).await.is_err());
        assert!(db.pack_meta("div").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_progress_persists_facts_and_profile() {
        let db = Db::in_memory().await.unwrap();
        db.introduce_facts(&request("mul", 3, 1)).await.unwrap();

        let mut fact = db.facts_for_pack("mul").await.unwrap().remove(1);
        fact.box_level = 3;
        fact.seen = 2;
        fact.correct = 2;
        fact.avg_response_time = Some(1850.5);
        fact.last_elapsed_time = 1700;
        fact.was_last_review_correct = true;
        fact.last_reviewed = Some(Utc::now());

        let mut user = db.load_user("kid", "mul").await.unwrap();
        user.record_new_card(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        db.save_progress(std::slice::from_ref(&fact), Some(&user)).await.unwrap();

        let reloaded = db
            .facts_for_pack("mul")
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.id == fact.id)
            .unwrap();
        assert_eq!(reloaded.box_level, 3);
        assert_eq!(reloaded.seen, 2);
        assert_eq!(reloaded.avg_response_time, Some(1850.5));
        assert!(reloaded.was_last_review_correct);
        assert!(reloaded.last_reviewed.is_some());
        assert!(db.pack_meta("mul").await.unwrap().unwrap().last_activity.is_some());
        assert_eq!(db.load_user("kid", "mul").await.unwrap().new_cards_seen_today, 1);
    }

    #[tokio::test]
    async fn test_save_progress_fails_on_closed_store() {
        let db = Db::in_memory().await.unwrap();
        db.introduce_facts(&request("mul", 1, 1)).await.unwrap();
        let fact = db.facts_for_pack("mul").await.unwrap().remove(0);

        db.close().await;

        assert!(db.save_progress(&[fact], None).await.is_err());
    }

    #[tokio::test]
    async fn test_user_profile_roundtrip() {
        let db = Db::in_memory().await.unwrap();

        let mut user = db.load_user("kid", "mul").await.unwrap();
        assert_eq!(user.active_pack, "mul");
        assert_eq!(user.new_cards_seen_today, 0);

        user.table = Some(7);
        user.active_group = 2;
        user.record_new_card(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        db.save_user(&user).await.unwrap();

        let loaded = db.load_user("kid", "add").await.unwrap();
        assert_eq!(loaded, user);
    }

    #[tokio::test]
    async fn test_provisioner_introduces_facts() {
        let db = Db::in_memory().await.unwrap();
        let provisioner = DbProvisioner::new(db.clone());

        let added = provisioner.provision_facts(request("mul", 4, 1)).await.unwrap();

        assert_eq!(added, 4);
        assert_eq!(db.facts_for_pack("mul").await.unwrap().len(), 4);
    }
}
