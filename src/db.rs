use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::models::{
    AttemptCsvRow, AuthUser, Child, CohortRow, Explanations, ImpersonationGrant, PracticeAttempt,
    Profile, Question, SessionRecord, Subscription,
};
use crate::store::Store;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PROFILE_COLUMNS: &str = "id, full_name, email, role, subscription_tier, subscription_status, \
     current_period_end, billing_customer_id, billing_subscription_id";

const CHILD_COLUMNS: &str = "id, parent_id, name, year_group, exam_type, avatar, is_active, created_at";

fn profile_from_row(row: &PgRow) -> anyhow::Result<Profile> {
    Ok(Profile {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        role: row.get::<String, _>("role").parse()?,
        subscription: Subscription {
            tier: row.get::<String, _>("subscription_tier").parse()?,
            status: row.get::<String, _>("subscription_status").parse()?,
            current_period_end: row.get("current_period_end"),
            billing_customer_id: row.get("billing_customer_id"),
            billing_subscription_id: row.get("billing_subscription_id"),
        },
    })
}

fn child_from_row(row: &PgRow) -> anyhow::Result<Child> {
    Ok(Child {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        name: row.get("name"),
        year_group: row.get("year_group"),
        exam_type: row.get::<String, _>("exam_type").parse()?,
        avatar: row.get("avatar"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_session(&self, token_hash: &str) -> anyhow::Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT user_id, expires_at FROM elevenplus.sessions WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SessionRecord {
            user_id: row.get("user_id"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn create_session(
        &self,
        token_hash: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO elevenplus.sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_auth_user_by_email(&self, email: &str) -> anyhow::Result<Option<AuthUser>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash FROM elevenplus.auth_users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AuthUser {
            id: row.get("id"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
        }))
    }

    async fn create_auth_user(&self, email: &str, password_hash: &str) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO elevenplus.auth_users (id, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(id)
    }

    async fn delete_auth_user(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM elevenplus.auth_users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_profile(&self, id: Uuid) -> anyhow::Result<Option<Profile>> {
        let query = format!("SELECT {PROFILE_COLUMNS} FROM elevenplus.profiles WHERE id = $1");
        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(profile_from_row)
            .transpose()
    }

    async fn insert_profile(&self, profile: &Profile) -> anyhow::Result<()> {
        let subscription = &profile.subscription;
        sqlx::query(
            r#"
            INSERT INTO elevenplus.profiles
            (id, full_name, email, role, subscription_tier, subscription_status,
             current_period_end, billing_customer_id, billing_subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(profile.id)
        .bind(&profile.full_name)
        .bind(&profile.email)
        .bind(profile.role.as_str())
        .bind(subscription.tier.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_end)
        .bind(&subscription.billing_customer_id)
        .bind(&subscription.billing_subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_child(&self, child: &Child) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO elevenplus.children
            (id, parent_id, name, year_group, exam_type, avatar, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(child.id)
        .bind(child.parent_id)
        .bind(&child.name)
        .bind(child.year_group)
        .bind(child.exam_type.as_str())
        .bind(&child.avatar)
        .bind(child.is_active)
        .bind(child.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_child(&self, id: Uuid) -> anyhow::Result<Option<Child>> {
        let query = format!("SELECT {CHILD_COLUMNS} FROM elevenplus.children WHERE id = $1");
        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(child_from_row)
            .transpose()
    }

    async fn fetch_attempts(
        &self,
        child_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PracticeAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, subject, topic, is_correct,
                   response_time_ms, difficulty, answered_at
            FROM elevenplus.practice_attempts
            WHERE child_id = $1 AND answered_at > $2
            ORDER BY answered_at
            "#,
        )
        .bind(child_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PracticeAttempt {
                session_id: row.get("session_id"),
                subject: row.get("subject"),
                topic: row.get("topic"),
                is_correct: row.get("is_correct"),
                response_time_ms: row.get("response_time_ms"),
                difficulty: row.get("difficulty"),
                answered_at: row.get("answered_at"),
            })
            .collect())
    }

    async fn practice_days(
        &self,
        child_id: Uuid,
        until: DateTime<Utc>,
    ) -> anyhow::Result<BTreeSet<NaiveDate>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT (answered_at AT TIME ZONE 'UTC')::date AS day
            FROM elevenplus.practice_attempts
            WHERE child_id = $1 AND answered_at <= $2
            "#,
        )
        .bind(child_id)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<NaiveDate, _>("day")).collect())
    }

    async fn count_curriculum_topics(&self) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS topics FROM (SELECT DISTINCT subject, topic FROM elevenplus.questions) t",
        )
        .fetch_one(&self.pool)
        .await?
        .get("topics");
        Ok(usize::try_from(count)?)
    }

    async fn cohort_rows(
        &self,
        child: &Child,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CohortRow>> {
        let rows = sqlx::query(
            r#"
            SELECT a.child_id, a.subject,
                   COUNT(*) FILTER (WHERE a.is_correct) AS correct,
                   COUNT(*) AS total
            FROM elevenplus.practice_attempts a
            JOIN elevenplus.children c ON c.id = a.child_id
            WHERE c.is_active
              AND c.year_group = $1
              AND c.exam_type = $2
              AND a.answered_at > $3
            GROUP BY a.child_id, a.subject
            "#,
        )
        .bind(child.year_group)
        .bind(child.exam_type.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CohortRow {
                child_id: row.get("child_id"),
                subject: row.get("subject"),
                correct: row.get("correct"),
                total: row.get("total"),
            })
            .collect())
    }

    async fn find_question(&self, id: Uuid) -> anyhow::Result<Option<Question>> {
        let row = sqlx::query(
            r#"
            SELECT id, subject, topic, difficulty, question_text, options::text AS options,
                   correct_answer, explanation, cached_explanations::text AS cached_explanations
            FROM elevenplus.questions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let options: String = row.get("options");
        let cached: Option<String> = row.get("cached_explanations");
        // Cached explanations that no longer parse are treated as missing and regenerated.
        let cached_explanations = cached.and_then(|raw| serde_json::from_str(&raw).ok());

        Ok(Some(Question {
            id: row.get("id"),
            subject: row.get("subject"),
            topic: row.get("topic"),
            difficulty: row.get("difficulty"),
            question_text: row.get("question_text"),
            options: serde_json::from_str(&options).context("question options are not a JSON array")?,
            correct_answer: row.get("correct_answer"),
            explanation: row.get("explanation"),
            cached_explanations,
        }))
    }

    async fn cache_explanations(
        &self,
        id: Uuid,
        explanations: &Explanations,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE elevenplus.questions SET cached_explanations = $2::jsonb WHERE id = $1",
        )
        .bind(id)
        .bind(serde_json::to_string(explanations)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_trust_score(&self, id: Uuid, score: i16) -> anyhow::Result<()> {
        sqlx::query("UPDATE elevenplus.questions SET trust_score = $2 WHERE id = $1")
            .bind(id)
            .bind(score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_impersonation(
        &self,
        token_hash: &str,
        grant: &ImpersonationGrant,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO elevenplus.impersonation_grants
            (token_hash, admin_id, target_user_id, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(token_hash)
        .bind(grant.admin_id)
        .bind(grant.target_user_id)
        .bind(grant.expires_at)
        .bind(grant.revoked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_impersonation(
        &self,
        token_hash: &str,
    ) -> anyhow::Result<Option<ImpersonationGrant>> {
        let row = sqlx::query(
            r#"
            SELECT admin_id, target_user_id, expires_at, revoked
            FROM elevenplus.impersonation_grants
            WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ImpersonationGrant {
            admin_id: row.get("admin_id"),
            target_user_id: row.get("target_user_id"),
            expires_at: row.get("expires_at"),
            revoked: row.get("revoked"),
        }))
    }

    async fn revoke_impersonation(&self, token_hash: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE elevenplus.impersonation_grants SET revoked = TRUE WHERE token_hash = $1 AND NOT revoked",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Credentials created by [`seed`]; the password is regenerated on every run.
pub struct SeedAccounts {
    pub admin_email: &'static str,
    pub parent_email: &'static str,
    pub password: String,
    pub child_id: Uuid,
}

async fn upsert_seed_user(
    pool: &PgPool,
    id: Uuid,
    email: &str,
    full_name: &str,
    role: &str,
    tier: &str,
    password_hash: &str,
) -> anyhow::Result<Uuid> {
    let user_id: Uuid = sqlx::query(
        r#"
        INSERT INTO elevenplus.auth_users (id, email, password_hash)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET password_hash = EXCLUDED.password_hash
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await?
    .get("id");

    sqlx::query(
        r#"
        INSERT INTO elevenplus.profiles (id, full_name, email, role, subscription_tier)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET full_name = EXCLUDED.full_name, role = EXCLUDED.role,
            subscription_tier = EXCLUDED.subscription_tier
        "#,
    )
    .bind(user_id)
    .bind(full_name)
    .bind(email)
    .bind(role)
    .bind(tier)
    .execute(pool)
    .await?;

    Ok(user_id)
}

/// Keyed by offset from the seed day, never by calendar date.
fn seed_source_key(days_ago: i64, question: usize) -> String {
    format!("seed-{days_ago}-{question}")
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<SeedAccounts> {
    let password = auth::generate_temporary_password();
    let password_hash = auth::hash_password(&password);

    upsert_seed_user(
        pool,
        Uuid::parse_str("7a3c1c8e-5b0e-4d6a-9d55-0f3c2a61b001")?,
        "admin@elevenplus.test",
        "Site Admin",
        "admin",
        "summit",
        &password_hash,
    )
    .await?;
    let parent_id = upsert_seed_user(
        pool,
        Uuid::parse_str("7a3c1c8e-5b0e-4d6a-9d55-0f3c2a61b002")?,
        "parent@elevenplus.test",
        "Priya Shah",
        "parent",
        "summit",
        &password_hash,
    )
    .await?;

    let child_id = Uuid::parse_str("2f6d8b41-1a9c-4c77-b3c5-6a1e0d2c7001")?;
    sqlx::query(
        r#"
        INSERT INTO elevenplus.children (id, parent_id, name, year_group, exam_type)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(child_id)
    .bind(parent_id)
    .bind("Arjun")
    .bind(5i16)
    .bind("gl")
    .execute(pool)
    .await?;

    let questions = [
        ("c1a0e7c2-0000-4000-8000-000000000001", "mathematics", "Fractions", 2, "What is three quarters of 20?", vec!["10", "15", "12", "5"], "15"),
        ("c1a0e7c2-0000-4000-8000-000000000002", "mathematics", "Ratio", 3, "Share 24 sweets in the ratio 1:3. How many are in the larger share?", vec!["6", "16", "18", "20"], "18"),
        ("c1a0e7c2-0000-4000-8000-000000000003", "english", "Synonyms", 1, "Which word means the same as 'happy'?", vec!["sad", "joyful", "angry", "tired"], "joyful"),
        ("c1a0e7c2-0000-4000-8000-000000000004", "verbal_reasoning", "Codes", 2, "If CAT is written as DBU, how is DOG written?", vec!["EPH", "CNF", "EOH", "DPH"], "EPH"),
        ("c1a0e7c2-0000-4000-8000-000000000005", "non_verbal_reasoning", "Rotation", 2, "Which shape is the first shape rotated a quarter turn clockwise?", vec!["A", "B", "C", "D"], "C"),
    ];

    for (id, subject, topic, difficulty, text, options, answer) in &questions {
        sqlx::query(
            r#"
            INSERT INTO elevenplus.questions
            (id, subject, topic, difficulty, question_text, options, correct_answer)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Uuid::parse_str(id)?)
        .bind(*subject)
        .bind(*topic)
        .bind(*difficulty as i16)
        .bind(*text)
        .bind(serde_json::to_string(options)?)
        .bind(*answer)
        .execute(pool)
        .await?;
    }

    // Three weeks of practice ending today, one session a day, with per-topic accuracy baked in.
    // Earlier seed history is replaced so reruns on later days do not stack a second copy.
    let cleared = sqlx::query(
        "DELETE FROM elevenplus.practice_attempts WHERE child_id = $1 AND source_key LIKE 'seed-%'",
    )
    .bind(child_id)
    .execute(pool)
    .await?
    .rows_affected();
    let now = Utc::now();
    let mut inserted = 0u64;
    for day in 0..21i64 {
        let session_id = Uuid::new_v4();
        for (n, (id, subject, topic, difficulty, _, _, _)) in questions.iter().enumerate() {
            let accuracy_pct = match *topic {
                "Fractions" => 45,
                "Ratio" => 62,
                "Synonyms" => 90,
                "Codes" => 74,
                _ => 81,
            };
            let is_correct = ((day * 37 + n as i64 * 11) % 100) < accuracy_pct;
            let answered_at = now - Duration::days(day) - Duration::minutes(90 - n as i64 * 2);
            let result = sqlx::query(
                r#"
                INSERT INTO elevenplus.practice_attempts
                (id, child_id, question_id, session_id, subject, topic, is_correct,
                 response_time_ms, difficulty, answered_at, source_key)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(child_id)
            .bind(Uuid::parse_str(id)?)
            .bind(session_id)
            .bind(*subject)
            .bind(*topic)
            .bind(is_correct)
            .bind(4_000 + ((day * 13 + n as i64 * 7) % 40) as i32 * 1_000)
            .bind(*difficulty as i16)
            .bind(answered_at)
            .bind(seed_source_key(day, n))
            .execute(pool)
            .await?;
            inserted += result.rows_affected();
        }
    }
    info!(cleared, inserted, "seeded practice attempts");

    Ok(SeedAccounts {
        admin_email: "admin@elevenplus.test",
        parent_email: "parent@elevenplus.test",
        password,
        child_id,
    })
}

pub async fn import_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<AttemptCsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid CSV row {}", line + 1))?;
        if !(1..=3).contains(&row.difficulty) || row.response_time_ms < 0 {
            anyhow::bail!("CSV row {} has out-of-range difficulty or response time", line + 1);
        }
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO elevenplus.practice_attempts
            (id, child_id, question_id, session_id, subject, topic, is_correct,
             response_time_ms, difficulty, answered_at, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.child_id)
        .bind(row.question_id)
        .bind(row.session_id)
        .bind(&row.subject)
        .bind(&row.topic)
        .bind(row.is_correct)
        .bind(row.response_time_ms)
        .bind(row.difficulty)
        .bind(row.answered_at)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn seed_keys_do_not_depend_on_the_run_date() {
        assert_eq!(seed_source_key(0, 0), "seed-0-0");
        assert_eq!(seed_source_key(20, 4), "seed-20-4");

        let keys: HashSet<String> = (0..21i64)
            .flat_map(|day| (0..5).map(move |n| seed_source_key(day, n)))
            .collect();
        assert_eq!(keys.len(), 105);
        assert!(keys.iter().all(|k| k.starts_with("seed-") && k.matches('-').count() == 2));
    }
}
