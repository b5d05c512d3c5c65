use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    AuthUser, Child, CohortRow, Explanations, ImpersonationGrant, PracticeAttempt, Profile,
    Question, SessionRecord,
};

/// Persistence seam between handlers and the database.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_session(&self, token_hash: &str) -> anyhow::Result<Option<SessionRecord>>;

    async fn create_session(
        &self,
        token_hash: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn find_auth_user_by_email(&self, email: &str) -> anyhow::Result<Option<AuthUser>>;

    async fn create_auth_user(&self, email: &str, password_hash: &str) -> anyhow::Result<Uuid>;

    async fn delete_auth_user(&self, id: Uuid) -> anyhow::Result<()>;

    async fn find_profile(&self, id: Uuid) -> anyhow::Result<Option<Profile>>;

    async fn insert_profile(&self, profile: &Profile) -> anyhow::Result<()>;

    async fn insert_child(&self, child: &Child) -> anyhow::Result<()>;

    async fn find_child(&self, id: Uuid) -> anyhow::Result<Option<Child>>;

    /// Attempts answered after `since`, oldest first.
    async fn fetch_attempts(
        &self,
        child_id: Uuid,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PracticeAttempt>>;

    /// Every calendar day (UTC) up to `until` with at least one answer.
    async fn practice_days(
        &self,
        child_id: Uuid,
        until: DateTime<Utc>,
    ) -> anyhow::Result<BTreeSet<NaiveDate>>;

    /// Distinct (subject, topic) pairs in the question bank.
    async fn count_curriculum_topics(&self) -> anyhow::Result<usize>;

    /// Per-child, per-subject totals for active children sharing the child's year group and exam type.
    async fn cohort_rows(&self, child: &Child, since: DateTime<Utc>)
        -> anyhow::Result<Vec<CohortRow>>;

    async fn find_question(&self, id: Uuid) -> anyhow::Result<Option<Question>>;

    async fn cache_explanations(&self, id: Uuid, explanations: &Explanations)
        -> anyhow::Result<()>;

    async fn update_trust_score(&self, id: Uuid, score: i16) -> anyhow::Result<()>;

    async fn create_impersonation(
        &self,
        token_hash: &str,
        grant: &ImpersonationGrant,
    ) -> anyhow::Result<()>;

    async fn find_impersonation(&self, token_hash: &str)
        -> anyhow::Result<Option<ImpersonationGrant>>;

    /// Returns whether a grant was revoked.
    async fn revoke_impersonation(&self, token_hash: &str) -> anyhow::Result<bool>;
}

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;
    use chrono::Duration;

    use super::*;
    use crate::auth;
    use crate::models::{ExamType, Role, Subscription};

    #[derive(Default)]
    struct Inner {
        users: HashMap<Uuid, AuthUser>,
        sessions: HashMap<String, SessionRecord>,
        profiles: HashMap<Uuid, Profile>,
        children: HashMap<Uuid, Child>,
        attempts: HashMap<Uuid, Vec<PracticeAttempt>>,
        questions: HashMap<Uuid, Question>,
        impersonations: HashMap<String, ImpersonationGrant>,
        trust_scores: HashMap<Uuid, i16>,
    }

    pub const TEST_PASSWORD: &str = "correct horse battery";

    /// In-process store for handler tests.
    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
        pub fail_profile_insert: AtomicBool,
        pub fail_attempts: AtomicBool,
    }

    impl MemoryStore {
        /// Registers a user with a live session and returns (user id, bearer token).
        pub fn add_user(&self, email: &str, role: Role, subscription: Subscription) -> (Uuid, String) {
            let id = Uuid::new_v4();
            let token = auth::generate_token();
            let mut inner = self.inner.lock().unwrap();
            inner.users.insert(
                id,
                AuthUser {
                    id,
                    email: email.to_string(),
                    password_hash: auth::hash_password_with_rounds(TEST_PASSWORD, 1_000),
                },
            );
            inner.profiles.insert(
                id,
                Profile {
                    id,
                    full_name: email.split('@').next().unwrap_or(email).to_string(),
                    email: email.to_string(),
                    role,
                    subscription,
                },
            );
            inner.sessions.insert(
                auth::hash_token(&token),
                SessionRecord {
                    user_id: id,
                    expires_at: Utc::now() + Duration::hours(1),
                },
            );
            (id, token)
        }

        pub fn add_child(&self, parent_id: Uuid, year_group: i16) -> Uuid {
            let id = Uuid::new_v4();
            self.inner.lock().unwrap().children.insert(
                id,
                Child {
                    id,
                    parent_id,
                    name: "Test Child".to_string(),
                    year_group,
                    exam_type: ExamType::Gl,
                    avatar: None,
                    is_active: true,
                    created_at: Utc::now(),
                },
            );
            id
        }

        pub fn add_attempts(&self, child_id: Uuid, attempts: Vec<PracticeAttempt>) {
            self.inner
                .lock()
                .unwrap()
                .attempts
                .entry(child_id)
                .or_default()
                .extend(attempts);
        }

        pub fn add_question(&self, question: Question) {
            self.inner.lock().unwrap().questions.insert(question.id, question);
        }

        pub fn trust_score(&self, id: Uuid) -> Option<i16> {
            self.inner.lock().unwrap().trust_scores.get(&id).copied()
        }

        pub fn question(&self, id: Uuid) -> Option<Question> {
            self.inner.lock().unwrap().questions.get(&id).cloned()
        }

        pub fn user_count(&self) -> usize {
            self.inner.lock().unwrap().users.len()
        }

        pub fn profile_count(&self) -> usize {
            self.inner.lock().unwrap().profiles.len()
        }

        pub fn children_of(&self, parent_id: Uuid) -> Vec<Child> {
            self.inner
                .lock()
                .unwrap()
                .children
                .values()
                .filter(|c| c.parent_id == parent_id)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn find_session(&self, token_hash: &str) -> anyhow::Result<Option<SessionRecord>> {
            Ok(self.inner.lock().unwrap().sessions.get(token_hash).cloned())
        }

        async fn create_session(
            &self,
            token_hash: &str,
            user_id: Uuid,
            expires_at: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            self.inner.lock().unwrap().sessions.insert(
                token_hash.to_string(),
                SessionRecord {
                    user_id,
                    expires_at,
                },
            );
            Ok(())
        }

        async fn find_auth_user_by_email(&self, email: &str) -> anyhow::Result<Option<AuthUser>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .users
                .values()
                .find(|u| u.email == email)
                .cloned())
        }

        async fn create_auth_user(&self, email: &str, password_hash: &str) -> anyhow::Result<Uuid> {
            let mut inner = self.inner.lock().unwrap();
            if inner.users.values().any(|u| u.email == email) {
                bail!("duplicate email {email}");
            }
            let id = Uuid::new_v4();
            inner.users.insert(
                id,
                AuthUser {
                    id,
                    email: email.to_string(),
                    password_hash: password_hash.to_string(),
                },
            );
            Ok(id)
        }

        async fn delete_auth_user(&self, id: Uuid) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.users.remove(&id);
            inner.sessions.retain(|_, s| s.user_id != id);
            Ok(())
        }

        async fn find_profile(&self, id: Uuid) -> anyhow::Result<Option<Profile>> {
            Ok(self.inner.lock().unwrap().profiles.get(&id).cloned())
        }

        async fn insert_profile(&self, profile: &Profile) -> anyhow::Result<()> {
            if self.fail_profile_insert.load(Ordering::SeqCst) {
                bail!("profile insert rejected");
            }
            self.inner
                .lock()
                .unwrap()
                .profiles
                .insert(profile.id, profile.clone());
            Ok(())
        }

        async fn insert_child(&self, child: &Child) -> anyhow::Result<()> {
            self.inner
                .lock()
                .unwrap()
                .children
                .insert(child.id, child.clone());
            Ok(())
        }

        async fn find_child(&self, id: Uuid) -> anyhow::Result<Option<Child>> {
            Ok(self.inner.lock().unwrap().children.get(&id).cloned())
        }

        async fn fetch_attempts(
            &self,
            child_id: Uuid,
            since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<PracticeAttempt>> {
            if self.fail_attempts.load(Ordering::SeqCst) {
                bail!("attempts unavailable");
            }
            let mut attempts: Vec<PracticeAttempt> = self
                .inner
                .lock()
                .unwrap()
                .attempts
                .get(&child_id)
                .map(|all| {
                    all.iter()
                        .filter(|a| a.answered_at > since)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            attempts.sort_by_key(|a| a.answered_at);
            Ok(attempts)
        }

        async fn practice_days(
            &self,
            child_id: Uuid,
            until: DateTime<Utc>,
        ) -> anyhow::Result<BTreeSet<NaiveDate>> {
            if self.fail_attempts.load(Ordering::SeqCst) {
                bail!("attempts unavailable");
            }
            let inner = self.inner.lock().unwrap();
            let all = inner.attempts.get(&child_id).map(Vec::as_slice).unwrap_or_default();
            Ok(crate::analytics::practice_days(
                all.iter().filter(|a| a.answered_at <= until),
            ))
        }

        async fn count_curriculum_topics(&self) -> anyhow::Result<usize> {
            let inner = self.inner.lock().unwrap();
            let topics: std::collections::HashSet<(&str, &str)> = inner
                .questions
                .values()
                .map(|q| (q.subject.as_str(), q.topic.as_str()))
                .collect();
            Ok(topics.len())
        }

        async fn cohort_rows(
            &self,
            child: &Child,
            since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<CohortRow>> {
            let inner = self.inner.lock().unwrap();
            let mut rows = Vec::new();
            for peer in inner.children.values().filter(|c| {
                c.is_active && c.year_group == child.year_group && c.exam_type == child.exam_type
            }) {
                let mut totals: HashMap<&str, (i64, i64)> = HashMap::new();
                for attempt in inner
                    .attempts
                    .get(&peer.id)
                    .into_iter()
                    .flatten()
                    .filter(|a| a.answered_at > since)
                {
                    let entry = totals.entry(attempt.subject.as_str()).or_default();
                    entry.0 += i64::from(attempt.is_correct);
                    entry.1 += 1;
                }
                rows.extend(totals.into_iter().map(|(subject, (correct, total))| CohortRow {
                    child_id: peer.id,
                    subject: subject.to_string(),
                    correct,
                    total,
                }));
            }
            Ok(rows)
        }

        async fn find_question(&self, id: Uuid) -> anyhow::Result<Option<Question>> {
            Ok(self.question(id))
        }

        async fn cache_explanations(
            &self,
            id: Uuid,
            explanations: &Explanations,
        ) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            match inner.questions.get_mut(&id) {
                Some(question) => {
                    question.cached_explanations = Some(explanations.clone());
                    Ok(())
                }
                None => bail!("question {id} missing"),
            }
        }

        async fn update_trust_score(&self, id: Uuid, score: i16) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.questions.contains_key(&id) {
                inner.trust_scores.insert(id, score);
            }
            Ok(())
        }

        async fn create_impersonation(
            &self,
            token_hash: &str,
            grant: &ImpersonationGrant,
        ) -> anyhow::Result<()> {
            self.inner
                .lock()
                .unwrap()
                .impersonations
                .insert(token_hash.to_string(), grant.clone());
            Ok(())
        }

        async fn find_impersonation(
            &self,
            token_hash: &str,
        ) -> anyhow::Result<Option<ImpersonationGrant>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .impersonations
                .get(token_hash)
                .cloned())
        }

        async fn revoke_impersonation(&self, token_hash: &str) -> anyhow::Result<bool> {
            Ok(match self.inner.lock().unwrap().impersonations.get_mut(token_hash) {
                Some(grant) if !grant.revoked => {
                    grant.revoked = true;
                    true
                }
                _ => false,
            })
        }
    }
}
