use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

use crate::db::{queries, DbPool};
use crate::models::Profile;
use crate::store::StoreError;

/// Opaque identity handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            email: email.filter(|e| !e.trim().is_empty()),
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Option<Identity>;
}

/// Authenticated session slot with an optional offline-cached fallback.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    session: RwLock<Option<Identity>>,
    cached: Option<Identity>,
}

impl SessionIdentity {
    pub fn new(cached: Option<Identity>) -> Self {
        Self {
            session: RwLock::new(None),
            cached,
        }
    }

    pub fn signed_in(identity: Identity) -> Self {
        let provider = Self::new(None);
        provider.sign_in(identity);
        provider
    }

    pub fn sign_in(&self, identity: Identity) {
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        *session = Some(identity);
    }

    pub fn sign_out(&self) {
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        *session = None;
    }
}

impl IdentityProvider for SessionIdentity {
    fn current(&self) -> Option<Identity> {
        let session = self.session.read().unwrap_or_else(|e| e.into_inner());
        session.clone().or_else(|| self.cached.clone())
    }
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn by_id(&self, subject_id: &str) -> Result<Option<Profile>, StoreError>;
    async fn by_email(&self, email: &str) -> Result<Option<Profile>, StoreError>;
}

pub struct PgProfileDirectory {
    pool: DbPool,
}

impl PgProfileDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileDirectory for PgProfileDirectory {
    async fn by_id(&self, subject_id: &str) -> Result<Option<Profile>, StoreError> {
        let profile = sqlx::query_as::<_, Profile>(queries::SELECT_PROFILE_BY_ID)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    async fn by_email(&self, email: &str) -> Result<Option<Profile>, StoreError> {
        let profile = sqlx::query_as::<_, Profile>(queries::SELECT_PROFILE_BY_EMAIL)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }
}

#[derive(Debug, Default)]
pub struct MemoryProfileDirectory {
    profiles: HashMap<String, Profile>,
}

impl MemoryProfileDirectory {
    pub fn new(profiles: impl IntoIterator<Item = Profile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.subject_id.clone(), p))
                .collect(),
        }
    }
}

#[async_trait]
impl ProfileDirectory for MemoryProfileDirectory {
    async fn by_id(&self, subject_id: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self.profiles.get(subject_id).cloned())
    }

    async fn by_email(&self, email: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self
            .profiles
            .values()
            .find(|p| {
                p.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }
}

/// Human-readable identification stamped on an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayIdentity {
    pub display_name: String,
    pub contact_email: String,
}

/// Resolves name and email: profile by id, then by email, then a name
/// derived from the email, then the bare id. Directory errors count as
/// misses.
pub async fn resolve_display(
    identity: &Identity,
    directory: &dyn ProfileDirectory,
) -> DisplayIdentity {
    let mut profile = lookup(directory.by_id(&identity.subject_id).await, "id");
    if profile.as_ref().and_then(Profile::name).is_none() {
        if let Some(email) = identity.email.as_deref() {
            if let Some(found) = lookup(directory.by_email(email).await, "email") {
                profile = Some(found);
            }
        }
    }

    let contact_email = identity
        .email
        .clone()
        .or_else(|| profile.as_ref().and_then(|p| p.email.clone()))
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| identity.subject_id.clone());

    let display_name = profile
        .as_ref()
        .and_then(Profile::name)
        .map(str::to_string)
        .or_else(|| identity.email.as_deref().and_then(name_from_email))
        .unwrap_or_else(|| identity.subject_id.clone());

    DisplayIdentity {
        display_name,
        contact_email,
    }
}

fn lookup(result: Result<Option<Profile>, StoreError>, by: &str) -> Option<Profile> {
    result.unwrap_or_else(|e| {
        warn!("Profile lookup by {} failed: {}", by, e);
        None
    })
}

/// `ana.lopez_m@uadec.edu.mx` becomes `Ana Lopez M`.
pub fn name_from_email(email: &str) -> Option<String> {
    let local = email.split('@').next()?.trim();
    let words: Vec<String> = local
        .split(['.', '_', '-', '+'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}
