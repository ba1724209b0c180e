#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use repocache::cache::{CacheBackend, CacheConfig, CacheError, CacheKeyProvider, MemoryBackend};
use repocache::repo::{Entity, MemoryRepository, Value};
use repocache::{Cache, CachedConn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub deleted_at: Option<OffsetDateTime>,
}

impl User {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            email: format!("{name}@example.com"),
            deleted_at: None,
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] = &["id", "name", "email", "deleted_at"];
    const SOFT_DELETE: Option<&'static str> = Some("deleted_at");

    fn primary_key(&self) -> Value {
        self.id.into()
    }

    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.clone().into()),
            "email" => Some(self.email.clone().into()),
            "deleted_at" => Some(self.deleted_at.into()),
            _ => None,
        }
    }

    fn mark_deleted(&mut self, at: OffsetDateTime) {
        self.deleted_at = Some(at);
    }
}

pub fn id_key(id: &i64) -> String {
    format!("cache:users:id:{id}")
}

pub fn email_key(email: &str) -> String {
    format!("cache:users:email:{email}")
}

pub struct UserKeys;

impl CacheKeyProvider<User> for UserKeys {
    fn cache_keys(&self, user: &User) -> Vec<String> {
        vec![id_key(&user.id), email_key(&user.email)]
    }
}

/// Memory backend that can be told to fail and records delete calls.
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    pub fail_get: AtomicBool,
    pub fail_set: AtomicBool,
    pub fail_delete: AtomicBool,
    pub deletes: Mutex<Vec<Vec<String>>>,
    pub sets: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: MemoryBackend::new(config),
            fail_get: AtomicBool::new(false),
            fail_set: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            deletes: Mutex::new(Vec::new()),
            sets: AtomicUsize::new(0),
        }
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.deletes.lock().expect("deletes lock").clone()
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(CacheError::backend("get refused"));
        }
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        expires_at: OffsetDateTime,
    ) -> Result<(), CacheError> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(CacheError::backend("set refused"));
        }
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, expires_at).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        self.deletes.lock().expect("deletes lock").push(keys.to_vec());
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(CacheError::backend("delete refused"));
        }
        self.inner.delete(keys).await
    }
}

pub type UserConn = CachedConn<User, MemoryRepository<User>, UserKeys>;

pub struct Harness {
    pub repo: MemoryRepository<User>,
    pub backend: Arc<FlakyBackend>,
    pub conn: UserConn,
}

pub fn harness() -> Harness {
    harness_with(CacheConfig::default())
}

pub fn harness_with(config: CacheConfig) -> Harness {
    let repo = MemoryRepository::<User>::new();
    let backend = Arc::new(FlakyBackend::new(&config));
    let cache = Cache::new(backend.clone(), &config);
    let conn = CachedConn::new(repo.clone(), cache, UserKeys);
    Harness {
        repo,
        backend,
        conn,
    }
}
