//! In-process object store for tests and dry runs

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use super::ObjectBackend;
use crate::error::{BackendErrorKind, ExtractError, Result};

/// Objects kept in a map, with scriptable put failures
#[derive(Default)]
pub struct MemoryBackend {
    name: String,
    objects: RwLock<BTreeMap<String, Bytes>>,
    failures: Mutex<VecDeque<BackendErrorKind>>,
    put_calls: AtomicU64,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The next `times` puts fail with `kind`
    pub fn fail_next(&self, kind: BackendErrorKind, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(std::iter::repeat(kind).take(times as usize));
        }
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<String> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(kind) = scripted {
            return Err(ExtractError::backend(kind, format!("scripted {:?} failure for {}", kind, key)));
        }

        self.objects
            .write()
            .map_err(|_| ExtractError::backend(BackendErrorKind::Permanent, "memory store poisoned"))?
            .insert(key.to_string(), data);
        Ok(format!("{}/{}", self.describe(), key))
    }
}
