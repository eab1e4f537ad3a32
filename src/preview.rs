use crate::util::{lock, sha256_hex};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const PREVIEW_SCHEME: &str = "preview://";

/// Transient in-memory reference to an assembled document.
#[derive(Debug, Clone)]
pub struct PreviewHandle {
    pub url: String,
    pub pages: usize,
    pub document: Arc<Vec<u8>>,
}

/// Documents kept alive for inline display until revoked.
#[derive(Debug, Default)]
pub struct PreviewStore {
    entries: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Vec<u8>, pages: usize) -> PreviewHandle {
        let digest = sha256_hex(&document);
        let url = format!("{PREVIEW_SCHEME}{}", &digest[..16]);
        let document = Arc::new(document);
        lock(&self.entries).insert(url.clone(), Arc::clone(&document));
        PreviewHandle {
            url,
            pages,
            document,
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<Vec<u8>>> {
        lock(&self.entries).get(url).cloned()
    }

    /// Drops the stored document. Returns false for unknown urls.
    pub fn revoke(&self, url: &str) -> bool {
        lock(&self.entries).remove(url).is_some()
    }
}
