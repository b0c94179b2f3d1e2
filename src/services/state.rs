use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::models::ConversationContext;

/// Owns every open conversation, keyed by thread id, and mirrors the map
/// to a JSON file after each mutation.
///
/// One mutex spans mutate and save, so concurrent threads never lose each
/// other's writes. A failed save leaves the in-memory map unchanged.
pub struct StateStore {
    path: PathBuf,
    contexts: Mutex<HashMap<String, ConversationContext>>,
}

impl StateStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contexts = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            decode_contexts(&raw)?
        } else {
            HashMap::new()
        };
        info!(path = %path.display(), contexts = contexts.len(), "Loaded conversation state");
        Ok(StateStore {
            path,
            contexts: Mutex::new(contexts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, thread_id: &str) -> Result<Option<ConversationContext>> {
        let contexts = self.lock()?;
        Ok(contexts.get(thread_id).cloned())
    }

    #[cfg(test)]
    pub fn has(&self, thread_id: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(thread_id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn insert(&self, context: ConversationContext) -> Result<()> {
        let mut contexts = self.lock()?;
        let mut next = contexts.clone();
        next.insert(context.thread_id.clone(), context);
        self.save(&next)?;
        *contexts = next;
        Ok(())
    }

    /// Applies `change` to the stored context. Returns `false` when the
    /// thread has none.
    pub fn update<F>(&self, thread_id: &str, change: F) -> Result<bool>
    where
        F: FnOnce(&mut ConversationContext),
    {
        let mut contexts = self.lock()?;
        let mut next = contexts.clone();
        match next.get_mut(thread_id) {
            Some(context) => change(context),
            None => return Ok(false),
        }
        self.save(&next)?;
        *contexts = next;
        Ok(true)
    }

    pub fn remove(&self, thread_id: &str) -> Result<Option<ConversationContext>> {
        let mut contexts = self.lock()?;
        if !contexts.contains_key(thread_id) {
            return Ok(None);
        }
        let mut next = contexts.clone();
        let removed = next.remove(thread_id);
        self.save(&next)?;
        *contexts = next;
        Ok(removed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ConversationContext>>> {
        self.contexts
            .lock()
            .map_err(|_| anyhow!("State lock poisoned"))
    }

    fn save(&self, contexts: &HashMap<String, ConversationContext>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let ordered: BTreeMap<&String, &ConversationContext> = contexts.iter().collect();
        let json = serde_json::to_string_pretty(&ordered)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

fn decode_contexts(raw: &str) -> Result<HashMap<String, ConversationContext>> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let entries: Map<String, Value> = serde_json::from_str(raw).context("Invalid state file")?;
    let mut contexts = HashMap::new();
    for (thread_id, value) in entries {
        match serde_json::from_value::<ConversationContext>(value) {
            Ok(context) => {
                contexts.insert(thread_id, context);
            }
            Err(err) => warn!(thread_id = %thread_id, error = %err, "Skipping unreadable context"),
        }
    }
    Ok(contexts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, TransferData};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use rust_decimal_macros::dec;

    fn transfer_context(thread_id: &str) -> ConversationContext {
        ConversationContext::new(
            "u1",
            thread_id,
            Conversation::Transfer(TransferData {
                amount: dec!(100),
                source_account: "Checking".to_string(),
                destination_account: "Savings".to_string(),
                transfer_date: NaiveDate::from_ymd_opt(2026, 10, 14).unwrap(),
                description: Some("Emergency fund".to_string()),
            }),
        )
    }

    #[tokio::test]
    async fn concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(StateStore::load(&path).unwrap());
        store.insert(transfer_context("shared")).unwrap();

        let mut writers = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            writers.spawn_blocking(move || {
                store.insert(transfer_context(&format!("t{}", i))).unwrap();
                store
                    .update("shared", |context| {
                        let seen = context.message_content.take().unwrap_or_default();
                        context.message_content = Some(format!("{}{},", seen, i));
                    })
                    .unwrap();
            });
        }
        while let Some(result) = writers.join_next().await {
            result.unwrap();
        }

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.len().unwrap(), 17);
        for i in 0..16 {
            assert!(reloaded.has(&format!("t{}", i)).unwrap());
        }
        let shared = reloaded.get("shared").unwrap().unwrap();
        let mut seen: Vec<u32> = shared
            .message_content
            .unwrap()
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| part.parse().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn contexts_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load(&path).unwrap();
        store.insert(transfer_context("t1")).unwrap();
        store.insert(transfer_context("t2")).unwrap();
        assert!(store
            .update("t2", |context| context.message_content = Some("moved 100".to_string()))
            .unwrap());
        store.remove("t1").unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.len().unwrap(), 1);
        assert!(!reloaded.has("t1").unwrap());
        let context = reloaded.get("t2").unwrap().unwrap();
        assert_eq!(context.message_content.as_deref(), Some("moved 100"));
        assert_eq!(context, store.get("t2").unwrap().unwrap());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn missing_threads_are_not_updated() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        assert!(!store.update("nope", |_| {}).unwrap());
        assert!(store.remove("nope").unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let good = serde_json::to_value(transfer_context("t1")).unwrap();
        let raw = serde_json::json!({"t1": good, "t9": {"user_id": "u"}});
        std::fs::write(&path, raw.to_string()).unwrap();

        let store = StateStore::load(&path).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.has("t1").unwrap());
    }

    #[test]
    fn empty_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "").unwrap();
        assert_eq!(StateStore::load(&path).unwrap().len().unwrap(), 0);
    }

    #[test]
    fn file_uses_iso_dates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::load(&path).unwrap();
        store.insert(transfer_context("t1")).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"transfer_date\": \"2026-10-14\""));
    }
}
