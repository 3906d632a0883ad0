//! Deduplication registry and identity allocation (§3 "TaskInfo", §4.G).
//!
//! A single locked map, not three parallel maps keyed by channel/uid/lang
//! separately — that shape is a known refactor target and is not carried
//! over. Held as a process-wide `once_cell::sync::Lazy` static, the same
//! shape used elsewhere in this crate's process for singleton engines.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::translator::Stream;

/// Registry entry for one dedup key (§3 "TaskInfo (registry entry)").
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub streams: Vec<Stream>,
    pub speaker_uid: u32,
    pub channel: String,
    pub language: String,
    /// The `task_id` of the first target in the `Start` call that created
    /// this entry. Every target from one multi-target `Start` call shares
    /// the same `primary_task_id` (the one returned to the caller) even
    /// though each target gets its own `task_id` from the translator, so
    /// `Stop(primary_task_id)` can find and tear down all of them (§4.H).
    pub primary_task_id: String,
    /// Avatar uid/language allocated the first time this key was started in
    /// avatar mode. `None` until avatar mode actually allocates one; cached
    /// here so a later dedup hit returns the same identity instead of
    /// minting a fresh one and re-spawning a session (§8 "Dedup reuse").
    pub avatar_stream: Option<Stream>,
}

/// Key `"{channel}:{speaker_uid}:{target_lang}"` (§3).
pub fn dedup_key(channel: &str, speaker_uid: u32, target_lang: &str) -> String {
    format!("{channel}:{speaker_uid}:{target_lang}")
}

pub struct Registry {
    entries: RwLock<HashMap<String, TaskInfo>>,
    /// Per-key guard so a registry miss triggers at most one external-
    /// translator call even under concurrent `Start`s for the same key
    /// (§4.G "Concurrent-start coalescing", §8 boundary behaviors).
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// `next_avatar_uid` per channel, starting at 4000 (§3 "Identity allocation").
    next_avatar_uid: Mutex<HashMap<String, u32>>,
}

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

impl Registry {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            next_avatar_uid: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<TaskInfo> {
        self.entries.read().await.get(key).cloned()
    }

    /// Look up `key`; on a miss, run `create` exactly once across all
    /// concurrent callers racing on the same key, store its result, and
    /// return it to every caller. The `bool` is `true` exactly when this
    /// call ran `create` (a genuine miss), `false` on a dedup hit.
    pub async fn get_or_create<F, Fut>(&self, key: String, create: F) -> Result<(TaskInfo, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TaskInfo>>,
    {
        if let Some(info) = self.get(&key).await {
            return Ok((info, false));
        }

        let key_lock = {
            let mut locks = self.key_locks.lock().await;
            locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = key_lock.lock().await;

        // Re-check now that we hold the per-key lock: another caller may
        // have populated the entry while we were waiting.
        if let Some(info) = self.get(&key).await {
            return Ok((info, false));
        }

        let info = create().await?;
        self.entries.write().await.insert(key, info.clone());
        Ok((info, true))
    }

    /// Record which `Start` call's primary task id this entry belongs to
    /// (§4.H), so `Stop(primary_task_id)` can later find it.
    pub async fn set_primary_task_id(&self, key: &str, primary_task_id: String) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.primary_task_id = primary_task_id;
        }
    }

    /// Cache the avatar uid/language allocated for `key` on its first avatar-
    /// mode start, so a later dedup hit returns the same identity.
    pub async fn set_avatar_stream(&self, key: &str, avatar_stream: Stream) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.avatar_stream = Some(avatar_stream);
        }
    }

    /// Every entry created by the same `Start` call as `primary_task_id`
    /// (§4.H "Stop" must tear down every target spawned by one call).
    pub async fn entries_for_primary(&self, primary_task_id: &str) -> Vec<TaskInfo> {
        self.entries
            .read()
            .await
            .values()
            .filter(|v| v.primary_task_id == primary_task_id)
            .cloned()
            .collect()
    }

    /// Remove every entry belonging to the same `Start` call as
    /// `primary_task_id` (§4.G "On Stop(task_id)").
    pub async fn remove_by_primary_task_id(&self, primary_task_id: &str) {
        self.entries.write().await.retain(|_, v| v.primary_task_id != primary_task_id);
    }

    pub async fn snapshot(&self) -> Vec<TaskInfo> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Allocate the next avatar uid for `channel`, starting at 4000.
    pub async fn next_avatar_uid(&self, channel: &str) -> u32 {
        let mut counters = self.next_avatar_uid.lock().await;
        let next = counters.entry(channel.to_string()).or_insert(4000);
        let uid = *next;
        *next += 1;
        uid
    }
}

/// Bot uid for the `index`-th target language in a single `Start` request
/// (§3 "Identity allocation": `4500 + index`, keeps bot tiles in the
/// frontend's hidden 3000-4999 filter range).
pub fn bot_uid(index: usize) -> u32 {
    4500 + index as u32
}
