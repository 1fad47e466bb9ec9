//! Typed, concurrency-safe `CallSession` registry (§4.5).
//!
//! Grounded on the teacher's `session-core::coordinator::registry`
//! (`InternalSessionRegistry`, an `Arc<RwLock<HashMap<SessionId, Session>>>`
//! with stats tracking and `Result`-returning accessors), generalized from
//! one primary index to the four this spec requires and switched to
//! `DashMap` (already a workspace dependency) for lock-free per-key access
//! instead of one coarse `RwLock` over the whole table.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::SessionError;
use crate::model::{CallSession, MediaBinding, PlaybackRecord};

/// Owning handle to one session; all mutation goes through `update`, which
/// holds this per-session lock for the duration of the closure (§4.5:
/// "mutations are serialized per-session, one writer at a time").
type SessionHandle = Arc<Mutex<CallSession>>;

#[derive(Default)]
pub struct SessionStore {
    by_caller_channel: DashMap<String, SessionHandle>,
    by_media_leg_channel: DashMap<String, String>,
    by_ssrc: DashMap<u32, String>,
    by_uuid: DashMap<Uuid, String>,
    by_playback_id: DashMap<String, PlaybackRecord>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create(&self, caller_channel_id: impl Into<String>) -> Result<SessionHandle, SessionError> {
        let caller_channel_id = caller_channel_id.into();
        if self.by_caller_channel.contains_key(&caller_channel_id) {
            return Err(SessionError::AlreadyExists(caller_channel_id));
        }
        let session = Arc::new(Mutex::new(CallSession::new(caller_channel_id.clone())));
        self.by_caller_channel.insert(caller_channel_id, session.clone());
        Ok(session)
    }

    pub fn get_by_caller_channel(&self, caller_channel_id: &str) -> Option<SessionHandle> {
        self.by_caller_channel.get(caller_channel_id).map(|e| e.clone())
    }

    pub fn get_by_media_leg_channel(&self, media_leg_channel_id: &str) -> Option<SessionHandle> {
        let caller = self.by_media_leg_channel.get(media_leg_channel_id)?.clone();
        self.get_by_caller_channel(&caller)
    }

    pub fn get_by_ssrc(&self, ssrc: u32) -> Option<SessionHandle> {
        let caller = self.by_ssrc.get(&ssrc)?.clone();
        self.get_by_caller_channel(&caller)
    }

    pub fn get_by_uuid(&self, uuid: &Uuid) -> Option<SessionHandle> {
        let caller = self.by_uuid.get(uuid)?.clone();
        self.get_by_caller_channel(&caller)
    }

    pub fn get_by_playback_id(&self, playback_id: &str) -> Option<SessionHandle> {
        let record = self.by_playback_id.get(playback_id)?;
        self.get_by_caller_channel(&record.caller_channel_id)
    }

    /// Run `f` against the session with exclusive access. Returns `None` if
    /// the session no longer exists (callers must tolerate lookup misses —
    /// DESIGN NOTES §9).
    pub fn update<R>(&self, caller_channel_id: &str, f: impl FnOnce(&mut CallSession) -> R) -> Option<R> {
        let handle = self.get_by_caller_channel(caller_channel_id)?;
        let mut session = handle.lock();
        Some(f(&mut session))
    }

    /// Register the media-leg channel id for a session (distinct secondary
    /// index, not the binding itself).
    pub fn set_media_leg_channel(&self, caller_channel_id: &str, media_leg_channel_id: impl Into<String>) {
        self.by_media_leg_channel
            .insert(media_leg_channel_id.into(), caller_channel_id.to_string());
    }

    /// I3: set the media binding exactly once. Returns an error if a binding
    /// is already present for this caller.
    pub fn bind(&self, caller_channel_id: &str, binding: MediaBinding) -> Result<(), SessionError> {
        let already_set = self
            .update(caller_channel_id, |session| {
                if session.media_binding.is_some() {
                    true
                } else {
                    session.media_binding = Some(binding);
                    false
                }
            })
            .ok_or_else(|| SessionError::NotFound(caller_channel_id.to_string()))?;
        if already_set {
            return Err(SessionError::BindingAlreadySet(caller_channel_id.to_string()));
        }
        match binding {
            MediaBinding::Rtp { ssrc } => {
                self.by_ssrc.insert(ssrc, caller_channel_id.to_string());
            }
            MediaBinding::AudioSocket { uuid } => {
                self.by_uuid.insert(uuid, caller_channel_id.to_string());
            }
        }
        Ok(())
    }

    /// Find the oldest session whose media leg exists but has no binding yet
    /// (§4.10 first-media-frame binding tie-break: "ties are broken by
    /// media-leg creation time, oldest wins"). Used by the Engine to resolve
    /// a fresh SSRC/UUID to a call.
    pub fn find_unbound_session(&self) -> Option<SessionHandle> {
        let mut best: Option<SessionHandle> = None;
        for entry in self.by_caller_channel.iter() {
            let handle = entry.value().clone();
            let (has_media_leg, has_binding, created_at) = {
                let session = handle.lock();
                (
                    session.media_leg_channel_id.is_some(),
                    session.media_binding.is_some(),
                    session.created_at,
                )
            };
            if has_media_leg && !has_binding {
                let replace = match &best {
                    None => true,
                    Some(current) => created_at < current.lock().created_at,
                };
                if replace {
                    best = Some(handle);
                }
            }
        }
        best
    }

    /// §4.4/§4.10 playback-before-register race: insert before the caller's
    /// `play` call returns. L4: registering the same id twice is rejected.
    pub fn register_playback(&self, record: PlaybackRecord) -> Result<(), SessionError> {
        if self.by_playback_id.contains_key(&record.playback_id) {
            return Err(SessionError::PlaybackAlreadyRegistered(record.playback_id));
        }
        self.by_playback_id.insert(record.playback_id.clone(), record);
        Ok(())
    }

    /// L4: completing an unknown or already-completed id is a no-op,
    /// returning `false` so the caller can increment a "duplicate" counter
    /// (§4.10 "Duplicate PlaybackFinished").
    pub fn complete_playback(&self, playback_id: &str) -> Option<PlaybackRecord> {
        self.by_playback_id.remove(playback_id).map(|(_, record)| record)
    }

    /// All playback records currently outstanding for one call, used by the
    /// Engine to stop in-flight file playbacks during teardown.
    pub fn playbacks_for(&self, caller_channel_id: &str) -> Vec<PlaybackRecord> {
        self.by_playback_id
            .iter()
            .filter(|entry| entry.value().caller_channel_id == caller_channel_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn delete(&self, caller_channel_id: &str) -> Option<SessionHandle> {
        let (_, handle) = self.by_caller_channel.remove(caller_channel_id)?;
        let media_leg = handle.lock().media_leg_channel_id.clone();
        if let Some(media_leg) = media_leg {
            self.by_media_leg_channel.remove(&media_leg);
        }
        let binding = handle.lock().media_binding;
        match binding {
            Some(MediaBinding::Rtp { ssrc }) => {
                self.by_ssrc.remove(&ssrc);
            }
            Some(MediaBinding::AudioSocket { uuid }) => {
                self.by_uuid.remove(&uuid);
            }
            None => {}
        }
        self.by_playback_id.retain(|_, record| record.caller_channel_id != caller_channel_id);
        Some(handle)
    }

    pub fn active_call_count(&self) -> usize {
        self.by_caller_channel.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn create_rejects_duplicate_caller_channel() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        assert!(matches!(store.create("c1"), Err(SessionError::AlreadyExists(_))));
    }

    #[test]
    fn ssrc_binding_resolves_session_and_rejects_rebind() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        store.bind("c1", MediaBinding::Rtp { ssrc: 42 }).unwrap();
        assert!(store.get_by_ssrc(42).is_some());
        assert!(matches!(
            store.bind("c1", MediaBinding::Rtp { ssrc: 99 }),
            Err(SessionError::BindingAlreadySet(_))
        ));
    }

    #[test]
    fn find_unbound_session_prefers_oldest_media_leg() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        store.set_media_leg_channel("c1", "m1");
        store.update("c1", |s| s.media_leg_channel_id = Some("m1".to_string()));
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create("c2").unwrap();
        store.set_media_leg_channel("c2", "m2");
        store.update("c2", |s| s.media_leg_channel_id = Some("m2".to_string()));

        let found = store.find_unbound_session().unwrap();
        assert_eq!(found.lock().caller_channel_id, "c1");
    }

    #[test]
    fn playback_registration_is_idempotent_on_duplicate() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        let record = PlaybackRecord {
            playback_id: "pb1".to_string(),
            caller_channel_id: "c1".to_string(),
            media_path: None,
            token: Uuid::new_v4(),
            created_at: Instant::now(),
        };
        store.register_playback(record.clone()).unwrap();
        assert!(matches!(
            store.register_playback(record),
            Err(SessionError::PlaybackAlreadyRegistered(_))
        ));
        assert!(store.complete_playback("pb1").is_some());
        assert!(store.complete_playback("pb1").is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = SessionStore::new();
        store.create("c1").unwrap();
        assert!(store.delete("c1").is_some());
        assert!(store.delete("c1").is_none());
    }
}
