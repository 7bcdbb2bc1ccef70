//! In-process fakes of the remote seams.
//!
//! Compiled for unit tests and, through the `test-utils` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::notify::{DocumentSender, Notifier, NotifyError};
use crate::panel::{PanelError, PanelSession, RemoteCredential, RemotePanel};
use crate::storage::Host;

#[derive(Debug, Default)]
struct PanelState {
    credentials: HashMap<String, Vec<RemoteCredential>>,
    auth_failures: HashSet<String>,
    listing_failures: HashSet<String>,
    delete_failures: HashSet<String>,
    connects: Vec<String>,
    deletes: Vec<(String, String)>,
    next_remote_id: u64,
}

/// Panel whose credentials live in memory, keyed by host name.
#[derive(Debug, Clone, Default)]
pub struct FakePanel {
    state: Arc<Mutex<PanelState>>,
}

impl FakePanel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a credential on `host`.
    pub fn insert(&self, host: &str, credential: RemoteCredential) {
        self.lock()
            .credentials
            .entry(host.to_string())
            .or_default()
            .push(credential);
    }

    pub fn credentials(&self, host: &str) -> Vec<RemoteCredential> {
        self.lock()
            .credentials
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find(&self, host: &str, correlation_id: &str) -> Option<RemoteCredential> {
        self.credentials(host)
            .into_iter()
            .find(|c| c.correlation_id == correlation_id)
    }

    /// Change the raw expiry of a seeded credential.
    pub fn set_expiry(&self, host: &str, correlation_id: &str, expiry_ms: i64) {
        if let Some(list) = self.lock().credentials.get_mut(host) {
            for cred in list.iter_mut().filter(|c| c.correlation_id == correlation_id) {
                cred.expiry_ms = expiry_ms;
            }
        }
    }

    pub fn fail_auth(&self, host: &str, fail: bool) {
        toggle(&mut self.lock().auth_failures, host, fail);
    }

    pub fn fail_listing(&self, host: &str, fail: bool) {
        toggle(&mut self.lock().listing_failures, host, fail);
    }

    pub fn fail_delete(&self, host: &str, fail: bool) {
        toggle(&mut self.lock().delete_failures, host, fail);
    }

    /// Hosts connected to, in order.
    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    /// `(host, remote_id)` pairs of every delete attempt.
    pub fn deletes(&self) -> Vec<(String, String)> {
        self.lock().deletes.clone()
    }
}

fn toggle(set: &mut HashSet<String>, host: &str, on: bool) {
    if on {
        set.insert(host.to_string());
    } else {
        set.remove(host);
    }
}

#[async_trait]
impl RemotePanel for FakePanel {
    async fn connect(&self, host: &Host) -> Result<Box<dyn PanelSession>, PanelError> {
        let mut state = self.lock();
        state.connects.push(host.name.clone());
        if state.auth_failures.contains(&host.name) {
            return Err(PanelError::AuthRejected(format!("{} rejected login", host.name)));
        }
        Ok(Box::new(FakeSession {
            host: host.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    host: String,
    state: Arc<Mutex<PanelState>>,
}

impl FakeSession {
    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PanelSession for FakeSession {
    async fn list_credentials(
        &self,
        _inbound_id: i64,
    ) -> Result<Vec<RemoteCredential>, PanelError> {
        let state = self.lock();
        if state.listing_failures.contains(&self.host) {
            return Err(PanelError::Api {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        Ok(state.credentials.get(&self.host).cloned().unwrap_or_default())
    }

    async fn create_or_update(
        &self,
        _inbound_id: i64,
        correlation_id: &str,
        expiry_ms: i64,
    ) -> Result<String, PanelError> {
        let mut state = self.lock();
        state.next_remote_id += 1;
        let fresh_id = format!("{}-{}", self.host, state.next_remote_id);
        let list = state.credentials.entry(self.host.clone()).or_default();

        if let Some(cred) = list.iter_mut().find(|c| c.correlation_id == correlation_id) {
            cred.expiry_ms = expiry_ms;
            cred.reset_days = 0;
            return Ok(cred.remote_id.clone());
        }
        list.push(RemoteCredential {
            remote_id: fresh_id.clone(),
            correlation_id: correlation_id.to_string(),
            expiry_ms,
            reset_days: 0,
            enabled: true,
        });
        Ok(fresh_id)
    }

    async fn delete(&self, _inbound_id: i64, remote_id: &str) -> Result<(), PanelError> {
        let mut state = self.lock();
        state.deletes.push((self.host.clone(), remote_id.to_string()));
        if state.delete_failures.contains(&self.host) {
            return Err(PanelError::Api {
                status: 500,
                message: "Internal Server Error".into(),
            });
        }
        if let Some(list) = state.credentials.get_mut(&self.host) {
            list.retain(|c| c.remote_id != remote_id);
        }
        Ok(())
    }
}

/// A document accepted by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDocument {
    pub chat_id: i64,
    pub file_name: String,
    pub caption: String,
    pub bytes: Vec<u8>,
}

/// Notifier that records every delivery.
#[derive(Debug)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(i64, String)>>,
    documents: Mutex<Vec<SentDocument>>,
    failing_chats: Mutex<HashSet<i64>>,
    verifications: Mutex<VecDeque<bool>>,
    reactivations: AtomicUsize,
    attempts: AtomicUsize,
    failing: AtomicBool,
    active: AtomicBool,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            documents: Mutex::new(Vec::new()),
            failing_chats: Mutex::new(HashSet::new()),
            verifications: Mutex::new(VecDeque::new()),
            reactivations: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            active: AtomicBool::new(true),
        }
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successfully delivered `(user_id, text)` messages.
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Successfully delivered documents.
    pub fn documents(&self) -> Vec<SentDocument> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail deliveries to one chat only.
    pub fn fail_chat(&self, chat_id: i64) {
        self.failing_chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chat_id);
    }

    fn rejects(&self, chat_id: i64) -> bool {
        self.failing.load(Ordering::SeqCst)
            || self
                .failing_chats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&chat_id)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Outcomes of upcoming `reactivate` calls, in order. Once they run out,
    /// `reactivate` leaves the state as it is.
    pub fn script_verifications(&self, results: &[bool]) {
        self.verifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(results);
    }

    pub fn reactivations(&self) -> usize {
        self.reactivations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejects(user_id) {
            return Err(NotifyError::Rejected("chat not found".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user_id, text.to_string()));
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn reactivate(&self) -> bool {
        self.reactivations.fetch_add(1, Ordering::SeqCst);
        let next = self
            .verifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(ok) = next {
            self.set_active(ok);
        }
        self.is_active()
    }
}

#[async_trait]
impl DocumentSender for RecordingNotifier {
    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejects(chat_id) {
            return Err(NotifyError::Rejected("chat not found".into()));
        }
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentDocument {
                chat_id,
                file_name: file_name.to_string(),
                caption: caption.to_string(),
                bytes,
            });
        Ok(())
    }
}
