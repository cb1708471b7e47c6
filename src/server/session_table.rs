//! Table of client sessions, keyed by client identity.
//!
//! Sessions are created on first contact and live until the client terminates
//! them or they sit idle long enough to be purged. A session in use by a
//! compilation is never dropped: deletion requested meanwhile is deferred
//! until the last [`SessionHandle`] goes away.

use crate::core::ids::ClientUid;
use crate::server::client_session::ClientSessionData;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ClientSessionTable {
    sessions: Mutex<HashMap<ClientUid, Arc<ClientSessionData>>>,
    last_purge: Mutex<Instant>,
    old_age: Duration,
    purge_interval: Duration,
}

impl ClientSessionTable {
    pub fn new(old_age: Duration, purge_interval: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            last_purge: Mutex::new(Instant::now()),
            old_age,
            purge_interval,
        }
    }

    /// Session of `uid`, created if needed, marked in use until the handle drops.
    pub fn find_or_create(&self, uid: ClientUid) -> SessionHandle<'_> {
        self.purge_old_data_if_needed(Instant::now());

        // Counted under the table lock so a purge or delete never sees it idle.
        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions.entry(uid).or_insert_with(|| {
                log::info!("{}: created client session", uid);
                Arc::new(ClientSessionData::new(uid))
            });
            session.inc_in_use();
            session.clone()
        };
        SessionHandle { table: self, session }
    }

    pub fn find(&self, uid: ClientUid) -> Option<Arc<ClientSessionData>> {
        self.sessions.lock().get(&uid).cloned()
    }

    /// Delete a session now, or once its last user is done.
    pub fn delete(&self, uid: ClientUid) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get(&uid) else {
            return false;
        };
        if session.in_use() > 0 {
            session.mark_for_deletion();
            log::debug!("{}: session in use, deletion deferred", uid);
        } else {
            sessions.remove(&uid);
            log::info!("{}: deleted client session", uid);
        }
        true
    }

    /// Drop idle sessions older than the configured age, at most once per purge interval.
    ///
    /// Returns the number of sessions purged.
    pub fn purge_old_data_if_needed(&self, now: Instant) -> usize {
        {
            let mut last = self.last_purge.lock();
            if now.saturating_duration_since(*last) < self.purge_interval {
                return 0;
            }
            *last = now;
        }

        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|uid, session| {
            let keep = session.in_use() > 0 || session.idle_for(now) < self.old_age;
            if !keep {
                log::info!("{}: purged idle client session", uid);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn release(&self, session: &Arc<ClientSessionData>) {
        if session.dec_in_use() == 0 && session.is_marked_for_deletion() {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&session.client_uid())
                .is_some_and(|s| Arc::ptr_eq(s, session) && s.in_use() == 0)
            {
                sessions.remove(&session.client_uid());
                log::info!("{}: deleted client session", session.client_uid());
            }
        }
    }
}

/// A session kept alive and marked in use.
pub struct SessionHandle<'a> {
    table: &'a ClientSessionTable,
    session: Arc<ClientSessionData>,
}

impl Deref for SessionHandle<'_> {
    type Target = ClientSessionData;

    fn deref(&self) -> &ClientSessionData {
        &self.session
    }
}

impl Drop for SessionHandle<'_> {
    fn drop(&mut self) {
        self.table.release(&self.session);
    }
}
