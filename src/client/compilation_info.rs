// This module holds the client-wide state every remote compilation request is built from. A
// request takes the next sequence number and, in the same critical section, drains the
// hierarchy delta and the pending lists of unloaded classes, redefined classes and illegally
// modified final fields, so the order in which the server applies critical state matches the sequence order.
// The lock of this state is always taken before the hierarchy table lock. When a request may
// not have reached the server, its lists are put back and the next request ships the whole
// hierarchy instead of a delta; the same happens when the server identity changes. The module
// also tracks which compilation threads have a remote compile in flight: they are the threads
// whose newly-extended marks are set when a class gains a subclass, and they own the interrupt
// flags raised when a class is unloaded or redefined.

//! Client-side request state shared by all compilation threads.

use crate::chtable::class_info::ChTableUpdate;
use crate::chtable::client::ClientChTable;
use crate::core::ids::{ClassId, ClientUid, CompThreadId};
use crate::core::thread_set::ThreadBitSet;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The per-request part of a compilation request, taken atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub seq_no: u32,
    pub last_critical_seq_no: u32,
    pub unloaded_classes: Vec<ClassId>,
    pub redefined_classes: Vec<ClassId>,
    pub illegal_final_field_modifications: Vec<ClassId>,
    pub chtable_update: ChTableUpdate,
}

impl RequestHeader {
    pub fn is_critical(&self) -> bool {
        !self.unloaded_classes.is_empty()
            || !self.redefined_classes.is_empty()
            || !self.illegal_final_field_modifications.is_empty()
            || !self.chtable_update.is_empty()
    }
}

#[derive(Debug, Default)]
struct RequestState {
    last_seq_no: u32,
    last_critical_seq_no: u32,
    unloaded_classes: Vec<ClassId>,
    redefined_classes: Vec<ClassId>,
    illegal_final_modifications: Vec<ClassId>,
    needs_full_resync: bool,
    server_uid: Option<u64>,
}

#[derive(Debug, Default)]
struct RemoteThreads {
    threads: ThreadBitSet,
    interrupts: HashMap<CompThreadId, Arc<AtomicBool>>,
}

pub struct ClientCompilationInfo {
    client_uid: ClientUid,
    state: Mutex<RequestState>,
    chtable: Mutex<ClientChTable>,
    remote: Mutex<RemoteThreads>,
    /// Every class whose static final fields were ever modified illegally.
    illegal_final_classes: Mutex<HashSet<ClassId>>,
}

impl ClientCompilationInfo {
    pub fn new(client_uid: ClientUid) -> Self {
        Self {
            client_uid,
            state: Mutex::new(RequestState::default()),
            chtable: Mutex::new(ClientChTable::new()),
            remote: Mutex::new(RemoteThreads::default()),
            illegal_final_classes: Mutex::new(HashSet::new()),
        }
    }

    pub fn client_uid(&self) -> ClientUid {
        self.client_uid
    }

    pub fn chtable(&self) -> &Mutex<ClientChTable> {
        &self.chtable
    }

    /// Take the next sequence number together with all pending critical state.
    pub fn prepare_request(&self) -> RequestHeader {
        let mut state = self.state.lock();
        let mut chtable = self.chtable.lock();
        state.last_seq_no += 1;
        let seq_no = state.last_seq_no;
        let chtable_update = if state.needs_full_resync {
            state.needs_full_resync = false;
            log::debug!("{}: request {} carries the full hierarchy", self.client_uid, seq_no);
            chtable.serialize_all()
        } else {
            chtable.serialize_updates()
        };
        drop(chtable);

        let mut header = RequestHeader {
            seq_no,
            last_critical_seq_no: 0,
            unloaded_classes: std::mem::take(&mut state.unloaded_classes),
            redefined_classes: std::mem::take(&mut state.redefined_classes),
            illegal_final_field_modifications: std::mem::take(&mut state.illegal_final_modifications),
            chtable_update,
        };
        if header.is_critical() {
            state.last_critical_seq_no = seq_no;
        }
        header.last_critical_seq_no = state.last_critical_seq_no;
        header
    }

    /// Put back the lists of a request that may not have reached the server.
    pub fn restore_unsent(&self, header: RequestHeader) {
        let mut state = self.state.lock();
        let mut unloaded = header.unloaded_classes;
        unloaded.append(&mut state.unloaded_classes);
        state.unloaded_classes = unloaded;
        let mut redefined = header.redefined_classes;
        redefined.append(&mut state.redefined_classes);
        state.redefined_classes = redefined;
        let mut illegal = header.illegal_final_field_modifications;
        illegal.append(&mut state.illegal_final_modifications);
        state.illegal_final_modifications = illegal;
        state.needs_full_resync = true;
    }

    pub fn request_full_resync(&self) {
        self.state.lock().needs_full_resync = true;
    }

    pub fn needs_full_resync(&self) -> bool {
        self.state.lock().needs_full_resync
    }

    pub fn last_seq_no(&self) -> u32 {
        self.state.lock().last_seq_no
    }

    /// Note the identity of the server that answered; a change forces a full resync.
    pub fn observe_server_uid(&self, server_uid: u64) -> bool {
        let mut state = self.state.lock();
        let changed = state.server_uid.is_some_and(|uid| uid != server_uid);
        if changed {
            log::info!("{}: server identity changed, resynchronizing", self.client_uid);
            state.needs_full_resync = true;
        }
        state.server_uid = Some(server_uid);
        changed
    }

    pub fn add_unloaded_class(&self, class: ClassId) {
        self.state.lock().unloaded_classes.push(class);
    }

    pub fn add_redefined_class(&self, class: ClassId) {
        let mut state = self.state.lock();
        if !state.redefined_classes.contains(&class) {
            state.redefined_classes.push(class);
        }
    }

    pub fn add_illegal_final_modification(&self, class: ClassId) {
        let first_time = self.illegal_final_classes.lock().insert(class);
        if first_time {
            self.state.lock().illegal_final_modifications.push(class);
        }
    }

    pub fn illegal_final_modifications(&self) -> HashSet<ClassId> {
        self.illegal_final_classes.lock().clone()
    }

    // Remote compilation threads.

    /// Mark `thread` as compiling remotely; returns its interrupt flag.
    pub fn begin_remote(&self, thread: CompThreadId) -> Arc<AtomicBool> {
        let interrupt = Arc::new(AtomicBool::new(false));
        {
            let mut remote = self.remote.lock();
            remote.threads.set(thread);
            remote.interrupts.insert(thread, interrupt.clone());
        }
        self.chtable.lock().clear_newly_extended(thread);
        interrupt
    }

    pub fn end_remote(&self, thread: CompThreadId) {
        {
            let mut remote = self.remote.lock();
            remote.threads.clear(thread);
            remote.interrupts.remove(&thread);
        }
        self.chtable.lock().clear_newly_extended(thread);
    }

    pub fn remote_threads(&self) -> ThreadBitSet {
        self.remote.lock().threads.clone()
    }

    /// Ask every in-flight remote compilation to stop; returns how many were running.
    pub fn interrupt_remote_compilations(&self) -> usize {
        let remote = self.remote.lock();
        for flag in remote.interrupts.values() {
            flag.store(true, Ordering::Release);
        }
        remote.interrupts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ClientCompilationInfo {
        ClientCompilationInfo::new(ClientUid(9))
    }

    #[test]
    fn test_sequence_numbers_increase_and_track_critical_state() {
        let info = info();
        let first = info.prepare_request();
        assert_eq!(first.seq_no, 1);
        assert!(!first.is_critical());
        assert_eq!(first.last_critical_seq_no, 0);

        info.add_unloaded_class(ClassId::new(0x10));
        let second = info.prepare_request();
        assert_eq!(second.seq_no, 2);
        assert_eq!(second.unloaded_classes, vec![ClassId::new(0x10)]);
        assert_eq!(second.last_critical_seq_no, 2);

        let third = info.prepare_request();
        assert!(third.unloaded_classes.is_empty());
        assert_eq!(third.last_critical_seq_no, 2);

        info.add_redefined_class(ClassId::new(0x20));
        info.add_redefined_class(ClassId::new(0x20));
        let fourth = info.prepare_request();
        assert_eq!(fourth.redefined_classes, vec![ClassId::new(0x20)]);
        assert_eq!(fourth.last_critical_seq_no, 4);
        info.restore_unsent(fourth);
        assert_eq!(info.prepare_request().redefined_classes, vec![ClassId::new(0x20)]);
    }

    #[test]
    fn test_restore_and_resync() {
        let info = info();
        let a = ClassId::new(0xa);
        info.chtable()
            .lock()
            .class_loaded(a, None, &[], &ThreadBitSet::new());
        info.add_illegal_final_modification(a);
        info.add_illegal_final_modification(a);

        let header = info.prepare_request();
        assert_eq!(header.illegal_final_field_modifications, vec![a]);
        assert!(matches!(header.chtable_update, ChTableUpdate::Delta { .. }));
        info.restore_unsent(header);
        assert!(info.needs_full_resync());

        let retry = info.prepare_request();
        assert_eq!(retry.seq_no, 2);
        assert_eq!(retry.illegal_final_field_modifications, vec![a]);
        assert!(matches!(retry.chtable_update, ChTableUpdate::Full(ref all) if all.len() == 1));
        assert!(!info.needs_full_resync());
        assert!(info.illegal_final_modifications().contains(&a));
    }

    #[test]
    fn test_server_uid_change_forces_resync() {
        let info = info();
        assert!(!info.observe_server_uid(1));
        assert!(!info.observe_server_uid(1));
        assert!(!info.needs_full_resync());
        assert!(info.observe_server_uid(2));
        assert!(info.needs_full_resync());
    }

    #[test]
    fn test_remote_threads_and_interrupts() {
        let info = info();
        let flag = info.begin_remote(4);
        assert!(info.remote_threads().contains(4));
        assert_eq!(info.interrupt_remote_compilations(), 1);
        assert!(flag.load(Ordering::Acquire));
        info.end_remote(4);
        assert!(info.remote_threads().is_empty());
        assert_eq!(info.interrupt_remote_compilations(), 0);
    }
}
