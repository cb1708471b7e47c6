// This module implements the server-side state kept for one client VM identity. The session
// outlives individual connections: it holds the caches that let the server answer repeated VM
// queries without a round trip (batched class info, method-to-class and constant-pool-to-class
// maps, instance field offsets, system classes by name, J2I thunks and the client's static VM
// info) plus the mirrored class hierarchy table. Each cache has its own parking_lot mutex so
// unrelated compilations of the same client do not serialize on one lock; the hierarchy table
// has its own monitor, and no cache lock is ever taken while it is held or the reverse.
// Requests of one client carry increasing sequence numbers and their critical state (unloaded
// classes, hierarchy deltas, illegal final field modifications) must be applied in that order:
// acquire_turn parks a request that arrives early on a condition variable with a timed wait,
// rejects a request that arrives after a newer one was processed, and, when a parked request
// times out while nothing else of this client is active and it is the oldest waiter, clears all
// caches and forces the expected sequence number forward so a lost request cannot stall the
// client forever. The returned CompilationTurn releases the turn and the active-thread count
// when dropped, so error paths never leave later requests waiting. Processing unloaded or
// redefined classes evicts every cache entry keyed by them and raises the interrupt flag of
// the compilations of this client that are still in flight. Every eviction bumps a class
// epoch under the class map lock, so a class info fetched before the eviction is not cached
// after it.

//! Per-client session data on the server.

use crate::chtable::server::ServerChTable;
use crate::core::error::{StreamError, StreamResult};
use crate::core::ids::{ClassId, ClientUid, ConstantPoolId, MethodId};
use crate::protocol::mirror::{ClassInfo, VmInfo};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct SequencingState {
    expected_seq_no: u32,
    /// Threads holding a turn or compiling for this client.
    num_active_threads: usize,
    parked: BTreeSet<u32>,
    /// A parked request that must not force progress before it is notified.
    wait_to_be_notified: Option<u32>,
    last_processed_critical_seq_no: u32,
}

/// Field offset lookups are keyed by class, field name and field signature.
type FieldKey = (ClassId, String, String);

pub struct ClientSessionData {
    client_uid: ClientUid,

    rom_class_map: Mutex<HashMap<ClassId, ClassInfo>>,
    /// Bumped with the class map locked whenever classes are evicted.
    class_epoch: AtomicU64,
    method_map: Mutex<HashMap<MethodId, ClassId>>,
    cp_to_class: Mutex<HashMap<ConstantPoolId, ClassId>>,
    field_offsets: Mutex<HashMap<FieldKey, Option<u32>>>,
    system_classes: Mutex<HashMap<String, ClassId>>,
    thunks: Mutex<HashMap<String, u64>>,
    vm_info: Mutex<Option<VmInfo>>,
    illegal_final_modifications: Mutex<HashSet<ClassId>>,

    chtable: Mutex<ServerChTable>,

    sequencing: Mutex<SequencingState>,
    sequencing_cond: Condvar,

    /// Interrupt flags of in-flight compilations, by sequence number.
    active_compilations: Mutex<HashMap<u32, Arc<AtomicBool>>>,

    in_use: AtomicUsize,
    last_access: Mutex<Instant>,
    marked_for_deletion: AtomicBool,
}

impl ClientSessionData {
    pub fn new(client_uid: ClientUid) -> Self {
        Self {
            client_uid,
            rom_class_map: Mutex::new(HashMap::new()),
            class_epoch: AtomicU64::new(0),
            method_map: Mutex::new(HashMap::new()),
            cp_to_class: Mutex::new(HashMap::new()),
            field_offsets: Mutex::new(HashMap::new()),
            system_classes: Mutex::new(HashMap::new()),
            thunks: Mutex::new(HashMap::new()),
            vm_info: Mutex::new(None),
            illegal_final_modifications: Mutex::new(HashSet::new()),
            chtable: Mutex::new(ServerChTable::new()),
            sequencing: Mutex::new(SequencingState {
                expected_seq_no: 1,
                num_active_threads: 0,
                parked: BTreeSet::new(),
                wait_to_be_notified: None,
                last_processed_critical_seq_no: 0,
            }),
            sequencing_cond: Condvar::new(),
            active_compilations: Mutex::new(HashMap::new()),
            in_use: AtomicUsize::new(0),
            last_access: Mutex::new(Instant::now()),
            marked_for_deletion: AtomicBool::new(false),
        }
    }

    pub fn client_uid(&self) -> ClientUid {
        self.client_uid
    }

    // Class info cache.

    pub fn with_class_info<R>(&self, class: ClassId, f: impl FnOnce(&ClassInfo) -> R) -> Option<R> {
        self.rom_class_map.lock().get(&class).map(f)
    }

    /// Update a cached class info in place. Returns false if the class is not cached.
    pub fn update_class_info(&self, class: ClassId, f: impl FnOnce(&mut ClassInfo)) -> bool {
        match self.rom_class_map.lock().get_mut(&class) {
            Some(info) => {
                f(info);
                true
            }
            None => false,
        }
    }

    /// Epoch to pass to [`cache_class_info`](Self::cache_class_info) for a fetch starting now.
    pub fn class_epoch(&self) -> u64 {
        self.class_epoch.load(Ordering::Acquire)
    }

    /// Cache a class info fetched from the client, together with the maps derived from it.
    ///
    /// Nothing is cached if classes were evicted since `epoch` was read; returns
    /// whether the info was cached.
    pub fn cache_class_info(&self, info: ClassInfo, epoch: u64) -> bool {
        let mut map = self.rom_class_map.lock();
        if self.class_epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        {
            let mut methods = self.method_map.lock();
            for method in &info.methods {
                methods.insert(*method, info.class);
            }
        }
        self.cp_to_class.lock().insert(info.constant_pool, info.class);
        map.insert(info.class, info);
        true
    }

    pub fn cached_class_count(&self) -> usize {
        self.rom_class_map.lock().len()
    }

    // Smaller caches.

    pub fn class_of_method(&self, method: MethodId) -> Option<ClassId> {
        self.method_map.lock().get(&method).copied()
    }

    pub fn cache_class_of_method(&self, method: MethodId, class: ClassId) {
        self.method_map.lock().insert(method, class);
    }

    pub fn class_of_constant_pool(&self, cp: ConstantPoolId) -> Option<ClassId> {
        self.cp_to_class.lock().get(&cp).copied()
    }

    /// `Some(None)` records a field known not to exist.
    pub fn field_offset(&self, class: ClassId, name: &str, signature: &str) -> Option<Option<u32>> {
        self.field_offsets
            .lock()
            .get(&(class, name.to_string(), signature.to_string()))
            .copied()
    }

    pub fn cache_field_offset(&self, class: ClassId, name: &str, signature: &str, offset: Option<u32>) {
        self.field_offsets
            .lock()
            .insert((class, name.to_string(), signature.to_string()), offset);
    }

    pub fn system_class(&self, name: &str) -> Option<ClassId> {
        self.system_classes.lock().get(name).copied()
    }

    pub fn cache_system_class(&self, name: &str, class: ClassId) {
        self.system_classes.lock().insert(name.to_string(), class);
    }

    pub fn thunk(&self, signature: &str) -> Option<u64> {
        self.thunks.lock().get(signature).copied()
    }

    pub fn cache_thunk(&self, signature: &str, address: u64) {
        self.thunks.lock().insert(signature.to_string(), address);
    }

    pub fn vm_info(&self) -> Option<VmInfo> {
        self.vm_info.lock().clone()
    }

    pub fn cache_vm_info(&self, info: VmInfo) {
        *self.vm_info.lock() = Some(info);
    }

    pub fn record_illegal_final_modifications(&self, classes: &[ClassId]) {
        if classes.is_empty() {
            return;
        }
        self.illegal_final_modifications.lock().extend(classes.iter().copied());
    }

    pub fn has_illegal_final_modification(&self, class: ClassId) -> bool {
        self.illegal_final_modifications.lock().contains(&class)
    }

    /// Hierarchy table of this client. Never take a cache lock while holding it.
    pub fn chtable(&self) -> MutexGuard<'_, ServerChTable> {
        self.chtable.lock()
    }

    /// Evict everything keyed by unloaded classes and interrupt in-flight compilations.
    ///
    /// Classes that were never cached are skipped; evicting twice is a no-op.
    pub fn process_unloaded_classes(&self, classes: &[ClassId], current_seq_no: u32) {
        if classes.is_empty() {
            return;
        }
        let interrupted = self.evict_classes(classes, current_seq_no);
        log::debug!(
            "{}: processed {} unloaded classes, interrupted {} compilations",
            self.client_uid,
            classes.len(),
            interrupted
        );
    }

    /// Evict the stale metadata of redefined classes and interrupt in-flight compilations.
    ///
    /// The next query about a redefined class fetches its new shape from the client.
    pub fn process_redefined_classes(&self, classes: &[ClassId], current_seq_no: u32) {
        if classes.is_empty() {
            return;
        }
        let interrupted = self.evict_classes(classes, current_seq_no);
        log::debug!(
            "{}: processed {} redefined classes, interrupted {} compilations",
            self.client_uid,
            classes.len(),
            interrupted
        );
    }

    /// Returns the number of compilations interrupted.
    fn evict_classes(&self, classes: &[ClassId], current_seq_no: u32) -> usize {
        let evicted: HashSet<ClassId> = classes.iter().copied().collect();

        let mut evicted_cps = Vec::new();
        {
            let mut map = self.rom_class_map.lock();
            self.class_epoch.fetch_add(1, Ordering::AcqRel);
            for class in classes {
                if let Some(info) = map.remove(class) {
                    evicted_cps.push(info.constant_pool);
                }
            }
        }
        self.method_map.lock().retain(|_, class| !evicted.contains(class));
        {
            let mut cps = self.cp_to_class.lock();
            for cp in evicted_cps {
                cps.remove(&cp);
            }
            cps.retain(|_, class| !evicted.contains(class));
        }
        self.field_offsets
            .lock()
            .retain(|(class, _, _), _| !evicted.contains(class));
        self.system_classes
            .lock()
            .retain(|_, class| !evicted.contains(class));

        let mut interrupted = 0;
        for (seq_no, flag) in self.active_compilations.lock().iter() {
            if *seq_no != current_seq_no {
                flag.store(true, Ordering::Release);
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Drop every cache and the mirrored hierarchy table.
    pub fn clear_caches(&self) {
        {
            let mut map = self.rom_class_map.lock();
            self.class_epoch.fetch_add(1, Ordering::AcqRel);
            map.clear();
        }
        self.method_map.lock().clear();
        self.cp_to_class.lock().clear();
        self.field_offsets.lock().clear();
        self.system_classes.lock().clear();
        self.thunks.lock().clear();
        *self.vm_info.lock() = None;
        self.chtable.lock().clear();
        log::info!("{}: cleared all caches", self.client_uid);
    }

    // Sequencing.

    /// Wait until `seq_no` is the next request to process for this client.
    pub fn acquire_turn(&self, seq_no: u32, timeout: Duration) -> StreamResult<CompilationTurn<'_>> {
        let mut seq = self.sequencing.lock();
        if seq_no < seq.expected_seq_no {
            return Err(StreamError::OutOfSequence {
                seq_no,
                expected: seq.expected_seq_no,
            });
        }

        if seq_no > seq.expected_seq_no {
            log::debug!(
                "{}: parking request {} (expected {})",
                self.client_uid,
                seq_no,
                seq.expected_seq_no
            );
            seq.parked.insert(seq_no);
            loop {
                let timed_out = self.sequencing_cond.wait_for(&mut seq, timeout).timed_out();
                if seq_no == seq.expected_seq_no {
                    break;
                }
                if seq_no < seq.expected_seq_no {
                    seq.parked.remove(&seq_no);
                    return Err(StreamError::OutOfSequence {
                        seq_no,
                        expected: seq.expected_seq_no,
                    });
                }
                let oldest_waiter = seq.parked.first() == Some(&seq_no);
                if timed_out
                    && seq.num_active_threads == 0
                    && oldest_waiter
                    && seq.wait_to_be_notified != Some(seq_no)
                {
                    log::warn!(
                        "{}: request {} waited too long for {}, clearing caches",
                        self.client_uid,
                        seq_no,
                        seq.expected_seq_no
                    );
                    self.clear_caches();
                    seq.expected_seq_no = seq_no;
                    seq.wait_to_be_notified = seq.parked.range(seq_no + 1..).next().copied();
                    break;
                }
            }
            seq.parked.remove(&seq_no);
            if seq.wait_to_be_notified == Some(seq_no) {
                seq.wait_to_be_notified = None;
            }
        }

        seq.num_active_threads += 1;
        drop(seq);

        let interrupt = Arc::new(AtomicBool::new(false));
        self.active_compilations.lock().insert(seq_no, interrupt.clone());
        Ok(CompilationTurn {
            session: self,
            seq_no,
            interrupt,
            turn_released: false,
        })
    }

    fn release_turn(&self, seq_no: u32, critical: bool) {
        let mut seq = self.sequencing.lock();
        if seq.expected_seq_no == seq_no {
            seq.expected_seq_no = seq_no + 1;
        }
        if critical {
            seq.last_processed_critical_seq_no = seq.last_processed_critical_seq_no.max(seq_no);
        }
        self.sequencing_cond.notify_all();
    }

    fn end_compilation(&self, seq_no: u32) {
        self.active_compilations.lock().remove(&seq_no);
        let mut seq = self.sequencing.lock();
        seq.num_active_threads = seq.num_active_threads.saturating_sub(1);
    }

    pub fn expected_seq_no(&self) -> u32 {
        self.sequencing.lock().expected_seq_no
    }

    pub fn last_processed_critical_seq_no(&self) -> u32 {
        self.sequencing.lock().last_processed_critical_seq_no
    }

    pub fn num_active_threads(&self) -> usize {
        self.sequencing.lock().num_active_threads
    }

    // Lifetime.

    pub fn inc_in_use(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        *self.last_access.lock() = Instant::now();
    }

    /// Returns the remaining use count.
    pub fn dec_in_use(&self) -> usize {
        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        previous.saturating_sub(1)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_access.lock())
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }
}

/// One request's hold on its client's sequencing.
///
/// Dropping it releases the turn if still held and ends the compilation.
pub struct CompilationTurn<'a> {
    session: &'a ClientSessionData,
    seq_no: u32,
    interrupt: Arc<AtomicBool>,
    turn_released: bool,
}

impl CompilationTurn<'_> {
    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    /// Critical state has been applied; let the next request in.
    pub fn release(&mut self, critical: bool) {
        if !self.turn_released {
            self.turn_released = true;
            self.session.release_turn(self.seq_no, critical);
        }
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }
}

impl Drop for CompilationTurn<'_> {
    fn drop(&mut self) {
        self.release(false);
        self.session.end_compilation(self.seq_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::LoaderId;
    use crate::protocol::mirror::ClassFlags;
    use std::thread;

    fn info(class: u64, cp: u64, methods: &[u64]) -> ClassInfo {
        ClassInfo {
            class: ClassId::new(class),
            name: format!("C{}", class),
            rom_class: vec![0xca, 0xfe],
            super_class: None,
            interfaces: vec![],
            depth: 0,
            flags: ClassFlags::default(),
            loader: LoaderId::new(1),
            constant_pool: ConstantPoolId::new(cp),
            component_class: None,
            array_class: None,
            initialized: false,
            methods: methods.iter().map(|m| MethodId::new(*m)).collect(),
        }
    }

    #[test]
    fn test_cache_class_info_populates_derived_maps() {
        let session = ClientSessionData::new(ClientUid(1));
        assert!(session.cache_class_info(info(0x10, 0x11, &[0x12, 0x13]), session.class_epoch()));
        assert_eq!(session.class_of_method(MethodId::new(0x13)), Some(ClassId::new(0x10)));
        assert_eq!(
            session.class_of_constant_pool(ConstantPoolId::new(0x11)),
            Some(ClassId::new(0x10))
        );
        assert_eq!(session.with_class_info(ClassId::new(0x10), |i| i.name.clone()).as_deref(), Some("C16"));
        assert!(session.update_class_info(ClassId::new(0x10), |i| i.initialized = true));
        assert_eq!(session.with_class_info(ClassId::new(0x10), |i| i.initialized), Some(true));
    }

    #[test]
    fn test_unload_evicts_and_is_idempotent() {
        let session = ClientSessionData::new(ClientUid(1));
        session.cache_class_info(info(0x10, 0x11, &[0x12]), session.class_epoch());
        session.cache_class_info(info(0x20, 0x21, &[0x22]), session.class_epoch());
        session.cache_field_offset(ClassId::new(0x10), "x", "I", Some(8));

        session.process_unloaded_classes(&[ClassId::new(0x10), ClassId::new(0x99)], 1);
        assert!(session.with_class_info(ClassId::new(0x10), |_| ()).is_none());
        assert!(session.class_of_method(MethodId::new(0x12)).is_none());
        assert!(session.class_of_constant_pool(ConstantPoolId::new(0x11)).is_none());
        assert!(session.field_offset(ClassId::new(0x10), "x", "I").is_none());
        assert_eq!(session.cached_class_count(), 1);

        session.process_unloaded_classes(&[ClassId::new(0x10)], 2);
        assert_eq!(session.cached_class_count(), 1);
    }

    #[test]
    fn test_info_fetched_across_an_eviction_is_not_cached() {
        let session = ClientSessionData::new(ClientUid(1));
        let epoch = session.class_epoch();
        // The class is unloaded while its info is on the wire.
        session.process_unloaded_classes(&[ClassId::new(0x10)], 1);
        assert!(!session.cache_class_info(info(0x10, 0x11, &[0x12]), epoch));
        assert_eq!(session.cached_class_count(), 0);
        assert!(session.class_of_method(MethodId::new(0x12)).is_none());

        assert!(session.cache_class_info(info(0x10, 0x11, &[0x12]), session.class_epoch()));
        assert_eq!(session.cached_class_count(), 1);
    }

    #[test]
    fn test_redefinition_evicts_and_interrupts() {
        let session = ClientSessionData::new(ClientUid(1));
        session.cache_class_info(info(0x10, 0x11, &[0x12]), session.class_epoch());
        session.cache_field_offset(ClassId::new(0x10), "x", "I", Some(8));
        let mut first = session.acquire_turn(1, Duration::from_millis(10)).unwrap();
        first.release(false);
        let mut second = session.acquire_turn(2, Duration::from_millis(10)).unwrap();

        session.process_redefined_classes(&[ClassId::new(0x10)], second.seq_no());
        second.release(true);
        assert_eq!(session.cached_class_count(), 0);
        assert!(session.field_offset(ClassId::new(0x10), "x", "I").is_none());
        assert!(first.is_interrupted());
        assert!(!second.is_interrupted());
    }

    #[test]
    fn test_in_order_turns() {
        let session = ClientSessionData::new(ClientUid(1));
        let mut turn = session.acquire_turn(1, Duration::from_millis(10)).unwrap();
        turn.release(true);
        assert_eq!(session.expected_seq_no(), 2);
        assert_eq!(session.last_processed_critical_seq_no(), 1);
        assert_eq!(session.num_active_threads(), 1);
        drop(turn);
        assert_eq!(session.num_active_threads(), 0);

        // Already processed.
        assert!(matches!(
            session.acquire_turn(1, Duration::from_millis(10)),
            Err(StreamError::OutOfSequence { seq_no: 1, expected: 2 })
        ));
    }

    #[test]
    fn test_dropping_turn_releases_it() {
        let session = ClientSessionData::new(ClientUid(1));
        {
            let _turn = session.acquire_turn(1, Duration::from_millis(10)).unwrap();
        }
        assert_eq!(session.expected_seq_no(), 2);
        assert_eq!(session.num_active_threads(), 0);
    }

    #[test]
    fn test_early_request_waits_for_predecessor() {
        let session = Arc::new(ClientSessionData::new(ClientUid(1)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let early = {
            let session = session.clone();
            let order = order.clone();
            thread::spawn(move || {
                let mut turn = session.acquire_turn(2, Duration::from_secs(5)).unwrap();
                order.lock().push(2);
                turn.release(false);
            })
        };
        thread::sleep(Duration::from_millis(50));
        {
            let mut turn = session.acquire_turn(1, Duration::from_secs(5)).unwrap();
            order.lock().push(1);
            turn.release(false);
        }
        early.join().unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(session.expected_seq_no(), 3);
    }

    #[test]
    fn test_lost_request_forces_progress_and_clears_caches() {
        let session = ClientSessionData::new(ClientUid(1));
        session.cache_class_info(info(0x10, 0x11, &[]), session.class_epoch());
        // Request 1 never arrives.
        let turn = session.acquire_turn(2, Duration::from_millis(20)).unwrap();
        assert_eq!(turn.seq_no(), 2);
        assert_eq!(session.cached_class_count(), 0);
        drop(turn);
        assert_eq!(session.expected_seq_no(), 3);
        assert!(session.acquire_turn(1, Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_unload_interrupts_other_compilations() {
        let session = ClientSessionData::new(ClientUid(1));
        let mut first = session.acquire_turn(1, Duration::from_millis(10)).unwrap();
        first.release(false);
        let mut second = session.acquire_turn(2, Duration::from_millis(10)).unwrap();
        session.process_unloaded_classes(&[ClassId::new(0x10)], second.seq_no());
        second.release(true);
        assert!(first.is_interrupted());
        assert!(!second.is_interrupted());
    }
}
