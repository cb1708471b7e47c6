// This module implements the client side of installing a remotely compiled body. The server
// compiled against a snapshot of the client's hierarchy that may be stale by the time the
// response arrives, so commit runs in two phases while the client's hierarchy table is locked.
// Validation rejects the whole body when an assumption the code cannot recover from has
// broken: a class that had to stay unextended gained a subclass while this thread was waiting
// on the server, a pre-existence method was overridden or a pre-existence class extended, or a
// static final field the compiler folded was modified. Nothing is installed and no assumption
// is registered in that case. Once validation passes, the body is placed in the code cache and
// every patch site is rebased from the server's code buffer to the body's real address. Each
// nop-able guard is checked by the validity function of its variant: a guard that still holds
// becomes a runtime assumption keyed by the event that would break it, a guard that no longer
// holds is patched to its slow path right away. A body served from the server's AOT cache
// carries the assumptions it was compiled under and is committed the same way. Side-effect sites and pre-existence
// assumptions are registered the same way. Firing an event later patches the registered sites
// or marks their bodies for recompilation; reclaiming a body drops its assumptions.

//! Validate-then-install commit of remotely compiled bodies.

use crate::chtable::client::ClientChTable;
use crate::client::assumptions::{AssumptionAction, AssumptionKey, AssumptionTable};
use crate::client::code_cache::{BodyId, CodeCache};
use crate::core::error::CommitError;
use crate::core::ids::{ClassId, CompThreadId, MethodId, ObjectHandle};
use crate::core::vm::ClientVm;
use crate::protocol::commit_data::{CommitData, GuardAssumption};
use crate::protocol::message::{AotCacheHitResponse, CompilationCodeResponse};
use hashbrown::HashSet;
use std::ops::ControlFlow;

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub body: BodyId,
    pub start: u64,
    /// Assumptions registered for future events.
    pub registered: usize,
    /// Guards patched at install time because they no longer held.
    pub patched: usize,
}

/// Effect of one fired event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FireReport {
    pub patched: usize,
    pub recompile: usize,
}

/// The parts of a server response a commit installs.
struct Body<'r> {
    code: &'r [u8],
    data: &'r [u8],
    commit: &'r CommitData,
    from_aot_cache: bool,
}

#[derive(Debug, Default)]
pub struct GuardCommitEngine {
    assumptions: AssumptionTable,
    code_cache: CodeCache,
    commits: usize,
    aborts: usize,
}

impl GuardCommitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    pub fn assumptions(&self) -> &AssumptionTable {
        &self.assumptions
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn aborts(&self) -> usize {
        self.aborts
    }

    /// Validate every assumption of `response` and install the body if they hold.
    ///
    /// `chtable` must be the locked client hierarchy table; it stays locked for
    /// the whole commit so no class can be loaded between the checks and the
    /// registration of the assumptions.
    pub fn commit(
        &mut self,
        vm: &dyn ClientVm,
        chtable: &mut ClientChTable,
        illegal_final_modifications: &HashSet<ClassId>,
        thread: CompThreadId,
        method: MethodId,
        response: &CompilationCodeResponse,
    ) -> Result<CommitOutcome, CommitError> {
        let body = Body {
            code: &response.code,
            data: &response.data,
            commit: &response.commit,
            from_aot_cache: false,
        };
        self.commit_body(vm, chtable, illegal_final_modifications, thread, method, body)
    }

    /// Install a body served from the server's AOT cache.
    ///
    /// The cached body was compiled for another client's hierarchy, so its
    /// assumptions go through the same validation and guard checks as a fresh
    /// compilation before anything is installed.
    pub fn install_aot(
        &mut self,
        vm: &dyn ClientVm,
        chtable: &mut ClientChTable,
        illegal_final_modifications: &HashSet<ClassId>,
        thread: CompThreadId,
        method: MethodId,
        response: &AotCacheHitResponse,
    ) -> Result<CommitOutcome, CommitError> {
        let body = Body {
            code: &response.code,
            data: &response.data,
            commit: &response.commit,
            from_aot_cache: true,
        };
        self.commit_body(vm, chtable, illegal_final_modifications, thread, method, body)
    }

    fn commit_body(
        &mut self,
        vm: &dyn ClientVm,
        chtable: &mut ClientChTable,
        illegal_final_modifications: &HashSet<ClassId>,
        thread: CompThreadId,
        method: MethodId,
        response: Body<'_>,
    ) -> Result<CommitOutcome, CommitError> {
        let commit = response.commit;
        if let Err(err) = validate(vm, chtable, illegal_final_modifications, thread, commit) {
            self.aborts += 1;
            log::info!("commit of {} aborted: {}", method, err);
            return Err(err);
        }

        let body = self.code_cache.install(
            method,
            response.code.to_vec(),
            response.data.to_vec(),
            response.from_aot_cache,
        );
        let start = self
            .code_cache
            .body(body)
            .map_or(self.code_cache.next_start(), |b| b.start);
        let mut outcome = CommitOutcome {
            body,
            start,
            registered: 0,
            patched: 0,
        };

        for guard in &commit.virtual_guards {
            let site = guard.site.rebase(commit.server_code_start, start);
            if guard_is_valid(vm, chtable, &guard.assumption) {
                let key = AssumptionKey::of_guard(&guard.assumption);
                self.assumptions.register(key, AssumptionAction::Patch(site), body);
                outcome.registered += 1;
            } else {
                log::debug!("{}: guard {:?} no longer holds, patched", method, guard.assumption);
                self.code_cache.patch(site);
                outcome.patched += 1;
            }
        }

        for side_effect in &commit.side_effect_sites {
            let site = side_effect.site.rebase(commit.server_code_start, start);
            if chtable.table().has_been_extended(side_effect.class) {
                self.code_cache.patch(site);
                outcome.patched += 1;
            } else {
                self.assumptions.register(
                    AssumptionKey::Extend(side_effect.class),
                    AssumptionAction::Patch(site),
                    body,
                );
                outcome.registered += 1;
            }
        }

        for &m in &commit.preexistence_methods {
            self.assumptions
                .register(AssumptionKey::Override(m), AssumptionAction::Recompile, body);
            outcome.registered += 1;
        }
        for &class in &commit.preexistence_classes {
            self.assumptions
                .register(AssumptionKey::Extend(class), AssumptionAction::Recompile, body);
            outcome.registered += 1;
        }

        self.commits += 1;
        log::debug!(
            "committed {}{} at {:#x}: {} assumptions, {} guards patched",
            method,
            if response.from_aot_cache { " from the AOT cache" } else { "" },
            start,
            outcome.registered,
            outcome.patched
        );
        Ok(outcome)
    }

    /// Apply every assumption broken by `key`.
    pub fn fire(&mut self, key: AssumptionKey) -> FireReport {
        let mut report = FireReport::default();
        for assumption in self.assumptions.fire(key) {
            match assumption.action {
                AssumptionAction::Patch(site) => {
                    if self.code_cache.patch(site) {
                        report.patched += 1;
                    }
                }
                AssumptionAction::Recompile => {
                    self.code_cache.mark_for_recompilation(assumption.body);
                    report.recompile += 1;
                }
            }
        }
        if report != FireReport::default() {
            log::debug!("{:?}: {} sites patched, {} bodies to recompile", key, report.patched, report.recompile);
        }
        report
    }

    /// Drop a body and its assumptions. Reclaiming twice is a no-op.
    pub fn reclaim(&mut self, body: BodyId) -> usize {
        let released = self.assumptions.reclaim_body(body);
        self.code_cache.remove(body);
        released
    }
}

fn validate(
    vm: &dyn ClientVm,
    chtable: &mut ClientChTable,
    illegal_final_modifications: &HashSet<ClassId>,
    thread: CompThreadId,
    commit: &CommitData,
) -> Result<(), CommitError> {
    if let Some(class) = chtable.first_newly_extended(&commit.classes_not_newly_extended, thread) {
        return Err(CommitError::NewlyExtended { class });
    }

    // A query failure counts as a broken assumption.
    for &method in &commit.preexistence_methods {
        if vm.virtual_method_is_overridden(method).unwrap_or(true) {
            return Err(CommitError::MethodOverridden { method });
        }
    }
    for &class in &commit.preexistence_classes {
        if vm.class_has_been_extended(class).unwrap_or(true) {
            return Err(CommitError::ClassExtended { class });
        }
    }

    for &root in &commit.classes_not_newly_extended {
        let mut offender = None;
        let _ = chtable.table_mut().walk_subclasses(root, |info| {
            if info.is_newly_extended_for(thread) {
                offender = Some(info.class);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        if let Some(class) = offender {
            return Err(CommitError::UnexpectedSubclass { class });
        }
    }

    if let Some(&class) = commit
        .static_final_field_classes
        .iter()
        .find(|class| illegal_final_modifications.contains(*class))
    {
        return Err(CommitError::StaticFinalFieldModified { class });
    }
    Ok(())
}

/// Whether a nop-able guard may stay a nop.
fn guard_is_valid(vm: &dyn ClientVm, chtable: &mut ClientChTable, assumption: &GuardAssumption) -> bool {
    match *assumption {
        GuardAssumption::NonOverridden { method } => non_overridden_holds(vm, method),
        GuardAssumption::HierarchyOverride { method, this_class } => {
            !vm.is_overridden_in_hierarchy(method, this_class)
        }
        GuardAssumption::ClassExtend { class } => class_extend_holds(vm, chtable, class),
        GuardAssumption::SingleImplementer { class, implementer } => {
            single_implementer_holds(vm, chtable, class, implementer)
        }
        GuardAssumption::MutableCallSite { call_site, epoch } => call_site_holds(vm, call_site, epoch),
        GuardAssumption::Breakpoint { method } => !vm.is_method_breakpointed(method).unwrap_or(true),
        GuardAssumption::HotCodeReplace { class } => !vm.class_has_been_replaced(class).unwrap_or(true),
    }
}

fn non_overridden_holds(vm: &dyn ClientVm, method: MethodId) -> bool {
    !vm.virtual_method_is_overridden(method).unwrap_or(true)
}

fn class_extend_holds(vm: &dyn ClientVm, chtable: &ClientChTable, class: ClassId) -> bool {
    !chtable.table().has_been_extended(class) && !vm.class_has_been_extended(class).unwrap_or(true)
}

fn single_implementer_holds(
    vm: &dyn ClientVm,
    chtable: &mut ClientChTable,
    class: ClassId,
    implementer: ClassId,
) -> bool {
    let concrete = |c: ClassId| {
        c == implementer
            || !matches!(
                vm.class_depth_and_flags(c),
                Ok(Some((_, flags))) if flags.is_abstract() || flags.is_interface()
            )
    };
    chtable.table_mut().single_implementer(class, concrete) == Some(implementer)
}

fn call_site_holds(vm: &dyn ClientVm, call_site: ObjectHandle, epoch: u64) -> bool {
    vm.mutable_call_site_epoch(call_site).ok().flatten() == Some(epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sim_vm::{ClassSpec, MethodSpec, SimulatedVm};
    use crate::core::thread_set::ThreadBitSet;
    use crate::protocol::commit_data::{PatchSite, SideEffectSite, VirtualGuardSite};
    use crate::protocol::message::ServerLoad;

    fn aot_response(commit: CommitData) -> AotCacheHitResponse {
        let code = response(CommitData::default()).code;
        AotCacheHitResponse {
            code,
            data: vec![],
            commit: CommitData {
                server_code_start: SERVER_START,
                ..commit
            },
            record_ids: vec![1],
            load: ServerLoad::IDLE,
            server_uid: 1,
        }
    }

    const SERVER_START: u64 = 0x7f00_0000_0000;

    fn guard(assumption: GuardAssumption, offset: u64) -> VirtualGuardSite {
        VirtualGuardSite {
            assumption,
            site: PatchSite {
                location: SERVER_START + offset,
                destination: SERVER_START + 24,
            },
        }
    }

    fn response(commit: CommitData) -> CompilationCodeResponse {
        let mut code = vec![0x0f, 0x1f, 0x44, 0x00, 0x00];
        code.extend_from_slice(&[0x0f, 0x1f, 0x44, 0x00, 0x00]);
        code.resize(32, 0xc3);
        CompilationCodeResponse {
            code,
            data: vec![],
            commit: CommitData {
                server_code_start: SERVER_START,
                ..commit
            },
            log: String::new(),
            load: ServerLoad::IDLE,
            trampoline_methods: vec![],
            server_uid: 1,
        }
    }

    struct Fixture {
        vm: SimulatedVm,
        chtable: ClientChTable,
        a: ClassId,
        run: MethodId,
    }

    fn fixture() -> Fixture {
        let vm = SimulatedVm::new();
        let mut chtable = ClientChTable::new();
        let object = vm.object_class();
        let a = vm.define_class(ClassSpec::new("A").extends(object));
        chtable.class_loaded(a, Some(object), &[], &ThreadBitSet::new());
        let run = vm.define_method(a, MethodSpec::virtual_method("run", "()V")).unwrap();
        Fixture { vm, chtable, a, run }
    }

    #[test]
    fn test_newly_extended_class_aborts_whole_commit() {
        let mut f = fixture();
        let b = f.vm.define_class(ClassSpec::new("B").extends(f.a));
        let remote: ThreadBitSet = [3].into_iter().collect();
        f.chtable.class_loaded(b, Some(f.a), &[], &remote);

        let mut engine = GuardCommitEngine::new();
        let result = engine.commit(
            &f.vm,
            &mut f.chtable,
            &HashSet::new(),
            3,
            f.run,
            &response(CommitData {
                classes_not_newly_extended: vec![f.a],
                virtual_guards: vec![guard(GuardAssumption::NonOverridden { method: f.run }, 0)],
                ..CommitData::default()
            }),
        );
        assert_eq!(result, Err(CommitError::NewlyExtended { class: f.a }));
        assert_eq!(engine.code_cache().installed_count(), 0);
        assert!(engine.assumptions().is_empty());
        assert_eq!(engine.aborts(), 1);
    }

    #[test]
    fn test_other_threads_marks_do_not_abort() {
        let mut f = fixture();
        let b = f.vm.define_class(ClassSpec::new("B").extends(f.a));
        let remote: ThreadBitSet = [1].into_iter().collect();
        f.chtable.class_loaded(b, Some(f.a), &[], &remote);

        let mut engine = GuardCommitEngine::new();
        let outcome = engine
            .commit(
                &f.vm,
                &mut f.chtable,
                &HashSet::new(),
                2,
                f.run,
                &response(CommitData {
                    classes_not_newly_extended: vec![f.a],
                    ..CommitData::default()
                }),
            )
            .unwrap();
        assert_eq!(outcome.registered, 0);
        assert_eq!(engine.code_cache().installed_count(), 1);
    }

    #[test]
    fn test_overridden_preexistence_method_aborts() {
        let mut f = fixture();
        let b = f.vm.define_class(ClassSpec::new("B").extends(f.a));
        f.vm.override_method(f.run, b).unwrap();

        let mut engine = GuardCommitEngine::new();
        let result = engine.commit(
            &f.vm,
            &mut f.chtable,
            &HashSet::new(),
            0,
            f.run,
            &response(CommitData {
                preexistence_methods: vec![f.run],
                ..CommitData::default()
            }),
        );
        assert_eq!(result, Err(CommitError::MethodOverridden { method: f.run }));
        assert_eq!(engine.code_cache().installed_count(), 0);
    }

    #[test]
    fn test_modified_static_final_aborts() {
        let mut f = fixture();
        let illegal: HashSet<ClassId> = [f.a].into_iter().collect();
        let mut engine = GuardCommitEngine::new();
        let result = engine.commit(
            &f.vm,
            &mut f.chtable,
            &illegal,
            0,
            f.run,
            &response(CommitData {
                static_final_field_classes: vec![f.a],
                ..CommitData::default()
            }),
        );
        assert_eq!(result, Err(CommitError::StaticFinalFieldModified { class: f.a }));
    }

    #[test]
    fn test_invalid_guard_is_patched_valid_guard_registered() {
        let mut f = fixture();
        let other = f.vm.define_method(f.a, MethodSpec::virtual_method("other", "()V")).unwrap();
        let b = f.vm.define_class(ClassSpec::new("B").extends(f.a));
        f.chtable.class_loaded(b, Some(f.a), &[], &ThreadBitSet::new());
        f.vm.override_method(other, b).unwrap();

        let mut engine = GuardCommitEngine::new();
        let outcome = engine
            .commit(
                &f.vm,
                &mut f.chtable,
                &HashSet::new(),
                0,
                f.run,
                &response(CommitData {
                    virtual_guards: vec![
                        guard(GuardAssumption::NonOverridden { method: f.run }, 0),
                        guard(GuardAssumption::NonOverridden { method: other }, 5),
                    ],
                    ..CommitData::default()
                }),
            )
            .unwrap();
        assert_eq!(outcome.registered, 1);
        assert_eq!(outcome.patched, 1);

        let body = engine.code_cache().body(outcome.body).unwrap();
        assert_eq!(body.code[0], 0x0f);
        assert_eq!(body.code[5], 0xe9);
        assert_eq!(body.patched_sites, vec![outcome.start + 5]);

        let report = engine.fire(AssumptionKey::Override(f.run));
        assert_eq!(report.patched, 1);
        assert_eq!(engine.code_cache().body(outcome.body).unwrap().code[0], 0xe9);
        assert_eq!(engine.fire(AssumptionKey::Override(f.run)), FireReport::default());
    }

    #[test]
    fn test_side_effect_and_preexistence_registration() {
        let mut f = fixture();
        let mut engine = GuardCommitEngine::new();
        let outcome = engine
            .commit(
                &f.vm,
                &mut f.chtable,
                &HashSet::new(),
                0,
                f.run,
                &response(CommitData {
                    preexistence_methods: vec![f.run],
                    preexistence_classes: vec![f.a],
                    side_effect_sites: vec![SideEffectSite {
                        class: f.a,
                        site: PatchSite {
                            location: SERVER_START,
                            destination: SERVER_START + 24,
                        },
                    }],
                    ..CommitData::default()
                }),
            )
            .unwrap();
        assert_eq!(outcome.registered, 3);

        let report = engine.fire(AssumptionKey::Extend(f.a));
        assert_eq!(report, FireReport { patched: 1, recompile: 1 });
        assert!(engine.code_cache().body(outcome.body).unwrap().needs_recompilation);

        assert_eq!(engine.reclaim(outcome.body), 1);
        assert_eq!(engine.reclaim(outcome.body), 0);
        assert!(engine.assumptions().is_empty());
        assert_eq!(engine.code_cache().installed_count(), 0);
    }

    #[test]
    fn test_single_implementer_and_call_site_checks() {
        let mut f = fixture();
        let shape = f.vm.define_class(
            ClassSpec::new("Shape")
                .extends(f.vm.object_class())
                .with_flags(crate::protocol::mirror::ClassFlags(
                    crate::protocol::mirror::ClassFlags::ABSTRACT,
                )),
        );
        f.chtable.class_loaded(shape, Some(f.vm.object_class()), &[], &ThreadBitSet::new());
        let circle = f.vm.define_class(ClassSpec::new("Circle").extends(shape));
        f.chtable.class_loaded(circle, Some(shape), &[], &ThreadBitSet::new());
        let site = f.vm.new_call_site();

        let single = GuardAssumption::SingleImplementer {
            class: shape,
            implementer: circle,
        };
        let call_site = GuardAssumption::MutableCallSite { call_site: site, epoch: 0 };
        assert!(guard_is_valid(&f.vm, &mut f.chtable, &single));
        assert!(guard_is_valid(&f.vm, &mut f.chtable, &call_site));

        let square = f.vm.define_class(ClassSpec::new("Square").extends(shape));
        f.chtable.class_loaded(square, Some(shape), &[], &ThreadBitSet::new());
        f.vm.retarget_call_site(site);
        assert!(!guard_is_valid(&f.vm, &mut f.chtable, &single));
        assert!(!guard_is_valid(&f.vm, &mut f.chtable, &call_site));
    }

    #[test]
    fn test_aot_body_with_broken_preexistence_is_not_installed() {
        let mut f = fixture();
        let b = f.vm.define_class(ClassSpec::new("B").extends(f.a));
        f.vm.override_method(f.run, b).unwrap();

        let mut engine = GuardCommitEngine::new();
        let result = engine.install_aot(
            &f.vm,
            &mut f.chtable,
            &HashSet::new(),
            0,
            f.run,
            &aot_response(CommitData {
                preexistence_methods: vec![f.run],
                ..CommitData::default()
            }),
        );
        assert_eq!(result, Err(CommitError::MethodOverridden { method: f.run }));
        assert_eq!(engine.code_cache().installed_count(), 0);
        assert_eq!(engine.commits(), 0);
    }

    #[test]
    fn test_aot_body_guards_are_checked_against_local_hierarchy() {
        let mut f = fixture();
        let b = f.vm.define_class(ClassSpec::new("B").extends(f.a));
        f.chtable.class_loaded(b, Some(f.a), &[], &ThreadBitSet::new());
        f.vm.override_method(f.run, b).unwrap();

        let mut engine = GuardCommitEngine::new();
        let outcome = engine
            .install_aot(
                &f.vm,
                &mut f.chtable,
                &HashSet::new(),
                0,
                f.run,
                &aot_response(CommitData {
                    virtual_guards: vec![guard(GuardAssumption::NonOverridden { method: f.run }, 0)],
                    ..CommitData::default()
                }),
            )
            .unwrap();
        assert_eq!((outcome.registered, outcome.patched), (0, 1));
        let body = engine.code_cache().body(outcome.body).unwrap();
        assert!(body.from_aot_cache);
        assert_eq!(body.code[0], 0xe9);
    }
}
