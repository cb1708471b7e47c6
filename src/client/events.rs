//! VM event hooks of the remote-compilation client.
//!
//! Hierarchy changes are recorded in the client hierarchy table first, with
//! its lock released before the commit engine is taken, so an event never
//! holds both locks the way a commit does. The assumptions each event breaks
//! are then fired on the commit engine.

use crate::client::assumptions::AssumptionKey;
use crate::client::orchestrator::JitClient;
use crate::core::ids::{ClassId, MethodId, ObjectHandle};
use crate::core::vm::VmEventListener;

impl VmEventListener for JitClient {
    fn class_loaded(&self, class: ClassId, super_class: Option<ClassId>, interfaces: &[ClassId]) {
        let remote = self.info().remote_threads();
        let extended = self
            .info()
            .chtable()
            .lock()
            .class_loaded(class, super_class, interfaces, &remote);
        if extended.is_empty() {
            return;
        }
        let mut engine = self.engine().lock();
        for sup in extended {
            engine.fire(AssumptionKey::Extend(sup));
        }
    }

    fn class_unloaded(&self, class: ClassId) {
        self.info().chtable().lock().class_unloaded(class);
        self.info().add_unloaded_class(class);
        let interrupted = self.info().interrupt_remote_compilations();
        if interrupted > 0 {
            log::debug!("{}: {} unloaded, interrupting {} remote compilations", self.client_uid(), class, interrupted);
        }
    }

    fn method_overridden(&self, method: MethodId, _by_class: ClassId) {
        self.engine().lock().fire(AssumptionKey::Override(method));
    }

    fn class_redefined(&self, class: ClassId) {
        self.info().add_redefined_class(class);
        let interrupted = self.info().interrupt_remote_compilations();
        if interrupted > 0 {
            log::debug!("{}: {} redefined, interrupting {} remote compilations", self.client_uid(), class, interrupted);
        }
        self.engine().lock().fire(AssumptionKey::Redefinition(class));
    }

    fn breakpoint_set(&self, method: MethodId) {
        self.engine().lock().fire(AssumptionKey::Breakpoint(method));
    }

    fn call_site_retargeted(&self, call_site: ObjectHandle) {
        self.engine().lock().fire(AssumptionKey::CallSite(call_site));
    }

    fn final_field_modified(&self, class: ClassId) {
        self.info().add_illegal_final_modification(class);
    }
}
