//! Test utilities for code that runs inside one server-side compilation.
//!
//! A compilation borrows its per-compilation caches from an arena and its
//! persistent caches from the client session; the context below owns both so
//! a test can build a [`RemoteVmProxy`](crate::server::vm_proxy::RemoteVmProxy)
//! the way the server does for each request.

#[cfg(test)]
pub mod test {
    use crate::core::ids::ClientUid;
    use crate::core::session::CompilationSession;
    use crate::protocol::stream::Stream;
    use crate::server::client_session::ClientSessionData;
    use crate::server::vm_proxy::RemoteVmProxy;
    use bumpalo::Bump;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Owns the arena and client session a test compilation runs against.
    pub struct TestContext {
        arena: Bump,
        client_session: ClientSessionData,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self::for_client(ClientUid(1))
        }

        pub fn for_client(client_uid: ClientUid) -> Self {
            Self {
                arena: Bump::new(),
                client_session: ClientSessionData::new(client_uid),
            }
        }

        pub fn client_session(&self) -> &ClientSessionData {
            &self.client_session
        }

        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }

        /// Run `f` with a proxy over `stream`; the compilation session is returned for inspection.
        pub fn with_proxy<F, R>(&self, stream: &mut Stream, interrupted: bool, f: F) -> (R, CompilationSession<'_>)
        where
            F: FnOnce(&RemoteVmProxy<'_, '_>) -> R,
        {
            let session = self.create_session();
            let result = {
                let proxy = RemoteVmProxy::new(
                    stream,
                    &self.client_session,
                    &session,
                    Arc::new(AtomicBool::new(interrupted)),
                );
                f(&proxy)
            };
            (result, session)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }
}
