//! Test utilities for arena-based testing.
//!
//! This module provides a bounded arena per test and a way to run code
//! against a fully wired allocator context on the 64-bit x86 target.

#[cfg(test)]
pub mod test {
    use super::super::allocator::Context;
    use super::super::config::AllocatorConfig;
    use super::super::event::EventGraph;
    use super::super::frame::FrameLayout;
    use super::super::promise::PromiseTable;
    use super::super::session::CompilationSession;
    use super::super::value::ValueTable;
    use crate::arch::Architecture;
    use crate::trace::TraceAssembler;
    use crate::x86::{X86Architecture, X86Assembler};
    use bumpalo::Bump;

    /// Test context that manages arena lifetime for tests.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        /// Create a new test context with default capacity.
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        /// Get a reference to the arena.
        pub fn arena(&self) -> &Bump {
            &self.arena
        }

        /// Create a compilation session using this context's arena.
        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }

        /// Run `f` against an allocator context on x86-64 with the small
        /// test frame layout, returning the recorded assembly too.
        pub fn with_allocator<F, R>(&self, f: F) -> (R, Vec<String>)
        where
            F: FnOnce(&mut Context<'_, '_>) -> R,
        {
            let session = self.create_session();
            let arch = X86Architecture::x86_64();
            let mut values = ValueTable::new();
            let mut events = EventGraph::new();
            let mut promises = PromiseTable::new();
            let mut asm =
                TraceAssembler::new(X86Assembler::new(&arch).expect("assembler for tests"));
            let layout = FrameLayout::for_test(arch.stack_register(), arch.word_size());
            let result = {
                let mut context = Context::new(
                    &arch,
                    &session,
                    AllocatorConfig::default(),
                    &mut values,
                    &mut events,
                    &mut promises,
                    layout,
                    &mut asm,
                );
                f(&mut context)
            };
            (result, asm.lines().to_vec())
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }
}
