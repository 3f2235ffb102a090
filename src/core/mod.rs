// This module is the target-independent heart of the crate. A front end describes a unit as
// events through Compiler (compiler); each event declares reads of values, constrained by
// site masks (site). Values, reads and the buddy rings of values sharing a location live in
// arenas (value), events and their control flow links in the event graph (event), and the
// abstract operand stack and locals in persistent frames (frame). At compile time a Context
// (allocator) tracks which value holds every register and frame slot (register_file), picks
// and steals sites, emits per-event code (emit), reconciles control flow edges (junction) and
// drives the whole walk (driver). Code positions and pool addresses are deferred integers
// (promise) resolved once blocks are laid out. Statistics are collected per session (session)
// and the tunable cost heuristics live in config.

//! Allocation core.
//!
//! # Key Components
//!
//! ## Front end (`compiler`)
//! - Builds events, reads and links for one compilation unit
//! - Lowers operations the target cannot encode to helper calls
//!
//! ## Allocation (`allocator`, `register_file`, `site`)
//! - Cost-based target selection with stealing
//! - Freeze/thaw pinning of resources in use
//!
//! ## Control flow (`event`, `junction`, `frame`)
//! - Junction tables agreed on the first resolved edge
//! - Snapshots for out-of-sequence single predecessors
//!
//! ## Output (`driver`, `promise`)
//! - Block layout, constant pool and final bytes

pub mod allocator;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod emit;
pub mod error;
pub mod event;
pub mod frame;
pub mod junction;
pub mod promise;
pub mod register_file;
pub mod session;
pub mod site;
pub mod test_utils;
pub mod value;

pub use allocator::Context;
pub use compiler::Compiler;
pub use config::AllocatorConfig;
pub use error::{CompileError, CompileResult};
pub use event::{CallArgument, EventGraph, EventId, EventKind};
pub use frame::{ForkState, FrameLayout, FrameState};
pub use promise::{CodeLayout, CodeOffset, PromiseId, PromiseTable};
pub use register_file::{RegAllocError, RegisterFile, ResourceId};
pub use session::{CompilationSession, SessionStats};
pub use site::{Site, SiteMask};
pub use value::{FrameHome, ReadId, ValueId, ValueTable, ValueType};
