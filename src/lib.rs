#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Import style
#![allow(clippy::wildcard_imports)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Self usage
#![allow(clippy::unused_self)]
#![allow(clippy::used_underscore_binding)]
// Clone/assign patterns
#![allow(clippy::assigning_clones)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
#![allow(clippy::implicit_hasher)]
// Inlining
#![allow(clippy::inline_always)]
// Iterator patterns
#![allow(clippy::iter_without_into_iter)]
// Reference patterns
#![allow(clippy::ref_option)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]
// Large types
#![allow(clippy::large_futures)]
#![allow(clippy::large_enum_variant)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Copy vs clone style
#![allow(clippy::cloned_instead_of_copied)]
// String conversion efficiency
#![allow(clippy::inefficient_to_string)]
// Sort stability
#![allow(clippy::stable_sort_primitive)]
// Debug impl completeness
#![allow(clippy::missing_fields_in_debug)]
// Error handling style
#![allow(clippy::result_large_err)]
#![allow(clippy::unnecessary_box_returns)]
// Boolean ops
#![allow(clippy::nonminimal_bool)]
// Explicit returns
#![allow(clippy::needless_return)]
#![allow(clippy::semicolon_if_nothing_returned)]
// Cast wrapping
#![allow(clippy::cast_possible_wrap)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::explicit_into_iter_loop)]
// Bool conversion
#![allow(clippy::bool_to_int_with_if)]
// String allocation efficiency
#![allow(clippy::format_push_string)]
// File extension comparison
#![allow(clippy::case_sensitive_file_extension_comparisons)]
// Pointer casts
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ptr_cast_constness)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! Courier - AMQP consumer delivery control plane.
//!
//! The per-session logic that turns message-class verbs (subscribe, get,
//! flow, acquire, release, reject, recover) into mutations of consumer
//! state, without losing or duplicating a message under concurrent
//! consumers and producers.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//!
//! ## Messaging
//! - `messaging::ranges` - Sequence ranges and their flat wire form
//! - `messaging::flow` - Credit-based and windowed flow control
//! - `messaging::prefetch` - Session prefetch window
//! - `messaging::consumers` - Consumer registry and subscriptions
//! - `messaging::acquisition` - Delivery records and acquisition state
//! - `messaging::dispatch` - Dispatch signalling between queues and sessions
//! - `messaging::queue` - Queue contract, in-memory queue and registry
//!
//! ## Workloads
//! - `workloads::amqp` - Message-class sessions, command routing, driver
//!
//! ## Operations
//! - `ops::telemetry` - Tracing setup
//!
//! ## CLI
//! - `cli` - `courier` command-line tools

// Core infrastructure
pub mod core;

// Messaging
pub mod messaging;

// Workloads
pub mod workloads;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::config;
pub use messaging::{acquisition, consumers, dispatch, flow, prefetch, queue, ranges};
pub use ops::telemetry;
pub use workloads::amqp;
pub use workloads::amqp::{handler, session};
