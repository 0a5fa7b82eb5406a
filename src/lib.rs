/*!
 * # FluentAI - machine translation over external decoder processes
 *
 * A Rust library that serves text translation between language pairs by
 * delegating inference to one external decoder process (e.g. `marian-decoder`)
 * per pair.
 *
 * ## Features
 *
 * - One long-lived decoder per language pair, spoken to over a line protocol
 * - Bounded LRU cache of decoders with a cap on simultaneous starts
 * - Automatic restart of crashed or stalled decoders
 * - Two-hop translation through a pivot language when no direct pair exists
 * - ISO 639-1 and ISO 639-2 language code validation
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration management
 * - `runtime`: Decoder process management:
 *   - `runtime::process`: One decoder process and its line protocol
 *   - `runtime::cache`: LRU cache of runtimes
 *   - `runtime::pivot`: Direct and pivot routing
 * - `app_controller`: Entry point used by front ends
 * - `language_utils`: ISO language code utilities
 * - `errors`: Error taxonomy of the core
 *
 * ## License
 *
 * This project is licensed under the MIT License
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]
// Test names follow test_<subject>_<condition>_should<Outcome>
#![cfg_attr(test, allow(non_snake_case))]

// Public modules
pub mod app_config;
pub mod app_controller;
pub mod errors;
pub mod language_utils;
pub mod runtime;

// Re-export main types for easier usage
pub use app_config::Config;
pub use app_controller::Controller;
pub use errors::{ErrorResponse, RuntimeError};
pub use language_utils::{get_language_name, is_valid_language_code, language_codes_match};
pub use runtime::{LanguagePairKey, PivotOrchestrator, RuntimeCache, RuntimeProcess, RuntimeStatus};
