/*!
 * Decoder runtime management.
 *
 * This module contains the process-level core of the service:
 *
 * - `key`: language pair keys used to address runtimes
 * - `model_files`: model directory layout
 * - `html`: entity decoding of decoder output
 * - `process`: one external decoder process per language pair
 * - `cache`: bounded LRU cache of runtimes with a start limiter
 * - `pivot`: direct and two-hop pivot translation
 */

// Re-export main types for easier usage
pub use self::cache::{RuntimeCache, RuntimeStatus};
pub use self::key::LanguagePairKey;
pub use self::model_files::ModelFiles;
pub use self::pivot::{PairTranslator, PivotOrchestrator, Route};
pub use self::process::{RuntimeProcess, RuntimeState};

// Submodules
pub mod cache;
pub mod html;
pub mod key;
pub mod model_files;
pub mod pivot;
pub mod process;
