//! Template resolution
//!
//! Turns dashboard query templates into executable SQL:
//!
//! - **Registry**: variable bindings for one analysis run
//! - **Time**: relative/absolute time expressions to epoch millis
//! - **Token**: single-pass tokenizer for `$var`, `${var:fmt}`, macros
//! - **Format**: joining and quoting of multi-value variables
//! - **Interpolate**: the engine that ties them together
//!
//! # Example
//!
//! ```rust
//! use dashql::template::{interpolate, TimeRange, Variable, VariableKind, VariableRegistry};
//!
//! let registry = VariableRegistry::from_variables([
//!     Variable::multi("ids", VariableKind::Custom, ["1", "2"]),
//! ]);
//! let range = TimeRange::parse("now-1h", "now").unwrap();
//! let out = interpolate("SELECT * FROM t WHERE id IN ($ids)", &registry, &range, chrono::Utc::now());
//! assert_eq!(out.text, "SELECT * FROM t WHERE id IN ('1','2')");
//! ```

mod error;
mod format;
mod interpolate;
mod registry;
mod time;
mod token;

pub use error::{Diagnostic, DiagnosticKind, TemplateError, TemplateResult};
pub use format::Format;
pub use interpolate::{interpolate, Interpolated, Interpolator};
pub use registry::{Binding, RegistryBuilder, Variable, VariableKind, VariableRegistry, ALL_SENTINEL};
pub use time::{resolve as resolve_time, ResolvedTimeRange, TimeRange, TimeSpec, TimeUnit};
pub use token::{referenced_variables, tokenize, TimeMacro, Token};
