// THEORY:
// This file is the entry point for the `open_field` library crate. It exposes
// `FieldSession`, the object a runner feeds frames into, together with the
// records it produces and the exporters that persist them.
//
// The geometric and statistical machinery lives in `core_modules` and stays
// usable on its own (calibrating a single frame, re-aligning recorded CSVs),
// while `pipeline` wires it into the frame-ordered loop. The pose and behavior
// models are not part of this crate; they plug in through the `oracle` traits.

pub mod core_modules;
pub mod error;
pub mod export;
pub mod oracle;
pub mod pipeline;

pub use error::{CalibrationError, FieldError, Result};
pub use oracle::{BehaviorOracle, PoseOracle};
pub use pipeline::{AnalysisOutput, FieldConfig, FieldSession, FrameReport};
