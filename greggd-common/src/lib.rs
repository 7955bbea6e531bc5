pub mod kinds;
pub mod models;
pub mod utils;

pub use kinds::{EventKind, FieldType, GreggdVar, OutputKind};
pub use models::{EventSpec, FieldSpec, OutputSpec, ProgramSpec};
