//! SQL fixtures applied once the query engine is reachable.
//!
//! A fixture root holds two folders, `create/` and `insert/`. Every `*.sql`
//! file directly inside them is parsed into statements and executed in
//! order: all of `create/` (by filename), then all of `insert/`.

mod discovery;
mod parser;
mod pipeline;

pub use discovery::{FixtureScript, ScriptGroup, discover};
pub use parser::parse_statements;
pub use pipeline::{PipelineReport, ScriptPipeline};
