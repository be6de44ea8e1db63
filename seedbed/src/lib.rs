pub mod command;
pub mod config;
pub mod document;
pub mod error;
pub mod fixture;
pub mod graph;
pub mod template;
pub mod value;
pub mod writer;

pub use command::{register_command, CommandDependency, CommandInput, CommandOutput};
pub use config::{Config, Reference, TableOptions, WriteMode};
pub use document::Format;
pub use error::{FixtureError, Result};
pub use fixture::Fixture;
pub use template::add_template_fn;
pub use value::{Database, Record, Table, Value};
pub use writer::{SqliteWriter, Writer};
