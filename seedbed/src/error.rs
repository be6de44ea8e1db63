use thiserror::Error;

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("missing writer")]
    MissingWriter,

    #[error("missing fixture body, file, or database")]
    MissingInput,

    #[error("missing body format")]
    MissingBodyFormat,

    #[error("fixture has already been applied")]
    AlreadyApplied,

    #[error("unsupported file extension: {0}")]
    UnsupportedFormat(String),

    #[error("malformed document: {0}")]
    Document(String),

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("record not found: {table}/{key}")]
    RecordNotFound { table: String, key: String },

    #[error("field not found: {table}/{key}.{field}")]
    FieldNotFound {
        table: String,
        key: String,
        field: String,
    },

    #[error("primary key undefined for table {table}")]
    PrimaryKeyUndefined { table: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command {name}: {message}")]
    Command { name: String, message: String },

    #[error("malformed string literal: {0}")]
    StringLiteral(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("failed to sort records topologically: cycle involving {table}/{key}")]
    Cycle { table: String, key: String },

    #[error("table {table}, key {key}, field {field}: {source}")]
    Record {
        table: String,
        key: String,
        field: String,
        #[source]
        source: Box<FixtureError>,
    },

    #[error("failed to execute before-write hook for {table}/{key}: {source}")]
    BeforeWrite {
        table: String,
        key: String,
        #[source]
        source: Box<FixtureError>,
    },

    #[error("failed to insert record {table}/{key}: {source}")]
    Write {
        table: String,
        key: String,
        #[source]
        source: Box<FixtureError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl FixtureError {
    /// Wrap an error with the record slot that produced it.
    pub fn record(table: &str, key: &str, field: &str, source: FixtureError) -> FixtureError {
        FixtureError::Record {
            table: table.to_string(),
            key: key.to_string(),
            field: field.to_string(),
            source: Box::new(source),
        }
    }

    /// Convenience constructor for command argument errors.
    pub fn command(name: &str, message: impl Into<String>) -> FixtureError {
        FixtureError::Command {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FixtureError>;
