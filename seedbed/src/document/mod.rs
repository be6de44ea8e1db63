use crate::error::{FixtureError, Result};
use crate::value::{self, Database, Record, Table, Value};
use std::path::Path;

/// A recognized fixture document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Yaml,
}

impl Format {
    /// Select a format from a file extension (`.toml`, `.yaml`, `.yml`,
    /// case-insensitive, leading dot optional).
    pub fn from_ext(ext: &str) -> Result<Format> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => Err(FixtureError::UnsupportedFormat(ext.to_string())),
        }
    }
}

fn parse_value(format: Format, text: &str) -> Result<Value> {
    match format {
        Format::Toml => {
            let parsed: toml::Value = text.parse()?;
            Ok(Value::from(parsed))
        }
        Format::Yaml => {
            let parsed: serde_yaml::Value = serde_yaml::from_str(text)?;
            value::from_yaml(parsed)
        }
    }
}

fn into_record(value: Value, context: &str) -> Result<Record> {
    match value {
        Value::Map(entries) => Ok(entries),
        Value::Null => Ok(Record::new()),
        other => Err(FixtureError::Document(format!(
            "{context} must be a mapping, got {other:?}"
        ))),
    }
}

fn into_table(value: Value, context: &str) -> Result<Table> {
    let entries = match value {
        Value::Map(entries) => entries,
        Value::Null => return Ok(Table::new()),
        other => {
            return Err(FixtureError::Document(format!(
                "{context} must be a mapping, got {other:?}"
            )))
        }
    };

    let mut table = Table::new();
    for (key, record) in entries {
        let context = format!("{context}/{key}");
        table.insert(key, into_record(record, &context)?);
    }
    Ok(table)
}

/// Parse a full database document: `table → key → field → value`.
pub fn parse_database(format: Format, text: &str) -> Result<Database> {
    let entries = match parse_value(format, text)? {
        Value::Map(entries) => entries,
        Value::Null => return Ok(Database::new()),
        other => {
            return Err(FixtureError::Document(format!(
                "database must be a mapping, got {other:?}"
            )))
        }
    };

    let mut database = Database::new();
    for (name, table) in entries {
        let table = into_table(table, &name)?;
        database.insert(name, table);
    }
    Ok(database)
}

/// Parse a single-table document: `key → field → value`.
pub fn parse_table(format: Format, text: &str) -> Result<Table> {
    into_table(parse_value(format, text)?, "table")
}

/// Read a full database from a file; the extension selects the decoder.
pub fn read_database(path: &Path) -> Result<Database> {
    let format = format_for(path)?;
    let text = std::fs::read_to_string(path)?;
    parse_database(format, &text)
}

/// Read a single table from a file. Useful for loading
/// [`TableOptions::default_values`](crate::TableOptions) from disk.
pub fn read_table(path: &Path) -> Result<Table> {
    let format = format_for(path)?;
    let text = std::fs::read_to_string(path)?;
    parse_table(format, &text)
}

/// Read a directory of per-table files. Each contained regular file with a
/// recognized extension becomes one table named after the file's basename;
/// other entries are skipped.
pub fn read_database_dir(path: &Path) -> Result<Database> {
    let mut database = Database::new();

    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }

        let Some(format) = entry_path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| Format::from_ext(ext).ok())
        else {
            continue;
        };

        let Some(name) = entry_path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        let text = std::fs::read_to_string(&entry_path)?;
        let table = parse_table(format, &text)
            .map_err(|e| FixtureError::Document(format!("{}: {e}", entry_path.display())))?;
        database.insert(name.to_string(), table);
    }

    Ok(database)
}

pub(crate) fn format_for(path: &Path) -> Result<Format> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    Format::from_ext(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_ext() {
        assert_eq!(Format::from_ext(".toml").unwrap(), Format::Toml);
        assert_eq!(Format::from_ext("YAML").unwrap(), Format::Yaml);
        assert_eq!(Format::from_ext(".yml").unwrap(), Format::Yaml);
        assert!(Format::from_ext(".json").is_err());
    }

    #[test]
    fn test_parse_database_toml() {
        let text = r#"
[alpha.1]
text_field = "alpha 1"

[beta.1]
alpha_id = "=ref alpha 1"
count = 3
"#;
        let database = parse_database(Format::Toml, text).unwrap();
        assert_eq!(
            database["alpha"]["1"]["text_field"],
            Value::String("alpha 1".into())
        );
        assert_eq!(database["beta"]["1"]["count"], Value::Integer(3));
    }

    #[test]
    fn test_parse_database_yaml() {
        let text = "alpha:\n  \"1\":\n    text_field: alpha 1\n    flags:\n      - true\n";
        let database = parse_database(Format::Yaml, text).unwrap();
        let record = &database["alpha"]["1"];
        assert_eq!(record["text_field"], Value::String("alpha 1".into()));
        assert_eq!(
            record["flags"],
            Value::Array(vec![Value::Bool(true)])
        );
    }

    #[test]
    fn test_parse_database_rejects_scalars() {
        assert!(parse_database(Format::Yaml, "just a string").is_err());
        assert!(parse_database(Format::Yaml, "alpha: 3").is_err());
    }

    #[test]
    fn test_parse_table() {
        let text = "\"1\":\n  name: x\n\"2\": {}\n";
        let table = parse_table(Format::Yaml, text).unwrap();
        assert_eq!(table["1"]["name"], Value::String("x".into()));
        assert!(table["2"].is_empty());
    }

    #[test]
    fn test_read_database_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("alpha.toml"),
            "[1]\ntext_field = \"alpha 1\"\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("beta.yaml"), "\"1\":\n  name: b\n").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();

        let database = read_database_dir(tmp.path()).unwrap();
        assert_eq!(database.len(), 2);
        assert_eq!(
            database["alpha"]["1"]["text_field"],
            Value::String("alpha 1".into())
        );
        assert_eq!(database["beta"]["1"]["name"], Value::String("b".into()));
    }

    #[test]
    fn test_read_table() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("defaults.yaml");
        std::fs::write(&path, "\"1\":\n  role: admin\n").unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table["1"]["role"], Value::String("admin".into()));
    }

    #[test]
    fn test_read_database_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.yaml");
        std::fs::write(&path, "alpha:\n  \"1\":\n    text_field: a\n").unwrap();

        let database = read_database(&path).unwrap();
        assert_eq!(
            database["alpha"]["1"]["text_field"],
            Value::String("a".into())
        );
    }

    #[test]
    fn test_read_database_unknown_extension() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            read_database(&path),
            Err(FixtureError::UnsupportedFormat(_))
        ));
    }
}
