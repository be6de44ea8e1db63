use crate::command::{self, CommandInput};
use crate::config::{Config, WriteMode};
use crate::document::{self, Format};
use crate::error::{FixtureError, Result};
use crate::graph::{DependencyGraph, NodeCallback, NodeLabel};
use crate::template;
use crate::value::{self, Database, Record, Value};
use crate::writer::Writer;
use petgraph::graph::NodeIndex;
use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// One step into a nested field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Index(usize),
    Key(String),
}

/// The address of the exact slot a command occupied: a record field, plus a
/// trail of sequence indexes and map keys for nested values. Deferred
/// callbacks write their resolved value back through this address.
#[derive(Debug, Clone)]
pub struct Slot {
    pub table: String,
    pub key: String,
    pub field: String,
    pub path: Vec<PathStep>,
}

impl Slot {
    fn new(table: &str, key: &str, field: &str) -> Slot {
        Slot {
            table: table.to_string(),
            key: key.to_string(),
            field: field.to_string(),
            path: Vec::new(),
        }
    }

    fn child_index(&self, index: usize) -> Slot {
        let mut child = self.clone();
        child.path.push(PathStep::Index(index));
        child
    }

    fn child_key(&self, key: &str) -> Slot {
        let mut child = self.clone();
        child.path.push(PathStep::Key(key.to_string()));
        child
    }

    /// The dotted field label, e.g. `ids.0` or `meta.alpha_id`.
    pub fn field_label(&self) -> String {
        let mut label = self.field.clone();
        for step in &self.path {
            match step {
                PathStep::Index(i) => label.push_str(&format!(".{i}")),
                PathStep::Key(k) => label.push_str(&format!(".{k}")),
            }
        }
        label
    }
}

/// An in-memory description of a desired initial database state plus the
/// machinery to realize it.
///
/// Populate the public fields, then call [`Fixture::apply`]. A fixture is
/// single-use: a second `apply` on the same instance is rejected.
#[derive(Default)]
pub struct Fixture {
    /// Shared run parameters; treated as read-only once `apply` starts.
    pub config: Arc<Config>,
    /// The writer that materializes records into the backing store.
    pub writer: Option<Box<dyn Writer>>,
    /// Prepended to `file` when set.
    pub dir: Option<PathBuf>,
    /// A fixture file holding a full database, or a directory holding one
    /// file per table.
    pub file: Option<PathBuf>,
    /// An input stream holding a full database document.
    pub body: Option<Box<dyn Read>>,
    /// The decoder for `body`.
    pub body_format: Option<Format>,
    /// Initial database state. Records loaded from `file`/`body` are merged
    /// over it.
    pub database: Database,
    /// When set, raw document text is rendered as a template before
    /// decoding.
    pub template_data: Option<Record>,
    /// Dump the final database as JSON after a successful run.
    pub print_json: bool,
    /// Disable auto-creation of referenced records. Unresolved references
    /// then fail the run, since no writer call will satisfy their deferred
    /// callbacks.
    pub skip_dependency_creation: bool,

    applied: bool,
    graph: DependencyGraph,
    touched: HashSet<NodeLabel>,
}

impl Fixture {
    pub fn new(config: Arc<Config>) -> Fixture {
        Fixture {
            config,
            ..Default::default()
        }
    }

    /// Whether this fixture has already been applied.
    pub fn applied(&self) -> bool {
        self.applied
    }

    /// Load the database, evaluate every record field, topologically sort
    /// the dependency graph, and write each record through the writer with
    /// its dependencies written first.
    pub fn apply(&mut self) -> Result<()> {
        if self.applied {
            return Err(FixtureError::AlreadyApplied);
        }

        self.config.init()?;

        let mut writer = self.writer.take().ok_or(FixtureError::MissingWriter)?;
        let result = self.apply_with(writer.as_mut());
        self.writer = Some(writer);
        result?;

        self.applied = true;
        Ok(())
    }

    fn apply_with(&mut self, writer: &mut dyn Writer) -> Result<()> {
        self.load_database()?;
        self.evaluate()?;

        let order = self.graph.sorted()?;
        for idx in order {
            self.write_node(idx, writer)?;
        }

        if self.print_json {
            let dump = serde_json::to_string_pretty(&value::database_to_json(&self.database))?;
            println!("{dump}");
        }

        Ok(())
    }

    // ── Document ingestion ──────────────────────────────────────────

    fn load_database(&mut self) -> Result<()> {
        if let Some(mut body) = self.body.take() {
            let format = self.body_format.ok_or(FixtureError::MissingBodyFormat)?;
            let mut text = String::new();
            body.read_to_string(&mut text)?;
            let text = self.preprocess(text)?;
            let parsed = document::parse_database(format, &text)?;
            self.merge_database(parsed);
            return Ok(());
        }

        let Some(file) = self.file.clone() else {
            if self.database.is_empty() {
                return Err(FixtureError::MissingInput);
            }
            return Ok(());
        };

        let path = match &self.dir {
            Some(dir) => dir.join(&file),
            None => file,
        };

        let parsed = if path.is_dir() {
            self.load_database_dir(&path)?
        } else {
            let format = document::format_for(&path)?;
            let text = std::fs::read_to_string(&path)?;
            let text = self.preprocess(text)?;
            document::parse_database(format, &text)?
        };

        self.merge_database(parsed);
        Ok(())
    }

    fn load_database_dir(&self, path: &std::path::Path) -> Result<Database> {
        if self.template_data.is_none() {
            return document::read_database_dir(path);
        }

        // The template pre-pass applies to each table file separately.
        let mut database = Database::new();
        let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }
            let Ok(format) = document::format_for(&entry_path) else {
                continue;
            };
            let Some(name) = entry_path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let text = std::fs::read_to_string(&entry_path)?;
            let text = self.preprocess(text)?;
            database.insert(name.to_string(), document::parse_table(format, &text)?);
        }

        Ok(database)
    }

    fn preprocess(&self, text: String) -> Result<String> {
        match &self.template_data {
            Some(data) => template::render(&text, Some(data)),
            None => Ok(text),
        }
    }

    fn merge_database(&mut self, parsed: Database) {
        for (table, records) in parsed {
            let entry = self.database.entry(table).or_default();
            for (key, record) in records {
                entry.insert(key, record);
            }
        }
    }

    // ── Field evaluation ────────────────────────────────────────────

    fn evaluate(&mut self) -> Result<()> {
        let mut recursive = Database::new();

        let tables: Vec<String> = self.database.keys().cloned().collect();
        for table in &tables {
            let keys: Vec<String> = self
                .database
                .get(table)
                .map(|t| t.keys().cloned().collect())
                .unwrap_or_default();
            self.evaluate_keys(table, &keys, &mut recursive)?;
        }

        // Auto-created dependencies are evaluated in waves until the
        // transitive closure of referenced records is reached.
        while !recursive.is_empty() {
            let batch = std::mem::take(&mut recursive);
            for (table, records) in batch {
                let keys: Vec<String> = records.keys().cloned().collect();
                let entry = self.database.entry(table.clone()).or_default();
                for (key, record) in records {
                    entry.entry(key).or_insert(record);
                }
                self.evaluate_keys(&table, &keys, &mut recursive)?;
            }
        }

        Ok(())
    }

    fn evaluate_keys(
        &mut self,
        table: &str,
        keys: &[String],
        recursive: &mut Database,
    ) -> Result<()> {
        let table_mode = self
            .config
            .table_options
            .get(table)
            .and_then(|options| options.write_mode);
        let sync_writes = table_mode.or(self.config.write_mode) == Some(WriteMode::Sync);

        // Keys arrive in lexicographic order; in sync mode each record
        // depends on the previous one, forcing strictly sequential writes.
        for (i, key) in keys.iter().enumerate() {
            let node = self.graph.get_node(&(table.to_string(), key.clone()));

            if sync_writes && i > 0 {
                let previous = self
                    .graph
                    .get_node(&(table.to_string(), keys[i - 1].clone()));
                self.graph.add_dependency(previous, node);
            }

            self.evaluate_record(table, key, node, recursive)?;
        }

        Ok(())
    }

    fn evaluate_record(
        &mut self,
        table: &str,
        key: &str,
        node: NodeIndex,
        recursive: &mut Database,
    ) -> Result<()> {
        let Some(mut record) = self.database.get_mut(table).and_then(|t| t.remove(key)) else {
            return Ok(());
        };

        log::debug!("evaluating {table}/{key}");

        if let Some(options) = self.config.table_options.get(table) {
            for (field, default) in &options.default_values {
                if !record.contains_key(field) {
                    record.insert(field.clone(), default.clone());
                }
            }
        }

        if !self.skip_dependency_creation {
            self.touched.insert((table.to_string(), key.to_string()));
        }

        let fields: Vec<String> = record.keys().cloned().collect();
        for field in fields {
            let Some(value) = record.remove(&field) else {
                continue;
            };
            let slot = Slot::new(table, key, &field);
            let parsed = self
                .parse_field(table, key, &field, value, node, slot, recursive)
                .map_err(|e| FixtureError::record(table, key, &field, e))?;
            record.insert(field, parsed);
        }

        self.database
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record);

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_field(
        &mut self,
        table: &str,
        key: &str,
        label: &str,
        value: Value,
        node: NodeIndex,
        slot: Slot,
        recursive: &mut Database,
    ) -> Result<Value> {
        // Late-bound values are produced first, then treated like any other.
        let value = match value {
            Value::Computed(compute) => compute(key)?,
            other => other,
        };

        let text = match value {
            Value::Array(mut items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let taken = std::mem::replace(item, Value::Null);
                    let child_label = format!("{label}.{i}");
                    *item = self.parse_field(
                        table,
                        key,
                        &child_label,
                        taken,
                        node,
                        slot.child_index(i),
                        recursive,
                    )?;
                }
                return Ok(Value::Array(items));
            }
            Value::Map(mut entries) => {
                let child_keys: Vec<String> = entries.keys().cloned().collect();
                for child_key in child_keys {
                    let Some(taken) = entries.remove(&child_key) else {
                        continue;
                    };
                    let child_label = format!("{label}.{child_key}");
                    let parsed = self.parse_field(
                        table,
                        key,
                        &child_label,
                        taken,
                        node,
                        slot.child_key(&child_key),
                        recursive,
                    )?;
                    entries.insert(child_key, parsed);
                }
                return Ok(Value::Map(entries));
            }
            Value::String(text) if !text.is_empty() => text,
            other => return Ok(other),
        };

        let command_source = if !text.starts_with('=') {
            match self.config.reference(table, label)? {
                // A plain value in a declared reference field is sugar for
                // a ref command against the referenced table.
                Some(reference) => format!("=ref {} {}", reference.table, text),
                None => return Ok(Value::String(text)),
            }
        } else {
            text.clone()
        };

        let (name, line) = split_command(&command_source);

        let input = CommandInput {
            config: &*self.config,
            template_data: self.template_data.as_ref(),
            table,
            key,
            field: label,
            line,
        };
        let output = command::run_command(name, &input)?;

        if output.dependencies.is_empty() {
            return Ok(output.value.unwrap_or(Value::Null));
        }

        for dependency in output.dependencies {
            let dep_node = self.graph.get_node(&dependency.label);

            if let Some(resolve) = dependency.resolve {
                // Once the dependency has been written, the callback fills
                // this exact slot with the resolved value.
                self.graph.push_callback(
                    dep_node,
                    NodeCallback {
                        resolve,
                        slot: slot.clone(),
                    },
                );
            }

            self.graph.add_dependency(dep_node, node);

            if self.skip_dependency_creation || self.touched.contains(&dependency.label) {
                continue;
            }
            self.touched.insert(dependency.label.clone());

            let (dep_table, dep_key) = &dependency.label;
            if self
                .database
                .get(dep_table)
                .is_some_and(|t| t.contains_key(dep_key))
            {
                continue;
            }

            // The referenced record does not exist yet; materialize an
            // empty record for the next evaluation wave.
            recursive
                .entry(dep_table.clone())
                .or_default()
                .insert(dep_key.clone(), Record::new());
        }

        // The command string stays in place until its callback fires.
        Ok(Value::String(text))
    }

    // ── Write phase ─────────────────────────────────────────────────

    fn write_node(&mut self, idx: NodeIndex, writer: &mut dyn Writer) -> Result<()> {
        let (table, key) = self
            .graph
            .label(idx)
            .cloned()
            .ok_or_else(|| FixtureError::Other("unknown node in sort order".to_string()))?;

        let mut record = self
            .database
            .get_mut(&table)
            .and_then(|t| t.remove(&key))
            .ok_or_else(|| FixtureError::RecordNotFound {
                table: table.clone(),
                key: key.clone(),
            })?;

        if let Some(options) = self.config.table_options.get(&table) {
            if let Some(hook) = &options.before_write {
                hook(&mut record).map_err(|e| FixtureError::BeforeWrite {
                    table: table.clone(),
                    key: key.clone(),
                    source: Box::new(e),
                })?;
            }
        }

        writer
            .insert(self, &table, &key, &mut record)
            .map_err(|e| FixtureError::Write {
                table: table.clone(),
                key: key.clone(),
                source: Box::new(e),
            })?;

        self.database
            .entry(table.clone())
            .or_default()
            .insert(key.clone(), record);

        // Propagate backend-assigned values into dependent records before
        // any dependent's writer runs.
        for callback in self.graph.take_callbacks(idx) {
            let resolved = (callback.resolve)(self).map_err(|e| {
                FixtureError::record(
                    &callback.slot.table,
                    &callback.slot.key,
                    &callback.slot.field_label(),
                    e,
                )
            })?;
            self.set_slot(&callback.slot, resolved)?;
        }

        Ok(())
    }

    fn set_slot(&mut self, slot: &Slot, value: Value) -> Result<()> {
        let not_found = || FixtureError::FieldNotFound {
            table: slot.table.clone(),
            key: slot.key.clone(),
            field: slot.field_label(),
        };

        let record = self
            .database
            .get_mut(&slot.table)
            .and_then(|t| t.get_mut(&slot.key))
            .ok_or_else(|| FixtureError::RecordNotFound {
                table: slot.table.clone(),
                key: slot.key.clone(),
            })?;

        let mut current = record.get_mut(&slot.field).ok_or_else(not_found)?;
        for step in &slot.path {
            current = match (step, current) {
                (PathStep::Index(i), Value::Array(items)) => {
                    items.get_mut(*i).ok_or_else(not_found)?
                }
                (PathStep::Key(k), Value::Map(entries)) => {
                    entries.get_mut(k).ok_or_else(not_found)?
                }
                _ => return Err(not_found()),
            };
        }
        *current = value;

        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Read a field from the current database state.
    pub fn get_field(&self, table: &str, key: &str, field: &str) -> Result<&Value> {
        let records = self
            .database
            .get(table)
            .ok_or_else(|| FixtureError::TableNotFound {
                table: table.to_string(),
            })?;

        let record = records.get(key).ok_or_else(|| FixtureError::RecordNotFound {
            table: table.to_string(),
            key: key.to_string(),
        })?;

        record.get(field).ok_or_else(|| FixtureError::FieldNotFound {
            table: table.to_string(),
            key: key.to_string(),
            field: field.to_string(),
        })
    }

    /// Set a field, creating the table and record as needed.
    pub fn set_field(&mut self, table: &str, key: &str, field: &str, value: Value) -> Result<()> {
        self.database
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }
}

/// Split `=<name>[ <line>]` into the command name and its argument line.
fn split_command(text: &str) -> (&str, &str) {
    let body = &text[1..];
    match body.find([' ', '\t', '\n']) {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => (body, ""),
    }
}
