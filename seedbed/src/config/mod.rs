use crate::error::{FixtureError, Result};
use crate::value::Record;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;

/// A hook invoked with the record immediately before its writer call.
/// It may mutate the record.
pub type BeforeWriteFn = Box<dyn Fn(&mut Record) -> Result<()> + Send + Sync>;

/// Write-serialization discipline for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Records are written strictly in lexicographic order of their keys.
    Sync,
}

/// Table-specific options, or a named profile over an aliased table.
///
/// Profiles let one real table be seeded under several names:
///
/// ```
/// use seedbed::{Config, TableOptions};
///
/// let mut config = Config::default();
/// config.table_options.insert(
///     "z".into(),
///     TableOptions {
///         table_name: Some("zeta".into()),
///         primary_key_name: Some("zeta_id".into()),
///         ..Default::default()
///     },
/// );
/// ```
#[derive(Default)]
pub struct TableOptions {
    /// The real table name when this entry is a profile. Writers consult
    /// [`Config::table_alias`] to resolve it.
    pub table_name: Option<String>,
    /// Per-table primary-key override.
    pub primary_key_name: Option<String>,
    /// Per-table reference map (field name to referenced table). An entry
    /// with an empty target suppresses a global reference for that field.
    pub references: BTreeMap<String, String>,
    /// Field values merged into every record of this table before
    /// evaluation. Never overwrite a field the user supplied.
    pub default_values: Record,
    /// Hook run before the record's writer call.
    pub before_write: Option<BeforeWriteFn>,
    /// Overrides the global write mode for this table.
    pub write_mode: Option<WriteMode>,
}

/// Parameters shared across fixtures. Read-only after [`Config::init`],
/// which runs at most once.
#[derive(Default)]
pub struct Config {
    /// The default name for the primary key field. Defaults to `"id"`.
    pub primary_key_name: Option<String>,
    /// Reference fields common to all tables (field name to referenced
    /// table).
    pub references: BTreeMap<String, String>,
    /// Per-table options, keyed by table name or profile name.
    pub table_options: BTreeMap<String, TableOptions>,
    /// Default write mode for all tables.
    pub write_mode: Option<WriteMode>,

    pub(crate) derived: OnceCell<Derived>,
}

#[derive(Debug)]
pub(crate) struct Derived {
    primary_key_name: String,
    aliases: BTreeMap<String, String>,
}

impl Config {
    /// Materialize defaults and the alias index. Idempotent; later mutations
    /// of the public fields are not observed.
    pub fn init(&self) -> Result<()> {
        self.derived();
        Ok(())
    }

    fn derived(&self) -> &Derived {
        self.derived.get_or_init(|| {
            let mut aliases = BTreeMap::new();
            for (profile, options) in &self.table_options {
                if let Some(name) = &options.table_name {
                    aliases.insert(profile.clone(), name.clone());
                }
            }

            Derived {
                primary_key_name: self
                    .primary_key_name
                    .clone()
                    .unwrap_or_else(|| "id".to_string()),
                aliases,
            }
        })
    }

    /// The real table name for a profile, if the profile declares one.
    pub fn table_alias(&self, table: &str) -> Option<&str> {
        self.derived().aliases.get(table).map(String::as_str)
    }

    /// The primary key field name for a table: the per-table override if
    /// set, otherwise the global default.
    pub fn primary_key_name(&self, table: &str) -> Result<&str> {
        if let Some(options) = self.table_options.get(table) {
            if let Some(name) = options.primary_key_name.as_deref() {
                if !name.is_empty() {
                    return Ok(name);
                }
            }
        }

        let name = &self.derived().primary_key_name;
        if name.is_empty() {
            return Err(FixtureError::PrimaryKeyUndefined {
                table: table.to_string(),
            });
        }

        Ok(name)
    }

    /// Resolve the reference target for a field, consulting the per-table
    /// map first and falling through to the global map when the field is
    /// absent there. A per-table entry with an empty target declares the
    /// field *not* a reference and stops resolution.
    pub fn reference(&self, table: &str, field: &str) -> Result<Option<Reference>> {
        let table_references = self
            .table_options
            .get(table)
            .map(|options| &options.references)
            .filter(|references| !references.is_empty());

        let target = match table_references {
            Some(references) => match references.get(field) {
                Some(target) if !target.is_empty() => Some(target.as_str()),
                // An empty target declares the field not a reference.
                Some(_) => return Ok(None),
                None => self.references.get(field).map(String::as_str),
            },
            None => self.references.get(field).map(String::as_str),
        };

        let Some(ref_table) = target.filter(|target| !target.is_empty()) else {
            return Ok(None);
        };

        let primary_key = self.primary_key_name(ref_table)?.to_string();

        Ok(Some(Reference {
            table: ref_table.to_string(),
            primary_key,
        }))
    }
}

/// A resolved reference target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub table: String,
    pub primary_key: String,
}
