use crate::config::Config;
use crate::error::{FixtureError, Result};
use crate::fixture::Fixture;
use crate::template;
use crate::value::{Record, Value};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::RwLock;
use ulid::Ulid;
use uuid::Uuid;

/// Everything a command handler may consult: the shared config, template
/// data, the enclosing record's coordinates, and the argument line.
pub struct CommandInput<'a> {
    pub config: &'a Config,
    pub template_data: Option<&'a Record>,
    pub table: &'a str,
    pub key: &'a str,
    pub field: &'a str,
    pub line: &'a str,
}

impl CommandInput<'_> {
    /// Tokenize the argument line into positional and keyword arguments.
    pub fn scan_line(&self) -> (Vec<String>, BTreeMap<String, String>) {
        scan_line(self.line)
    }
}

/// Reads a resolved field once the dependency's writer call has returned.
pub type ResolveFn = Box<dyn Fn(&Fixture) -> Result<Value> + Send + Sync>;

/// A record this command's output depends on, with an optional deferred
/// value producer fired after the dependency is written.
pub struct CommandDependency {
    pub label: (String, String),
    pub resolve: Option<ResolveFn>,
}

/// What a command evaluated to: either an immediate value, or a set of
/// dependencies whose callbacks will fill the slot in later.
#[derive(Default)]
pub struct CommandOutput {
    pub value: Option<Value>,
    pub dependencies: Vec<CommandDependency>,
    /// Reserved for commands that update existing records; the topological
    /// write path is insert-only.
    pub is_update: bool,
}

impl CommandOutput {
    pub fn with_value(value: Value) -> CommandOutput {
        CommandOutput {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn with_dependency(dependency: CommandDependency) -> CommandOutput {
        CommandOutput {
            dependencies: vec![dependency],
            ..Default::default()
        }
    }
}

pub type CommandFn = Box<dyn Fn(&CommandInput) -> Result<CommandOutput> + Send + Sync>;

static COMMANDS: Lazy<RwLock<BTreeMap<String, CommandFn>>> = Lazy::new(|| {
    let mut commands: BTreeMap<String, CommandFn> = BTreeMap::new();
    commands.insert("base64dec".to_string(), Box::new(base64dec_command));
    commands.insert("key".to_string(), Box::new(key_command));
    commands.insert("ref".to_string(), Box::new(ref_command));
    commands.insert("template".to_string(), Box::new(template_command));
    commands.insert("ulid".to_string(), Box::new(ulid_command));
    commands.insert("uuidv4".to_string(), Box::new(uuidv4_command));
    RwLock::new(commands)
});

/// Register a command under the given name. The registry is process-wide
/// and intended to be populated before any fixture is applied; the first
/// registration of a name wins.
pub fn register_command(name: &str, command: CommandFn) {
    let mut commands = COMMANDS.write().unwrap();
    if commands.contains_key(name) {
        log::warn!("skipping duplicate command {name}");
        return;
    }
    commands.insert(name.to_string(), command);
}

/// Look up and execute a command by name.
pub fn run_command(name: &str, input: &CommandInput) -> Result<CommandOutput> {
    let commands = COMMANDS.read().unwrap();
    let command = commands
        .get(name)
        .ok_or_else(|| FixtureError::UnknownCommand(name.to_string()))?;
    command(input)
}

/// Tokenize a command line. Bare tokens become positional arguments and
/// `name=value` pairs become keyword arguments; a dangling trailing token is
/// flushed as a positional argument. Double-quoted literals are kept intact
/// (quotes included) for [`unquote`] to decode.
pub fn scan_line(line: &str) -> (Vec<String>, BTreeMap<String, String>) {
    let mut tokens: Vec<String> = Vec::new();
    let mut iter = line.chars().peekable();

    while let Some(c) = iter.next() {
        if c.is_whitespace() {
            continue;
        }

        match c {
            '=' => tokens.push("=".to_string()),
            '"' => {
                let mut token = String::from('"');
                let mut escaped = false;
                for c in iter.by_ref() {
                    token.push(c);
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        break;
                    }
                }
                tokens.push(token);
            }
            _ => {
                let mut token = String::from(c);
                while let Some(&next) = iter.peek() {
                    if next.is_whitespace() || next == '=' || next == '"' {
                        break;
                    }
                    token.push(next);
                    iter.next();
                }
                tokens.push(token);
            }
        }
    }

    let mut args = Vec::new();
    let mut kwargs = BTreeMap::new();
    let mut equals_prefix = false;
    let mut last = String::new();

    // The trailing empty token flushes a dangling positional argument.
    for token in tokens.into_iter().chain(std::iter::once(String::new())) {
        if token == "=" {
            equals_prefix = true;
            continue;
        }

        if equals_prefix {
            equals_prefix = false;
            kwargs.insert(std::mem::take(&mut last), token);
            continue;
        }

        if !last.is_empty() {
            args.push(std::mem::take(&mut last));
        }

        last = token;
    }

    (args, kwargs)
}

/// Decode a double-quoted string literal with standard escapes.
pub fn unquote(text: &str) -> Result<String> {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| FixtureError::StringLiteral(format!("not a quoted string: {text}")))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let escape = chars
            .next()
            .ok_or_else(|| FixtureError::StringLiteral("trailing backslash".to_string()))?;

        match escape {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '\\' | '"' | '\'' => out.push(escape),
            'x' => out.push(hex_escape(&mut chars, 2)?),
            'u' => out.push(hex_escape(&mut chars, 4)?),
            other => {
                return Err(FixtureError::StringLiteral(format!(
                    "unknown escape: \\{other}"
                )))
            }
        }
    }

    Ok(out)
}

fn hex_escape(chars: &mut std::str::Chars<'_>, digits: usize) -> Result<char> {
    let mut code = String::with_capacity(digits);
    for _ in 0..digits {
        code.push(chars.next().ok_or_else(|| {
            FixtureError::StringLiteral("truncated hex escape".to_string())
        })?);
    }

    let code = u32::from_str_radix(&code, 16)
        .map_err(|_| FixtureError::StringLiteral(format!("invalid hex escape: {code}")))?;

    char::from_u32(code)
        .ok_or_else(|| FixtureError::StringLiteral(format!("invalid character code: {code:#x}")))
}

fn base64dec_command(input: &CommandInput) -> Result<CommandOutput> {
    let (args, _) = input.scan_line();
    let encoded = args
        .first()
        .ok_or_else(|| FixtureError::command("base64dec", "expected at least 1 positional argument"))?;

    let decoded = BASE64_STANDARD
        .decode(unquote(encoded)?)
        .map_err(|e| FixtureError::command("base64dec", format!("failed to decode: {e}")))?;

    Ok(CommandOutput::with_value(Value::Bytes(decoded)))
}

fn key_command(input: &CommandInput) -> Result<CommandOutput> {
    let (args, _) = input.scan_line();

    let value = match args.first().map(String::as_str) {
        None => Value::String(input.key.to_string()),
        Some("int") => {
            let key: i64 = input.key.parse().map_err(|e| {
                FixtureError::command("key", format!("failed to convert key to int: {e}"))
            })?;
            Value::Integer(key)
        }
        Some(other) => {
            return Err(FixtureError::command(
                "key",
                format!("unsupported key type: {other}"),
            ))
        }
    };

    Ok(CommandOutput::with_value(value))
}

fn ref_command(input: &CommandInput) -> Result<CommandOutput> {
    let (args, _) = input.scan_line();
    if args.len() < 2 {
        return Err(FixtureError::command(
            "ref",
            "expected at least 2 positional arguments",
        ));
    }

    let table = args[0].clone();
    let mut key = args[1].clone();

    let field = match args.get(2) {
        Some(field) => field.clone(),
        None => input.config.primary_key_name(&table)?.to_string(),
    };

    // `#` refers to the enclosing record's own key.
    if key == "#" {
        key = input.key.to_string();
    }

    log::debug!("ref dependency {table}/{key}.{field}");

    let label = (table.clone(), key.clone());
    let resolve: ResolveFn =
        Box::new(move |fixture| fixture.get_field(&table, &key, &field).map(Value::clone));

    Ok(CommandOutput::with_dependency(CommandDependency {
        label,
        resolve: Some(resolve),
    }))
}

fn template_command(input: &CommandInput) -> Result<CommandOutput> {
    let rendered = template::render(input.line, input.template_data)?;
    Ok(CommandOutput::with_value(Value::String(rendered)))
}

fn ulid_command(input: &CommandInput) -> Result<CommandOutput> {
    let (_, kwargs) = input.scan_line();

    let ulid_value = match kwargs.get("fromString") {
        Some(quoted) => {
            let from_string = unquote(quoted)?;
            Ulid::from_string(&from_string).map_err(|e| {
                FixtureError::command("ulid", format!("failed to parse {from_string:?}: {e}"))
            })?
        }
        None => Ulid::new(),
    };

    let value = if kwargs.get("toString").map(String::as_str) == Some("true") {
        Value::String(ulid_value.to_string())
    } else {
        Value::Bytes(ulid_value.to_bytes().to_vec())
    };

    Ok(CommandOutput::with_value(value))
}

fn uuidv4_command(_input: &CommandInput) -> Result<CommandOutput> {
    Ok(CommandOutput::with_value(Value::String(
        Uuid::new_v4().to_string(),
    )))
}
