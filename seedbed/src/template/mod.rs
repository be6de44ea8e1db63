use crate::error::{FixtureError, Result};
use crate::value::{Record, Value};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::RwLock;
use uuid::Uuid;

/// A registered template function. Functions take no arguments and render
/// to text.
pub type TemplateFn = Box<dyn Fn() -> String + Send + Sync>;

static FUNCTIONS: Lazy<RwLock<BTreeMap<String, TemplateFn>>> = Lazy::new(|| {
    // One fixture ID per process, stable across renders.
    let fixture_id = Uuid::new_v4().to_string();

    let mut functions: BTreeMap<String, TemplateFn> = BTreeMap::new();
    functions.insert("fixtureID".to_string(), Box::new(move || fixture_id.clone()));
    RwLock::new(functions)
});

/// Register a template function. The registry is process-wide and intended
/// to be populated before any fixture is applied; the first registration of
/// a name wins.
pub fn add_template_fn(name: &str, function: TemplateFn) {
    let mut functions = FUNCTIONS.write().unwrap();
    if functions.contains_key(name) {
        log::warn!("skipping duplicate template function {name}");
        return;
    }
    functions.insert(name.to_string(), function);
}

enum Segment {
    Literal(String),
    /// `{{ .path.to.field }}`: a template data lookup.
    Data(Vec<String>),
    /// `{{ name }}`: a registered function call.
    Func(String),
}

fn parse(source: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }

        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| FixtureError::Template(format!("unclosed placeholder in {source:?}")))?;

        let expr = after[..end].trim();
        if expr.is_empty() {
            return Err(FixtureError::Template("empty placeholder".to_string()));
        }

        if let Some(path) = expr.strip_prefix('.') {
            let path: Vec<String> = path.split('.').map(str::to_string).collect();
            if path.iter().any(String::is_empty) {
                return Err(FixtureError::Template(format!("malformed field path: {expr}")));
            }
            segments.push(Segment::Data(path));
        } else {
            segments.push(Segment::Func(expr.to_string()));
        }

        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }

    Ok(segments)
}

fn lookup<'a>(data: &'a Record, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = data.get(first)?;

    for step in rest {
        current = current.as_map()?.get(step)?;
    }

    Some(current)
}

/// Render a template source against the given data. `{{ .field }}`
/// substitutes template data (dotted paths descend into nested maps) and
/// `{{ name }}` invokes a registered function.
pub fn render(source: &str, data: Option<&Record>) -> Result<String> {
    let mut out = String::with_capacity(source.len());

    for segment in parse(source)? {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Data(path) => {
                let value = data.and_then(|data| lookup(data, &path)).ok_or_else(|| {
                    FixtureError::Template(format!(
                        "unknown template data field: .{}",
                        path.join(".")
                    ))
                })?;
                out.push_str(&value.to_string());
            }
            Segment::Func(name) => {
                let functions = FUNCTIONS.read().unwrap();
                let function = functions.get(&name).ok_or_else(|| {
                    FixtureError::Template(format!("unknown template function: {name}"))
                })?;
                out.push_str(&function());
            }
        }
    }

    Ok(out)
}
