//! The work behind each subcommand; the binary only parses arguments and
//! prints.

use crate::config::{KestrelConfig, CONFIG_FILE};
use crate::error::CliError;
use kestrel_core::{AtomRef, ModuleRegistry, SpecialObjects, Value};
use kestrel_runtime::{describe, Deserializer, Serializer, StreamDescription};
use num_bigint::BigInt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

fn read_bytes(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(CliError::io(path))
}

// ---------------------------------------------------------------------------
// describe
// ---------------------------------------------------------------------------

pub fn cmd_describe(file: &Path) -> Result<StreamDescription, CliError> {
    let bytes = read_bytes(file)?;
    Ok(describe(&bytes)?)
}

pub fn render_describe(description: &StreamDescription, json: bool) -> Result<String, CliError> {
    if json {
        serde_json::to_string_pretty(description).map_err(|source| CliError::Json {
            path: "<stdout>".into(),
            source,
        })
    } else {
        Ok(description.to_string())
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

/// What a full replay of a stream produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub values: usize,
    pub objects: usize,
    pub bytes: u64,
    /// Top-level values by kind.
    pub kinds: BTreeMap<&'static str, usize>,
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} values, {} objects, {} bytes",
            self.values, self.objects, self.bytes
        )?;
        let kinds: Vec<String> = self
            .kinds
            .iter()
            .map(|(kind, count)| format!("{} {}", count, kind))
            .collect();
        if !kinds.is_empty() {
            write!(f, " ({})", kinds.join(", "))?;
        }
        Ok(())
    }
}

/// Replay every value in `file` against the configured modules.
pub fn cmd_check(file: &Path, config: &KestrelConfig) -> Result<CheckReport, CliError> {
    let bytes = read_bytes(file)?;
    let context = config.build_context()?;
    let mut deserializer = Deserializer::new(bytes.as_slice(), &context.specials, &context.modules);
    let mut report = CheckReport::default();
    while let Some(value) = deserializer.deserialize()? {
        report.values += 1;
        *report.kinds.entry(value_kind(&value)).or_default() += 1;
    }
    report.objects = deserializer.objects_read();
    report.bytes = deserializer.offset();
    tracing::debug!(file = %file.display(), values = report.values, "stream checked");
    Ok(report)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Int(_) => "integer",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Atom(_) => "atom",
        Value::Tuple(_) => "tuple",
        Value::Set(_) => "set",
        Value::Map(_) => "map",
        Value::Function(_) => "function",
        Value::Code(_) => "code",
        Value::Variable(_) => "variable",
        Value::Continuation(_) => "continuation",
        Value::Type(_) => "type",
    }
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

/// Serialize each element of the JSON array in `input` (or the single
/// document, if it is not an array) into `output`.
///
/// JSON maps onto values directly: arrays become tuples, objects become maps
/// keyed by strings, booleans become the special true and false atoms.
/// A string `"#module.name"` is that module's atom and `"#name"` a
/// moduleless atom.
pub fn cmd_encode(
    input: &Path,
    output: &Path,
    scope: Option<&str>,
    config: &KestrelConfig,
) -> Result<u64, CliError> {
    let text = std::fs::read_to_string(input).map_err(CliError::io(input))?;
    let document: serde_json::Value =
        serde_json::from_str(&text).map_err(|source| CliError::Json {
            path: input.to_path_buf(),
            source,
        })?;
    let context = config.build_context()?;
    let documents = match document {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let file = std::fs::File::create(output).map_err(CliError::io(output))?;
    let mut serializer = Serializer::new(
        std::io::BufWriter::new(file),
        &context.specials,
        &context.modules,
    );
    if let Some(name) = scope {
        let module = context
            .modules
            .module_named(name)
            .ok_or_else(|| CliError::Encode(format!("unknown module '{}'", name)))?;
        serializer = serializer.with_module(module);
    }
    for document in &documents {
        let value = json_to_value(document, &context.specials, &context.modules)?;
        serializer.serialize(&value)?;
    }
    serializer.flush()?;
    tracing::debug!(
        output = %output.display(),
        values = documents.len(),
        objects = serializer.objects_written(),
        "stream written"
    );
    Ok(serializer.bytes_written())
}

pub fn json_to_value(
    json: &serde_json::Value,
    specials: &SpecialObjects,
    modules: &ModuleRegistry,
) -> Result<Value, CliError> {
    use serde_json::Value as Json;
    Ok(match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => specials.boolean(*b),
        Json::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => Value::from(i),
            (None, Some(u), _) => Value::from(BigInt::from(u)),
            (None, None, Some(f)) => Value::Float(f),
            _ => return Err(CliError::Encode(format!("unrepresentable number {}", n))),
        },
        Json::String(s) => match s.strip_prefix('#') {
            Some(atom) => Value::Atom(resolve_atom(atom, modules)?),
            None => Value::string(s),
        },
        Json::Array(items) => Value::tuple(
            items
                .iter()
                .map(|item| json_to_value(item, specials, modules))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(entries) => Value::map(
            entries
                .iter()
                .map(|(key, value)| {
                    Ok((Value::string(key), json_to_value(value, specials, modules)?))
                })
                .collect::<Result<Vec<_>, CliError>>()?,
        ),
    })
}

fn resolve_atom(reference: &str, modules: &ModuleRegistry) -> Result<AtomRef, CliError> {
    match reference.split_once('.') {
        Some((module, name)) => modules
            .resolve_atom(module, name)
            .ok_or_else(|| CliError::Encode(format!("unknown module '{}'", module))),
        None => Ok(AtomRef::new(reference, None)),
    }
}

// ---------------------------------------------------------------------------
// config / init
// ---------------------------------------------------------------------------

pub fn cmd_config(config: &KestrelConfig) -> Result<String, CliError> {
    Ok(toml::to_string_pretty(config)?)
}

pub fn cmd_init(dir: &Path) -> Result<std::path::PathBuf, CliError> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        return Err(CliError::AlreadyExists(path));
    }
    std::fs::write(&path, KestrelConfig::default_template()).map_err(CliError::io(&path))?;
    Ok(path)
}
