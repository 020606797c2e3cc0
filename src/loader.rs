//! CSV command-definition loader.
//!
//! The daemon loads every `*.csv` file in its configuration directory at
//! startup. One row per command:
//!
//! ```text
//! class,name,direction,dest,pb,sb,poll_interval_s,params,replies
//! boiler,OUTSIDE_TEMP,read,08,b5,09,0,,value:num:2:0.1:0
//! ```
//!
//! `params` and `replies` are `;`-separated field specs of the form
//! `name:kind:width[:factor:offset]` for `num`, `name:enum:1:k=v|k=v…`
//! for `enum` and `name:text:len` for `text`. Addresses and command
//! bytes are hexadecimal. Lines starting with `#` are comments. A
//! malformed row fails the whole load; the daemon must not start on a
//! half-usable dictionary.

use crate::frame::MAX_PAYLOAD;
use crate::registry::{
    CommandDefinition, CommandRegistry, Direction, Encoding, FieldDef, RegistryError,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Row {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Loads all `*.csv` files under `dir` into a registry. Files are read
/// in name order so duplicate reporting is deterministic.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<CommandRegistry, LoadError> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();

    let mut definitions = Vec::new();
    for path in &files {
        load_file(path, &mut definitions)?;
    }
    let registry = CommandRegistry::from_definitions(definitions)?;
    info!(
        files = files.len(),
        commands = registry.len(),
        "command definitions loaded"
    );
    Ok(registry)
}

fn load_file(path: &Path, out: &mut Vec<CommandDefinition>) -> Result<(), LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(false)
        .from_path(path)
        .map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    for record in reader.records() {
        let record = record.map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record.position().map_or(0, |p| p.line());
        let row_err = |reason: String| LoadError::Row {
            path: path.to_path_buf(),
            line,
            reason,
        };

        if record.len() != 9 {
            return Err(row_err(format!("expected 9 columns, got {}", record.len())));
        }

        let def = parse_row(&record).map_err(row_err)?;
        out.push(def);
    }
    Ok(())
}

fn parse_row(record: &csv::StringRecord) -> Result<CommandDefinition, String> {
    let class = record[0].to_string();
    let name = record[1].to_string();
    if name.is_empty() {
        return Err("empty command name".to_string());
    }

    let direction = match &record[2] {
        "read" => Direction::Read,
        "write" => Direction::Write,
        "broadcast" => Direction::Broadcast,
        other => return Err(format!("unknown direction '{}'", other)),
    };

    let dst = parse_hex(&record[3], "dest")?;
    let primary = parse_hex(&record[4], "pb")?;
    let secondary = parse_hex(&record[5], "sb")?;

    let poll_interval_s: u32 = record[6]
        .parse()
        .map_err(|_| format!("invalid poll interval '{}'", &record[6]))?;

    let params = parse_fields(&record[7])?;
    let replies = parse_fields(&record[8])?;

    let def = CommandDefinition {
        name,
        class,
        direction,
        dst,
        primary,
        secondary,
        params,
        replies,
        poll_interval_s,
    };

    let param_width: usize = def.params.iter().map(|f| f.encoding.width()).sum();
    if param_width > MAX_PAYLOAD {
        return Err(format!(
            "parameter fields span {} bytes, limit is {}",
            param_width, MAX_PAYLOAD
        ));
    }
    if def.reply_width() > MAX_PAYLOAD {
        return Err(format!(
            "reply fields span {} bytes, limit is {}",
            def.reply_width(),
            MAX_PAYLOAD
        ));
    }

    if def.direction == Direction::Broadcast && !def.replies.is_empty() {
        return Err("broadcast commands cannot declare reply fields".to_string());
    }
    if def.is_cyclic() && def.direction != Direction::Read {
        return Err("only read commands can be polled".to_string());
    }
    if def.is_cyclic() && !def.params.is_empty() {
        return Err("polled commands cannot declare parameter fields".to_string());
    }

    Ok(def)
}

fn parse_hex(text: &str, what: &str) -> Result<u8, String> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u8::from_str_radix(digits, 16).map_err(|_| format!("invalid hex {} '{}'", what, text))
}

fn parse_fields(cell: &str) -> Result<Vec<FieldDef>, String> {
    if cell.is_empty() {
        return Ok(Vec::new());
    }
    cell.split(';').map(parse_field).collect()
}

fn parse_field(spec: &str) -> Result<FieldDef, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts[0].is_empty() {
        return Err(format!("malformed field spec '{}'", spec));
    }
    let name = parts[0].to_string();

    let encoding = match parts[1] {
        "num" => {
            let width: u8 = parts[2]
                .parse()
                .map_err(|_| format!("invalid width in '{}'", spec))?;
            if !(1..=4).contains(&width) {
                return Err(format!("numeric width must be 1-4 in '{}'", spec));
            }
            let (factor, offset) = match parts.len() {
                3 => (1.0, 0.0),
                5 => {
                    let factor: f64 = parts[3]
                        .parse()
                        .map_err(|_| format!("invalid factor in '{}'", spec))?;
                    if factor == 0.0 {
                        return Err(format!("zero factor in '{}'", spec));
                    }
                    let offset: f64 = parts[4]
                        .parse()
                        .map_err(|_| format!("invalid offset in '{}'", spec))?;
                    (factor, offset)
                }
                _ => return Err(format!("malformed numeric spec '{}'", spec)),
            };
            Encoding::Numeric {
                width,
                factor,
                offset,
            }
        }
        "enum" => {
            if parts[2] != "1" {
                return Err(format!("enum width must be 1 in '{}'", spec));
            }
            if parts.len() != 4 {
                return Err(format!("enum spec '{}' is missing its value table", spec));
            }
            let mut table = Vec::new();
            for pair in parts[3].split('|') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("malformed enum pair '{}' in '{}'", pair, spec))?;
                let key: u8 = key
                    .parse()
                    .map_err(|_| format!("invalid enum key '{}' in '{}'", key, spec))?;
                if value.is_empty() || table.iter().any(|(k, _)| *k == key) {
                    return Err(format!("bad enum pair '{}' in '{}'", pair, spec));
                }
                table.push((key, value.to_string()));
            }
            Encoding::Enum { table }
        }
        "text" => {
            if parts.len() != 3 {
                return Err(format!("malformed text spec '{}'", spec));
            }
            let len: u8 = parts[2]
                .parse()
                .map_err(|_| format!("invalid length in '{}'", spec))?;
            if len == 0 || len as usize > MAX_PAYLOAD {
                return Err(format!("text length out of range in '{}'", spec));
            }
            Encoding::Text { len }
        }
        other => return Err(format!("unknown field kind '{}'", other)),
    };

    Ok(FieldDef { name, encoding })
}
