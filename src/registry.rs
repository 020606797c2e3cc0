//! Immutable command dictionary.
//!
//! A [`CommandRegistry`] is built once at startup from the CSV loader and
//! is read-only afterwards; lookups hand out `Arc` clones of the
//! definitions so the codec and engine never copy field lists.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transfer direction of a command on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
    Broadcast,
}

/// Closed set of field encoding rules, resolved at load time. No runtime
/// type dispatch remains in the decode path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Encoding {
    /// Little-endian unsigned integer of `width` bytes, decoded as
    /// `raw * factor + offset`.
    Numeric { width: u8, factor: f64, offset: f64 },
    /// Single byte mapped through a value table.
    Enum { table: Vec<(u8, String)> },
    /// Fixed-width ASCII, right-padded with spaces.
    Text { len: u8 },
}

impl Encoding {
    /// Number of payload bytes this field occupies.
    pub fn width(&self) -> usize {
        match self {
            Encoding::Numeric { width, .. } => *width as usize,
            Encoding::Enum { .. } => 1,
            Encoding::Text { len } => *len as usize,
        }
    }
}

/// One named field in a parameter or reply layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub encoding: Encoding,
}

/// One entry of the command dictionary. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    /// Unique identifier, e.g. `OUTSIDE_TEMP`.
    pub name: String,
    /// Source device class, e.g. `boiler` or `controller`.
    pub class: String,
    pub direction: Direction,
    /// Destination bus address.
    pub dst: u8,
    /// Primary command byte.
    pub primary: u8,
    /// Secondary command byte.
    pub secondary: u8,
    pub params: Vec<FieldDef>,
    pub replies: Vec<FieldDef>,
    /// Cyclic poll interval in seconds; 0 disables polling.
    pub poll_interval_s: u32,
}

impl CommandDefinition {
    /// Total declared width of the reply payload.
    pub fn reply_width(&self) -> usize {
        self.replies.iter().map(|f| f.encoding.width()).sum()
    }

    pub fn is_cyclic(&self) -> bool {
        self.poll_interval_s > 0
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Decoded reply fields in declaration order.
pub type ReplyValues = Vec<(String, Value)>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command set is empty")]
    Empty,
    #[error("duplicate command identifier: {0}")]
    Duplicate(String),
}

/// Lookup-by-name map of command definitions. Safe for unsynchronized
/// concurrent reads from any number of threads.
#[derive(Debug)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<CommandDefinition>>,
}

impl CommandRegistry {
    /// Builds the registry, rejecting empty or duplicate-bearing input.
    /// Both are configuration errors the process must not start with.
    pub fn from_definitions(
        definitions: Vec<CommandDefinition>,
    ) -> Result<Self, RegistryError> {
        if definitions.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut commands = HashMap::with_capacity(definitions.len());
        for def in definitions {
            let name = def.name.clone();
            if commands.insert(name.clone(), Arc::new(def)).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }
        Ok(Self { commands })
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<CommandDefinition>> {
        self.commands.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CommandDefinition>> {
        self.commands.values()
    }

    /// Definitions with a non-zero poll interval, for the cyclic scheduler.
    pub fn cyclic_entries(&self) -> Vec<Arc<CommandDefinition>> {
        let mut entries: Vec<_> = self
            .commands
            .values()
            .filter(|d| d.is_cyclic())
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::numeric_read;
    use super::*;

    #[test]
    fn test_empty_registry_rejected() {
        let result = CommandRegistry::from_definitions(vec![]);
        assert_eq!(result.unwrap_err(), RegistryError::Empty);
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let defs = vec![
            numeric_read("OUTSIDE_TEMP", 0.1, 0),
            numeric_read("OUTSIDE_TEMP", 0.5, 0),
        ];
        let result = CommandRegistry::from_definitions(defs);
        assert_eq!(
            result.unwrap_err(),
            RegistryError::Duplicate("OUTSIDE_TEMP".to_string())
        );
    }

    #[test]
    fn test_lookup_shares_definition() {
        let registry =
            CommandRegistry::from_definitions(vec![numeric_read("OUTSIDE_TEMP", 0.1, 0)])
                .unwrap();
        let a = registry.lookup("OUTSIDE_TEMP").unwrap();
        let b = registry.lookup("OUTSIDE_TEMP").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.lookup("BOILER_STATUS").is_none());
    }

    #[test]
    fn test_reply_width_sums_field_widths() {
        let mut def = numeric_read("OUTSIDE_TEMP", 0.1, 0);
        assert_eq!(def.reply_width(), 2);

        def.replies.push(FieldDef {
            name: "unit".to_string(),
            encoding: Encoding::Text { len: 4 },
        });
        assert_eq!(def.reply_width(), 6);
    }

    #[test]
    fn test_cyclic_entries_filtered_and_ordered() {
        let registry = CommandRegistry::from_definitions(vec![
            numeric_read("ZULU", 0.1, 30),
            numeric_read("ALPHA", 0.1, 10),
            numeric_read("STATIC", 0.1, 0),
        ])
        .unwrap();
        let cyclic = registry.cyclic_entries();
        let names: Vec<_> = cyclic.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["ALPHA", "ZULU"]);
    }
}
