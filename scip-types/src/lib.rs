use serde::{Deserialize, Serialize};

// A decoded SCIP index: the metadata of one indexing run plus its documents.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Index {
    pub metadata: Metadata,
    #[serde(default)]
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub tool_info: ToolInfo,
    #[serde(default)]
    pub project_root: String,
    #[serde(default)]
    pub text_document_encoding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Document {
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub symbols: Vec<SymbolInformation>,
    #[serde(default)]
    pub occurrences: Vec<Occurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SymbolInformation {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documentation: Vec<String>,
}

impl SymbolInformation {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            documentation: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Occurrence {
    pub range: Vec<i32>,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub symbol_roles: i32,
}

impl Occurrence {
    pub fn new(range: Vec<i32>, symbol: impl Into<String>, symbol_roles: i32) -> Self {
        Self {
            range,
            symbol: symbol.into(),
            symbol_roles,
        }
    }

    /// Expands the range into `[start_line, start_character, end_line, end_character]`.
    ///
    /// SCIP encodes single-line ranges with three elements; anything other than
    /// three or four elements is malformed and yields `None`.
    pub fn full_range(&self) -> Option<[i32; 4]> {
        match self.range.as_slice() {
            &[line, start, end] => Some([line, start, line, end]),
            &[start_line, start, end_line, end] => Some([start_line, start, end_line, end]),
            _ => None,
        }
    }

    pub fn has_role(&self, role: SymbolRole) -> bool {
        self.symbol_roles & role.bit() != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SymbolRole {
    Definition = 0x1,
    Import = 0x2,
    WriteAccess = 0x4,
    ReadAccess = 0x8,
    Generated = 0x10,
    Test = 0x20,
    ForwardDefinition = 0x40,
}

impl SymbolRole {
    pub const fn bit(self) -> i32 {
        self as i32
    }
}
