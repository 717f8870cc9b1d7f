//! Result handles delivered by the wire codec.
//!
//! The codec itself lives outside this crate; its contract is that a
//! metadata query resolves to a set of named-column rows covering the
//! handful of value shapes the system tables use.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;

/// A column value as the codec hands it over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CqlValue {
    Text(String),
    Inet(IpAddr),
    /// Token lists and function argument-type lists.
    TextList(Vec<String>),
    /// An undecoded value; inets arrive like this from some codecs.
    Blob(Bytes),
    Null,
}

impl CqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CqlValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Decodes the value as an inet address. Blobs must carry exactly a
    /// 4-byte IPv4 or 16-byte IPv6 body; anything else is a decode failure.
    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            CqlValue::Inet(ip) => Some(*ip),
            CqlValue::Blob(bytes) => match bytes.len() {
                4 => <[u8; 4]>::try_from(bytes.as_ref()).ok().map(IpAddr::from),
                16 => <[u8; 16]>::try_from(bytes.as_ref()).ok().map(IpAddr::from),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            CqlValue::TextList(items) => Some(items),
            _ => None,
        }
    }
}

/// One result row, columns accessible by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: HashMap<String, CqlValue>,
}

impl Row {
    pub fn get(&self, name: &str) -> Option<&CqlValue> {
        self.columns.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(CqlValue::as_text)
    }

    pub fn inet(&self, name: &str) -> Option<IpAddr> {
        self.get(name).and_then(CqlValue::as_inet)
    }

    pub fn text_list(&self, name: &str) -> Option<&[String]> {
        self.get(name).and_then(CqlValue::as_text_list)
    }
}

impl<N: Into<String>> FromIterator<(N, CqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (N, CqlValue)>>(iter: I) -> Self {
        Row {
            columns: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }
}

/// The rows of one RESULT response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultRows {
    pub rows: Vec<Row>,
}

impl ResultRows {
    pub fn new(rows: Vec<Row>) -> Self {
        ResultRows { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A query to issue on the control socket: plain text, with bound values
/// only for the parameterized function/aggregate lookups.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub text: String,
    pub values: Vec<CqlValue>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Statement {
            text: text.into(),
            values: Vec::new(),
        }
    }

    pub fn with_values(text: impl Into<String>, values: Vec<CqlValue>) -> Self {
        Statement {
            text: text.into(),
            values,
        }
    }
}
