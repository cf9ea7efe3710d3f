use std::fmt;

/// Payload published when no record matches the identifier.
pub const NO_DATA: &str = "No Data";

/// One inventory entry keyed by an externally assigned tag identifier.
///
/// Records are created by the seeding path before the relay starts; the
/// relay itself only reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub identifier: String,
    pub name: Option<String>,
    pub size: Option<String>,
    pub color: Option<String>,
    pub quantity: i64,
}

impl Record {
    pub fn new<S: Into<String>>(
        identifier: S,
        name: Option<&str>,
        size: Option<&str>,
        color: Option<&str>,
        quantity: i64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.map(str::to_owned),
            size: size.map(str::to_owned),
            color: color.map(str::to_owned),
            quantity,
        }
    }

    /// Colon-joined `name:size:color:quantity`. Missing attributes render empty.
    pub fn payload(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.name.as_deref().unwrap_or_default(),
            self.size.as_deref().unwrap_or_default(),
            self.color.as_deref().unwrap_or_default(),
            self.quantity
        )
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identifier, self.payload())
    }
}

/// Outcome of a point lookup. `NotFound` is an expected result, not a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Record),
    NotFound,
}

impl Lookup {
    /// Payload to publish for this outcome.
    pub fn payload(&self) -> String {
        match self {
            Lookup::Found(record) => record.payload(),
            Lookup::NotFound => NO_DATA.to_string(),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

impl From<Option<Record>> for Lookup {
    fn from(value: Option<Record>) -> Self {
        match value {
            Some(record) => Lookup::Found(record),
            None => Lookup::NotFound,
        }
    }
}
