use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stand-in for absent or blank identifying fields.
pub const EMPTY_FIELD: &str = "-";

/// Identifying fields of an order-risk lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestKeyParams {
    pub checkout_token: Option<String>,
    pub email: Option<String>,
    pub order_id: Option<String>,
    pub order_name: Option<String>,
    pub phone: Option<String>,
}

impl RequestKeyParams {
    pub fn fields(&self) -> [(&str, Option<&str>); 5] {
        [
            ("checkout_token", self.checkout_token.as_deref()),
            ("email", self.email.as_deref()),
            ("order_id", self.order_id.as_deref()),
            ("order_name", self.order_name.as_deref()),
            ("phone", self.phone.as_deref()),
        ]
    }
}

/// Dedup/cache key for an order-risk lookup.
pub fn generate_request_key(params: &RequestKeyParams) -> String {
    canonical_key("order-data", params.fields())
}

/// Deterministic key from named fields: sorted by name, values trimmed,
/// absent and blank values collapsed to [`EMPTY_FIELD`].
///
/// Separators and `-` inside values are percent-escaped, so distinct field
/// sets never share a key and no real value renders as [`EMPTY_FIELD`].
/// A field repeated with different values keeps the last non-blank one.
pub fn canonical_key<'a, I>(namespace: &str, fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut sorted: BTreeMap<&str, Option<&str>> = BTreeMap::new();
    for (name, value) in fields {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        match value {
            Some(value) => {
                sorted.insert(name, Some(value));
            }
            None => {
                sorted.entry(name).or_insert(None);
            }
        }
    }

    let mut key = String::from(namespace);
    for (name, value) in sorted {
        key.push(':');
        key.push_str(name);
        key.push('=');
        match value {
            Some(value) => push_escaped(&mut key, value),
            None => key.push_str(EMPTY_FIELD),
        }
    }
    key
}

fn push_escaped(key: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '%' => key.push_str("%25"),
            '-' => key.push_str("%2D"),
            ':' => key.push_str("%3A"),
            '=' => key.push_str("%3D"),
            c => key.push(c),
        }
    }
}
