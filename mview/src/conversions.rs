//! Conversions from source items to view rows.

use source::types::{AttributeValue, Item};

use crate::bail;
use crate::error::{ErrorKind, ViewResult};
use crate::types::Row;

/// Extracts the row key of `item` from its `key_attribute`.
///
/// Fails with [`ErrorKind::MissingKeyAttribute`] when the attribute is absent or is neither a
/// string nor a number.
pub fn item_key(item: &Item, key_attribute: &str) -> ViewResult<String> {
    match item.get(key_attribute).and_then(AttributeValue::as_text) {
        Some(key) => Ok(key.to_owned()),
        None => bail!(
            ErrorKind::MissingKeyAttribute,
            "Item has no usable key attribute",
            format!("attribute `{key_attribute}` is missing or is not a string or number")
        ),
    }
}

/// Projects `item` onto `attributes`.
///
/// String and number attributes keep their text. Any other attribute type becomes an empty
/// string. Attributes missing from the item are left out of the row.
pub fn project_item(item: &Item, attributes: &[String]) -> Row {
    attributes
        .iter()
        .filter_map(|attribute| {
            let value = item.get(attribute)?;
            let text = value.as_text().unwrap_or_default();
            Some((attribute.clone(), text.to_owned()))
        })
        .collect()
}

/// Builds the key item addressing the row `key` in a table keyed by `key_attribute`.
///
/// The key is sent back with the attribute type it was received with.
pub fn key_item(keys: &Item, key_attribute: &str) -> Item {
    keys.iter()
        .filter(|(name, _)| name.as_str() == key_attribute)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
