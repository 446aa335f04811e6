//! Core domain model for gumsync: entries, the in-memory index and the product mapper.

use std::collections::btree_map::{self, BTreeMap};

pub use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gumsync-core";

/// Cover used when the storefront has no preview image for a product.
pub const FALLBACK_COVER_URL: &str = "https://assets-global.website-files.com/6171b265e5c8aa59b42c3472/6195275a9e5f4655891de886_gum-coins.svg";

/// Raw product record as returned by the storefront list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorefrontProduct {
    pub id: String,
    pub name: String,
    /// Minor units (cents).
    pub price: i64,
    #[serde(default)]
    pub sales_count: u64,
    /// Minor units (cents).
    #[serde(default)]
    pub sales_usd_cents: i64,
    pub short_url: String,
    #[serde(default)]
    pub preview_url: Option<String>,
}

/// One storefront product mirrored as one knowledge-base row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub external_id: String,
    pub internal_row_id: Option<String>,
    pub name: String,
    pub price: Decimal,
    pub sales_count: u64,
    pub revenue: Decimal,
    pub link: String,
    pub cover_image_url: String,
}

/// In-memory mapping of external product id to entry.
///
/// Row ids are only ever recorded against the key whose entry was written, so an
/// entry can never carry the row id of a different product.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    entries: BTreeMap<String, Entry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry read from the knowledge base, returning any entry it displaced.
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.external_id.clone(), entry)
    }

    /// Replace the tracked fields for a freshly mapped entry.
    ///
    /// A known row id survives even if the incoming entry does not carry one.
    pub fn apply_mapped(&mut self, mut entry: Entry) {
        if entry.internal_row_id.is_none() {
            entry.internal_row_id = self.row_id(&entry.external_id).map(ToString::to_string);
        }
        self.entries.insert(entry.external_id.clone(), entry);
    }

    /// Store the row id returned by an upsert. Returns false for unknown keys.
    pub fn record_row_id(&mut self, external_id: &str, row_id: String) -> bool {
        match self.entries.get_mut(external_id) {
            Some(entry) => {
                entry.internal_row_id = Some(row_id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&Entry> {
        self.entries.get(external_id)
    }

    pub fn row_id(&self, external_id: &str) -> Option<&str> {
        self.entries
            .get(external_id)
            .and_then(|e| e.internal_row_id.as_deref())
    }

    pub fn external_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, Entry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<Entry> for Index {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut index = Index::new();
        for entry in iter {
            index.insert(entry);
        }
        index
    }
}

/// Exact major-unit amount for a minor-unit (cents) value.
pub fn cents_to_major(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Normalize a storefront product into an entry, keeping the row id already known for it.
pub fn map_product(product: &StorefrontProduct, index: &Index) -> Entry {
    let cover_image_url = product
        .preview_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .unwrap_or(FALLBACK_COVER_URL)
        .to_string();

    Entry {
        external_id: product.id.clone(),
        internal_row_id: index.row_id(&product.id).map(ToString::to_string),
        name: product.name.clone(),
        price: cents_to_major(product.price),
        sales_count: product.sales_count,
        revenue: cents_to_major(product.sales_usd_cents),
        link: product.short_url.clone(),
        cover_image_url,
    }
}
