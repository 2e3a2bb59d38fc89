//! Core domain model for shelfwatch: catalog snapshot entries, variant
//! sizes, quantities, and the persisted cascade state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "shelfwatch-core";

/// Unit a variant size or remaining quantity is measured in. Catalog
/// taxonomies grow over time, so unrecognized unit labels are carried
/// through opaquely instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SizeUnit {
    Grams,
    Units,
    Other(String),
}

impl SizeUnit {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "g" | "gram" | "grams" => SizeUnit::Grams,
            "" | "u" | "unit" | "units" => SizeUnit::Units,
            other => SizeUnit::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SizeUnit::Grams => "g",
            SizeUnit::Units => "u",
            SizeUnit::Other(label) => label,
        }
    }
}

/// A variant size as an explicit `(magnitude, unit)` pair rather than an ad
/// hoc string key, so ordering and formatting never depend on string
/// conventions. Sorts by magnitude first, which gives ascending-size
/// iteration over a `BTreeMap` keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VariantSize {
    pub magnitude: Decimal,
    pub unit: SizeUnit,
}

impl VariantSize {
    pub fn new(magnitude: Decimal, unit: SizeUnit) -> Self {
        Self { magnitude, unit }
    }

    pub fn grams(magnitude: Decimal) -> Self {
        Self::new(magnitude, SizeUnit::Grams)
    }
}

impl fmt::Display for VariantSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude.normalize(), self.unit.label())
    }
}

impl FromStr for VariantSize {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(trimmed.len());
        let (number, label) = trimmed.split_at(split);
        let magnitude = Decimal::from_str(number)
            .map_err(|err| format!("invalid size magnitude in {trimmed:?}: {err}"))?;
        Ok(Self::new(magnitude, SizeUnit::from_label(label)))
    }
}

impl From<VariantSize> for String {
    fn from(size: VariantSize) -> String {
        size.to_string()
    }
}

impl TryFrom<String> for VariantSize {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

/// Price and remaining availability for one offered variant size. Either
/// field may be absent in raw catalog data; the cascade decides whether
/// that is tolerable per use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantOffer {
    pub price_cents: Option<i64>,
    pub availability: Option<i64>,
}

/// Composite natural key for a product. `sku` is not part of the key; it is
/// an opaque secondary identifier not guaranteed stable across duplicates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub brand: String,
    pub name: String,
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by {}", self.name, self.brand)
    }
}

/// One product's observed state at one capture timestamp. Created by the
/// external ingestion step, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshotEntry {
    pub timestamp: i64,
    pub sku: String,
    pub brand: String,
    pub name: String,
    pub url: String,
    pub image: Option<String>,
    pub price_cents: Option<i64>,
    pub standalone_price_cents: Option<i64>,
    pub standalone_availability: Option<i64>,
    pub variants: BTreeMap<VariantSize, VariantOffer>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub plant_type: Option<String>,
    pub thc_range: Option<(Decimal, Decimal)>,
    pub cbd_range: Option<(Decimal, Decimal)>,
    pub terpenes: Vec<String>,
}

impl ProductSnapshotEntry {
    pub fn key(&self) -> ProductKey {
        ProductKey {
            brand: self.brand.clone(),
            name: self.name.clone(),
        }
    }

    /// Total remaining quantity: size-weighted variant availability plus any
    /// standalone unit count. The displayed unit follows the tracking shape;
    /// grams and discrete units are never conflated.
    pub fn combined_total(&self) -> Quantity {
        let mut amount = Decimal::ZERO;
        for (size, offer) in &self.variants {
            if let Some(availability) = offer.availability {
                amount += size.magnitude * Decimal::from(availability);
            }
        }
        if let Some(count) = self.standalone_availability {
            amount += Decimal::from(count);
        }
        let unit = if self.variants.is_empty() {
            SizeUnit::Units
        } else {
            SizeUnit::Grams
        };
        Quantity { amount, unit }
    }

    pub fn normalized_image(&self) -> Option<String> {
        self.image.as_deref().map(normalize_image_url)
    }
}

/// A remaining-quantity measurement with its unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: Decimal,
    pub unit: SizeUnit,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = self.amount.normalize();
        match &self.unit {
            SizeUnit::Grams => write!(f, "{amount}g"),
            SizeUnit::Units => write!(f, "{amount} units"),
            SizeUnit::Other(label) => write!(f, "{amount} {label}"),
        }
    }
}

/// One row of the fine-grained availability series. Summing
/// `size * availability` over the rows sharing `(timestamp, brand, name)`
/// yields that product's total remaining grams at that timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub timestamp: i64,
    pub brand: String,
    pub name: String,
    pub size: Decimal,
    pub availability: i64,
    pub price_cents: Option<i64>,
}

/// The single mutable record driving cascade behavior across invocations.
/// Read once per invocation and written back whole; never partially updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Most recent snapshot timestamp already fully processed. Monotonically
    /// non-decreasing; never points at a timestamp without a snapshot.
    pub last_timestamp: i64,
    /// SKU -> unix time of the last low-stock notification for that SKU.
    /// Entries are only ever updated, never deleted.
    pub low_stock_updates: BTreeMap<String, i64>,
    /// Fact name -> unix time that fact was last computed.
    pub fun_facts: BTreeMap<String, i64>,
}

/// One outgoing notification: message text plus an optional image URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub text: String,
    pub image: Option<String>,
}

/// Rewrites protocol-relative image URLs to an explicit https scheme.
pub fn normalize_image_url(raw: &str) -> String {
    if raw.starts_with("http") {
        raw.to_string()
    } else {
        format!("https:{raw}")
    }
}

/// Formats a cent amount as a two-decimal dollar string.
pub fn format_cents(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry_with_variants(variants: &[(Decimal, i64)]) -> ProductSnapshotEntry {
        ProductSnapshotEntry {
            timestamp: 100,
            sku: "sku-1".into(),
            brand: "Acme".into(),
            name: "Widget".into(),
            url: "/products/widget".into(),
            image: None,
            price_cents: None,
            standalone_price_cents: None,
            standalone_availability: None,
            variants: variants
                .iter()
                .map(|(size, availability)| {
                    (
                        VariantSize::grams(*size),
                        VariantOffer {
                            price_cents: Some(1000),
                            availability: Some(*availability),
                        },
                    )
                })
                .collect(),
            description: None,
            category: None,
            plant_type: None,
            thc_range: None,
            cbd_range: None,
            terpenes: vec![],
        }
    }

    #[test]
    fn variant_sizes_sort_numerically_not_lexically() {
        let mut sizes = vec![
            VariantSize::grams(dec!(15)),
            VariantSize::grams(dec!(3.5)),
            VariantSize::grams(dec!(0.5)),
            VariantSize::grams(dec!(1)),
        ];
        sizes.sort();
        let rendered: Vec<String> = sizes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["0.5g", "1g", "3.5g", "15g"]);
    }

    #[test]
    fn variant_size_round_trips_through_string() {
        let size: VariantSize = "3.5g".parse().unwrap();
        assert_eq!(size.magnitude, dec!(3.5));
        assert_eq!(size.unit, SizeUnit::Grams);
        assert_eq!(size.to_string(), "3.5g");

        let unknown: VariantSize = "2pack".parse().unwrap();
        assert_eq!(unknown.unit, SizeUnit::Other("pack".into()));
        assert_eq!(unknown.to_string(), "2pack");

        assert!("g".parse::<VariantSize>().is_err());
    }

    #[test]
    fn entry_serializes_variant_keys_as_strings() {
        let entry = entry_with_variants(&[(dec!(3.5), 4)]);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"3.5g\""));
        let back: ProductSnapshotEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn combined_total_weights_variant_sizes() {
        let entry = entry_with_variants(&[(dec!(3.5), 4), (dec!(1), 6)]);
        let total = entry.combined_total();
        assert_eq!(total.amount, dec!(20));
        assert_eq!(total.unit, SizeUnit::Grams);
        assert_eq!(total.to_string(), "20g");
    }

    #[test]
    fn combined_total_uses_units_for_standalone_tracking() {
        let mut entry = entry_with_variants(&[]);
        entry.standalone_availability = Some(5);
        let total = entry.combined_total();
        assert_eq!(total.amount, dec!(5));
        assert_eq!(total.unit, SizeUnit::Units);
        assert_eq!(total.to_string(), "5 units");
    }

    #[test]
    fn protocol_relative_images_get_a_scheme() {
        assert_eq!(
            normalize_image_url("//cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
        assert_eq!(
            normalize_image_url("https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
    }

    #[test]
    fn cents_format_as_two_decimal_dollars() {
        assert_eq!(format_cents(2500), "$25.00");
        assert_eq!(format_cents(905), "$9.05");
        assert_eq!(format_cents(40), "$0.40");
    }
}
