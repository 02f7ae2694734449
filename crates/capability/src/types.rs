//! Value types crossing the capability boundary

use serde::{Deserialize, Serialize};

/// Source product content handed to the enhancer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductDraft {
    pub title: String,
    pub body_html: String,
    pub product_type: String,
    pub vendor: String,
    pub tags: Vec<String>,
}

/// Enhancement result. Every field is optional; missing ones fall back to
/// the source product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancedFields {
    pub title: Option<String>,
    pub handle: Option<String>,
    pub body_html: Option<String>,
    pub tags: Option<Vec<String>>,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
}

/// Which edited image to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariation {
    /// Clean front view
    Main,
    /// Top-down angled view
    Angle,
}

impl ImageVariation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariation::Main => "main",
            ImageVariation::Angle => "angle",
        }
    }
}

/// A product as submitted to the destination store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub handle: String,
    pub body_html: String,
    pub product_type: String,
    pub vendor: String,
    pub tags: Vec<String>,
    pub seo_title: String,
    pub seo_description: String,
    /// Option names in position order ("Size", "Color", ...)
    pub options: Vec<String>,
    pub variants: Vec<ListingVariant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingVariant {
    pub option1: String,
    pub option2: Option<String>,
    pub option3: Option<String>,
    /// Decimal string with two fraction digits, e.g. "19.90"
    pub price: String,
    pub compare_at_price: Option<String>,
    pub sku: String,
    pub barcode: String,
    pub requires_shipping: bool,
    pub taxable: bool,
}

/// Format a price the way store APIs expect it.
pub fn format_price(value: f64) -> String {
    format!("{value:.2}")
}

/// A product as it exists in the destination store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteProduct {
    pub id: String,
    pub variants: Vec<RemoteVariant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteVariant {
    pub id: String,
    pub inventory_item_id: Option<String>,
}
