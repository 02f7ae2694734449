//! Source validation and listing assembly

use std::collections::HashSet;

use capability::{EnhancedFields, Listing, ListingVariant, ProductDraft, format_price};
use tracing::warn;

use crate::model::{SourceImage, SourceProduct, SourceVariant};

/// Variant titles that scrapers pick up from "please choose" dropdown entries.
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "please select",
    "select option",
    "choose",
    "select size",
    "select color",
    "select variant",
    "default title",
];

/// Whether a variant is a dropdown placeholder rather than a real option.
pub fn is_placeholder(variant: &SourceVariant) -> bool {
    let title = variant.title.to_lowercase();
    let option1 = variant.option1.as_deref().unwrap_or_default().to_lowercase();
    PLACEHOLDER_PATTERNS
        .iter()
        .any(|pattern| title.contains(pattern) || option1.contains(pattern))
}

pub fn is_valid_variant(variant: &SourceVariant) -> bool {
    !is_placeholder(variant) && variant.price > 0.0
}

pub fn valid_variants(product: &SourceProduct) -> Vec<&SourceVariant> {
    product.variants.iter().filter(|v| is_valid_variant(v)).collect()
}

/// Images with a non-blank URL, in position order.
pub fn usable_images(product: &SourceProduct) -> Vec<&SourceImage> {
    let mut images: Vec<&SourceImage> = product
        .images
        .iter()
        .filter(|image| !image.url.trim().is_empty())
        .collect();
    images.sort_by_key(|image| image.position);
    images
}

/// Option values for a variant.
///
/// Scraped variants often carry `Default` (or nothing) in `option1` with the
/// real values packed into the title as `A / B / C`.
pub fn option_values(variant: &SourceVariant) -> (String, Option<String>, Option<String>) {
    let non_blank = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut option1 = non_blank(&variant.option1).filter(|v| v != "Default");
    let mut option2 = non_blank(&variant.option2);
    let mut option3 = non_blank(&variant.option3);

    if option1.is_none() && !variant.title.trim().is_empty() {
        let mut parts = variant
            .title
            .split('/')
            .map(str::trim)
            .filter(|part| !part.is_empty());
        option1 = parts.next().map(str::to_string);
        if let Some(part) = parts.next() {
            option2 = Some(part.to_string());
        }
        if let Some(part) = parts.next() {
            option3 = Some(part.to_string());
        }
    }

    let option1 = option1.unwrap_or_else(|| {
        if variant.title.trim().is_empty() {
            "Default".to_string()
        } else {
            variant.title.clone()
        }
    });
    (option1, option2, option3)
}

/// Draft handed to the content enhancer.
pub fn draft(product: &SourceProduct) -> ProductDraft {
    ProductDraft {
        title: product.title.clone(),
        body_html: product.body_html.clone(),
        product_type: product.product_type.clone(),
        vendor: product.vendor.clone(),
        tags: product.tags.clone(),
    }
}

/// Context string for image edits (the product's title and type).
pub fn image_context(product: &SourceProduct) -> String {
    if product.product_type.is_empty() {
        product.title.clone()
    } else {
        format!("{} ({})", product.title, product.product_type)
    }
}

/// URL-safe handle derived from a title.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Assemble the listing to publish from a source product and the enhancer's
/// output.
///
/// Fields the enhancer left unset fall back to the source. Only valid
/// variants are carried, deduplicated by option tuple (first wins). Listings
/// never enable inventory management.
pub fn build_listing(product: &SourceProduct, fields: &EnhancedFields) -> Listing {
    let title = fields
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| product.title.clone());
    let handle = fields
        .handle
        .clone()
        .or_else(|| product.handle.clone())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| slugify(&title));

    let mut seen = HashSet::new();
    let mut variants = Vec::new();
    for variant in valid_variants(product) {
        let (option1, option2, option3) = option_values(variant);
        if !seen.insert((option1.clone(), option2.clone(), option3.clone())) {
            warn!(
                product_id = product.id,
                variant = %variant.title,
                "dropping duplicate variant"
            );
            continue;
        }
        variants.push(ListingVariant {
            option1,
            option2,
            option3,
            price: format_price(variant.price),
            compare_at_price: variant.compare_at_price.map(format_price),
            sku: variant.sku.clone(),
            barcode: variant.barcode.clone(),
            requires_shipping: variant.requires_shipping,
            taxable: variant.taxable,
        });
    }

    Listing {
        seo_title: fields
            .seo_title
            .clone()
            .or_else(|| product.seo_title.clone())
            .unwrap_or_else(|| title.clone()),
        seo_description: fields
            .seo_description
            .clone()
            .or_else(|| product.seo_description.clone())
            .unwrap_or_default(),
        body_html: fields
            .body_html
            .clone()
            .unwrap_or_else(|| product.body_html.clone()),
        tags: fields.tags.clone().unwrap_or_else(|| product.tags.clone()),
        product_type: product.product_type.clone(),
        vendor: product.vendor.clone(),
        options: option_names(&variants),
        variants,
        title,
        handle,
    }
}

/// Option names for the positions the variants use.
fn option_names(variants: &[ListingVariant]) -> Vec<String> {
    let mut names = Vec::new();
    if variants.iter().any(|v| !v.option1.is_empty()) {
        names.push("Option 1".to_string());
    }
    if variants.iter().any(|v| v.option2.is_some()) {
        names.push("Option 2".to_string());
    }
    if variants.iter().any(|v| v.option3.is_some()) {
        names.push("Option 3".to_string());
    }
    if names.is_empty() {
        names.push("Title".to_string());
    }
    names
}
