//! Loading scraped products from a JSON file

use std::path::Path;

use engine::SourceProduct;

use crate::error::{Error, Result};

/// Read a JSON array of products and assign them to `source_ref`.
///
/// Products that already name a batch keep it. Ids must be unique within the
/// file; a repeated id would silently overwrite the earlier product.
pub fn read_products(path: &Path, source_ref: &str) -> Result<Vec<SourceProduct>> {
    let import_error = |reason: String| Error::Import {
        path: path.to_path_buf(),
        reason,
    };
    let contents = std::fs::read_to_string(path).map_err(|e| import_error(e.to_string()))?;
    let mut products: Vec<SourceProduct> =
        serde_json::from_str(&contents).map_err(|e| import_error(e.to_string()))?;

    let mut seen = std::collections::HashSet::new();
    for product in &mut products {
        if !seen.insert(product.id) {
            return Err(import_error(format!("duplicate product id {}", product.id)));
        }
        if product.source_ref.is_empty() {
            product.source_ref = source_ref.to_string();
        }
    }
    Ok(products)
}
