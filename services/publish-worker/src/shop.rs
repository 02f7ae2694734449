//! Admin REST client for the destination store
//!
//! Speaks the Shopify-style `/admin/api/<version>/` surface: title lookup,
//! product create, image attach, and inventory tracking updates. Rate gating
//! happens in the engine; this client makes exactly one request per call.

use capability::{BoxFuture, CallError, CommercePublisher, Listing, RemoteProduct, RemoteVariant};
use common::Secret;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::http::{classify_generic, send_json};

const TOKEN_HEADER: &str = "X-Shopify-Access-Token";

pub struct ShopifyPublisher {
    http: Client,
    shop_url: String,
    base_url: String,
    token: Secret<String>,
}

#[derive(Debug, Deserialize)]
struct ProductsEnvelope {
    #[serde(default)]
    products: Vec<ShopProduct>,
}

#[derive(Debug, Deserialize)]
struct ProductEnvelope {
    product: Option<ShopProduct>,
}

#[derive(Debug, Deserialize)]
struct ShopProduct {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    variants: Vec<ShopVariant>,
}

#[derive(Debug, Deserialize)]
struct ShopVariant {
    id: u64,
    #[serde(default)]
    inventory_item_id: Option<u64>,
}

impl From<ShopProduct> for RemoteProduct {
    fn from(product: ShopProduct) -> Self {
        RemoteProduct {
            id: product.id.to_string(),
            variants: product
                .variants
                .into_iter()
                .map(|v| RemoteVariant {
                    id: v.id.to_string(),
                    inventory_item_id: v.inventory_item_id.map(|id| id.to_string()),
                })
                .collect(),
        }
    }
}

impl ShopifyPublisher {
    pub fn new(http: Client, shop_url: &str, api_version: &str, token: Secret<String>) -> Self {
        let shop_url = shop_url.trim_end_matches('/').to_string();
        let base_url = format!("{shop_url}/admin/api/{api_version}");
        Self {
            http,
            shop_url,
            base_url,
            token,
        }
    }

    fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(TOKEN_HEADER, self.token.expose().as_str())
    }
}

/// Store payload for a new product.
fn product_payload(listing: &Listing) -> Value {
    let variants: Vec<Value> = listing
        .variants
        .iter()
        .map(|v| {
            json!({
                "option1": v.option1,
                "option2": v.option2,
                "option3": v.option3,
                "price": v.price,
                "compare_at_price": v.compare_at_price,
                "sku": v.sku,
                "barcode": v.barcode,
                "requires_shipping": v.requires_shipping,
                "taxable": v.taxable,
                "inventory_management": Value::Null,
            })
        })
        .collect();
    let options: Vec<Value> = listing
        .options
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    json!({
        "product": {
            "title": listing.title,
            "handle": listing.handle,
            "body_html": listing.body_html,
            "vendor": listing.vendor,
            "product_type": listing.product_type,
            "tags": listing.tags.join(", "),
            "metafields_global_title_tag": listing.seo_title,
            "metafields_global_description_tag": listing.seo_description,
            "options": options,
            "variants": variants,
        }
    })
}

/// Image payload: `data:` URLs upload as a base64 attachment, anything else
/// is fetched by the store from `src`.
fn image_payload(image: &str) -> Result<Value, CallError> {
    if image.starts_with("data:") {
        let Some((_, data)) = image.split_once(',') else {
            return Err(CallError::permanent("invalid data URL: missing ','"));
        };
        return Ok(json!({ "image": { "attachment": data } }));
    }
    Ok(json!({ "image": { "src": image } }))
}

fn inventory_payload(inventory_item_id: &str) -> Value {
    let id = inventory_item_id
        .parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(inventory_item_id));
    json!({ "inventory_item": { "id": id, "tracked": false } })
}

impl CommercePublisher for ShopifyPublisher {
    fn store_id(&self) -> &str {
        &self.shop_url
    }

    fn find_by_title<'a>(
        &'a self,
        title: &'a str,
    ) -> BoxFuture<'a, capability::Result<Vec<RemoteProduct>>> {
        Box::pin(async move {
            let url = Url::parse_with_params(
                &format!("{}/products.json", self.base_url),
                &[("title", title), ("fields", "id,title,variants")],
            )
            .map_err(|e| CallError::permanent(format!("invalid store url: {e}")))?;
            let found: ProductsEnvelope =
                send_json(self.request(Method::GET, url), "product lookup", classify_generic)
                    .await?;
            Ok(found
                .products
                .into_iter()
                .filter(|p| p.title == title)
                .map(RemoteProduct::from)
                .collect())
        })
    }

    fn create<'a>(&'a self, listing: &'a Listing) -> BoxFuture<'a, capability::Result<RemoteProduct>> {
        Box::pin(async move {
            let request = self
                .request(Method::POST, format!("{}/products.json", self.base_url))
                .json(&product_payload(listing));
            let created: ProductEnvelope =
                send_json(request, "product create", classify_generic).await?;
            let product = created.product.ok_or_else(|| {
                CallError::permanent("product create returned no product (rejected or duplicate)")
            })?;
            debug!(remote_id = product.id, title = %listing.title, "store product created");
            Ok(product.into())
        })
    }

    fn add_image<'a>(&'a self, product_id: &'a str, image: &'a str) -> BoxFuture<'a, capability::Result<()>> {
        Box::pin(async move {
            let request = self
                .request(
                    Method::POST,
                    format!("{}/products/{product_id}/images.json", self.base_url),
                )
                .json(&image_payload(image)?);
            let _: Value = send_json(request, "image upload", classify_generic).await?;
            Ok(())
        })
    }

    fn disable_inventory_tracking<'a>(
        &'a self,
        inventory_item_id: &'a str,
    ) -> BoxFuture<'a, capability::Result<()>> {
        Box::pin(async move {
            let request = self
                .request(
                    Method::PUT,
                    format!("{}/inventory_items/{inventory_item_id}.json", self.base_url),
                )
                .json(&inventory_payload(inventory_item_id));
            let _: Value = send_json(request, "inventory update", classify_generic).await?;
            Ok(())
        })
    }
}
