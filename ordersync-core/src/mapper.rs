// Copyright 2025 Ordersync Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Projections from source records to derived fields.
//!
//! A [`RecordMapper`] validates a [`SourceRecord`] and produces the fields
//! stored in the derived record. The applier calls it before any write, so
//! a record the mapper rejects never reaches the store.

use crate::record::SourceRecord;
use bson::{Bson, Document};
use thiserror::Error;

/// A source record that cannot be projected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    /// A required field is absent or null.
    #[error("missing required field `{field}`")]
    MissingField {
        /// Dotted field path
        field: String,
    },

    /// A field holds a value of the wrong type.
    #[error("field `{field}` must be {expected}")]
    InvalidType {
        /// Dotted field path
        field: String,
        /// Description of the accepted type
        expected: &'static str,
    },
}

impl MappingError {
    fn missing(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }

    fn invalid(field: &str, expected: &'static str) -> Self {
        Self::InvalidType {
            field: field.to_string(),
            expected,
        }
    }
}

/// Turns a source record into the fields of its derived record.
pub trait RecordMapper: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Validates `record` and returns its projection.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the record is missing required fields
    /// or holds values of the wrong type. Such records are never retried.
    fn map(&self, record: &SourceRecord) -> Result<Document, MappingError>;
}

/// Copies the whole source document except `_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl RecordMapper for IdentityMapper {
    fn name(&self) -> &str {
        "identity"
    }

    fn map(&self, record: &SourceRecord) -> Result<Document, MappingError> {
        let mut fields = record.fields.clone();
        fields.remove("_id");
        Ok(fields)
    }
}

/// Product → product cache entry.
///
/// Requires `title` (string), `price` and `quantity` (numbers) and
/// `seller.id`. Copies `description`, `category_id`, `category` and
/// `imageId` when present. The seller id is stored as a string.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductCacheMapper;

const PRODUCT_OPTIONAL_FIELDS: [&str; 4] = ["description", "category_id", "category", "imageId"];

impl RecordMapper for ProductCacheMapper {
    fn name(&self) -> &str {
        "product-cache"
    }

    fn map(&self, record: &SourceRecord) -> Result<Document, MappingError> {
        let source = &record.fields;
        let mut fields = Document::new();

        match required(source, "title")? {
            Bson::String(title) => fields.insert("title", title.clone()),
            _ => return Err(MappingError::invalid("title", "a string")),
        };
        fields.insert("price", number(source, "price")?);
        fields.insert("quantity", number(source, "quantity")?);

        let seller_id = match required_path(source, "seller", "id")? {
            Bson::String(s) => s.clone(),
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::Int32(i) => i.to_string(),
            Bson::Int64(i) => i.to_string(),
            _ => return Err(MappingError::invalid("seller.id", "a string or ObjectId")),
        };
        fields.insert("seller", bson::doc! { "id": seller_id });

        for field in PRODUCT_OPTIONAL_FIELDS {
            if let Some(value) = present(source, field) {
                fields.insert(field, value.clone());
            }
        }

        Ok(fields)
    }
}

/// Order → search index document.
///
/// Produces `{ userId, products, totalAmount, status, createdAt, updatedAt }`
/// where `userId` is taken from `user.id`. Requires `user.id`, `products`
/// (an array) and `totalAmount` (a number).
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderIndexMapper;

impl RecordMapper for OrderIndexMapper {
    fn name(&self) -> &str {
        "order-index"
    }

    fn map(&self, record: &SourceRecord) -> Result<Document, MappingError> {
        let source = &record.fields;
        let mut fields = Document::new();

        fields.insert("userId", required_path(source, "user", "id")?.clone());

        match required(source, "products")? {
            products @ Bson::Array(_) => fields.insert("products", products.clone()),
            _ => return Err(MappingError::invalid("products", "an array")),
        };
        fields.insert("totalAmount", number(source, "totalAmount")?);

        for field in ["status", "createdAt", "updatedAt"] {
            if let Some(value) = present(source, field) {
                fields.insert(field, value.clone());
            }
        }

        Ok(fields)
    }
}

fn present<'a>(document: &'a Document, field: &str) -> Option<&'a Bson> {
    document.get(field).filter(|v| !matches!(v, Bson::Null))
}

fn required<'a>(document: &'a Document, field: &str) -> Result<&'a Bson, MappingError> {
    present(document, field).ok_or_else(|| MappingError::missing(field))
}

fn required_path<'a>(
    document: &'a Document,
    parent: &str,
    field: &str,
) -> Result<&'a Bson, MappingError> {
    let path = format!("{parent}.{field}");
    match required(document, parent) {
        Ok(Bson::Document(inner)) => present(inner, field).ok_or(MappingError::MissingField { field: path }),
        Ok(_) => Err(MappingError::invalid(parent, "an embedded document")),
        Err(_) => Err(MappingError::MissingField { field: path }),
    }
}

fn number(document: &Document, field: &str) -> Result<Bson, MappingError> {
    match required(document, field)? {
        value @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)) => {
            Ok(value.clone())
        }
        _ => Err(MappingError::invalid(field, "a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    fn record(fields: Document) -> SourceRecord {
        SourceRecord::from_document(fields, "updatedAt").unwrap()
    }

    fn product() -> Document {
        doc! {
            "_id": ObjectId::new(),
            "title": "Desk lamp",
            "price": 24.5,
            "quantity": 10,
            "seller": { "id": "s-1", "name": "Lamps Inc" },
            "category": "lighting",
            "internalNotes": "not cached",
        }
    }

    #[test]
    fn test_product_mapper_projects_known_fields() {
        let fields = ProductCacheMapper.map(&record(product())).unwrap();

        assert_eq!(fields.get_str("title").unwrap(), "Desk lamp");
        assert_eq!(fields.get_f64("price").unwrap(), 24.5);
        assert_eq!(fields.get_i32("quantity").unwrap(), 10);
        assert_eq!(fields.get_document("seller").unwrap(), &doc! { "id": "s-1" });
        assert_eq!(fields.get_str("category").unwrap(), "lighting");
        assert!(!fields.contains_key("internalNotes"));
        assert!(!fields.contains_key("_id"));
    }

    #[test]
    fn test_product_mapper_seller_object_id() {
        let seller = ObjectId::new();
        let mut doc = product();
        doc.insert("seller", doc! { "id": seller });

        let fields = ProductCacheMapper.map(&record(doc)).unwrap();
        assert_eq!(fields.get_document("seller").unwrap().get_str("id").unwrap(), seller.to_hex());
    }

    #[test]
    fn test_product_mapper_rejects_invalid() {
        let mut doc = product();
        doc.remove("title");
        assert_eq!(
            ProductCacheMapper.map(&record(doc)).unwrap_err(),
            MappingError::MissingField { field: "title".into() }
        );

        let mut doc = product();
        doc.insert("price", "cheap");
        assert!(matches!(
            ProductCacheMapper.map(&record(doc)).unwrap_err(),
            MappingError::InvalidType { .. }
        ));

        let mut doc = product();
        doc.insert("seller", doc! { "name": "anon" });
        assert_eq!(
            ProductCacheMapper.map(&record(doc)).unwrap_err(),
            MappingError::MissingField { field: "seller.id".into() }
        );
    }

    #[test]
    fn test_order_mapper_projection() {
        let order = doc! {
            "_id": ObjectId::new(),
            "user": { "id": "u-7", "email": "a@b.c" },
            "products": [{ "productId": "p1", "quantity": 2 }],
            "totalAmount": 99.0,
            "status": "pending",
            "shippingAddress": "elsewhere",
        };

        let fields = OrderIndexMapper.map(&record(order)).unwrap();
        assert_eq!(fields.get_str("userId").unwrap(), "u-7");
        assert_eq!(fields.get_array("products").unwrap().len(), 1);
        assert_eq!(fields.get_str("status").unwrap(), "pending");
        assert!(!fields.contains_key("shippingAddress"));
        assert!(!fields.contains_key("user"));
    }

    #[test]
    fn test_order_mapper_requires_user() {
        let order = doc! { "_id": 1, "products": [], "totalAmount": 0 };
        assert_eq!(
            OrderIndexMapper.map(&record(order)).unwrap_err(),
            MappingError::MissingField { field: "user.id".into() }
        );
    }

    #[test]
    fn test_identity_mapper_drops_id() {
        let fields = IdentityMapper.map(&record(doc! { "_id": 1, "a": 2 })).unwrap();
        assert_eq!(fields, doc! { "a": 2 });
    }
}
