//! Schema Catalog
//!
//! Declarative description of the inventory collections, their fields,
//! relations and the pipeline stage whitelist. Built once at startup and
//! shared read-only by the prompt builder, the safety validator and the
//! query interpreter, so the three never disagree on a name.

use itertools::Itertools;
use serde::Serialize;
use std::fmt;

/// Stages the interpreter knows how to run. None of them write.
const READ_STAGES: &[&str] = &[
    "$match",
    "$project",
    "$addFields",
    "$set",
    "$unset",
    "$group",
    "$sort",
    "$limit",
    "$skip",
    "$count",
    "$unwind",
    "$lookup",
];

/// Materialising and document-replacing stages.
const WRITE_STAGES: &[&str] = &["$out", "$merge", "$replaceRoot", "$replaceWith"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    ObjectId,
    String,
    Number,
    Boolean,
    Date,
    Enum(Vec<String>),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::ObjectId => write!(f, "ObjectId"),
            FieldType::String => write!(f, "String"),
            FieldType::Number => write!(f, "Number"),
            FieldType::Boolean => write!(f, "Boolean"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Enum(values) => write!(
                f,
                "String (enum: {})",
                values.iter().map(|v| format!("'{}'", v)).join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSpec {
    /// Document field name (camelCase).
    pub name: String,
    /// snake_case column alias accepted in SELECT statements.
    pub column: String,
    pub kind: FieldType,
    pub description: String,
}

/// A foreign reference from one collection to another.
#[derive(Debug, Clone, Serialize)]
pub struct Relation {
    pub field: String,
    pub target: String,
    pub target_field: String,
}

/// Marks the pair of fields behind the "below minimum level" idiom.
#[derive(Debug, Clone, Serialize)]
pub struct StockThreshold {
    pub quantity: String,
    pub minimum: String,
    /// Virtual boolean column that stands for the same comparison.
    pub flag_column: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySpec {
    /// Lowercase collection name.
    pub name: String,
    pub label: String,
    pub aliases: Vec<String>,
    pub fields: Vec<FieldSpec>,
    pub relations: Vec<Relation>,
    pub stock_threshold: Option<StockThreshold>,
}

impl EntitySpec {
    fn new(name: &str, label: &str, aliases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            fields: vec![field("_id", FieldType::ObjectId, "")],
            relations: Vec::new(),
            stock_threshold: None,
        }
    }

    fn with_field(mut self, name: &str, kind: FieldType, description: &str) -> Self {
        self.fields.push(field(name, kind, description));
        self
    }

    fn with_reference(mut self, name: &str, target: &str, description: &str) -> Self {
        self.fields.push(field(name, FieldType::ObjectId, description));
        self.relations.push(Relation {
            field: name.to_string(),
            target: target.to_string(),
            target_field: "_id".to_string(),
        });
        self
    }

    /// Look up a field by document name or snake_case column, ignoring case.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        let wanted = name.trim().to_lowercase();
        if wanted == "id" {
            return self.fields.iter().find(|f| f.name == "_id");
        }
        self.fields
            .iter()
            .find(|f| f.name.to_lowercase() == wanted || f.column == wanted)
    }

    pub fn relation_to(&self, target: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.target == target)
    }

    fn matches(&self, normalized: &str) -> bool {
        self.name == normalized || self.aliases.iter().any(|a| a == normalized)
    }
}

fn field(name: &str, kind: FieldType, description: &str) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        column: to_snake_case(name),
        kind,
        description: description.to_string(),
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaCatalog {
    entities: Vec<EntitySpec>,
}

impl SchemaCatalog {
    /// The four inventory collections.
    pub fn inventory() -> Self {
        let products = EntitySpec::new(
            "products",
            "Products",
            &["product", "items", "item", "inventory"],
        )
        .with_field("name", FieldType::String, "product name")
        .with_field("description", FieldType::String, "product description")
        .with_reference("category", "categories", "references Category")
        .with_reference("supplier", "suppliers", "references Supplier")
        .with_field("currentQuantity", FieldType::Number, "current stock quantity")
        .with_field("minimumStockLevel", FieldType::Number, "reorder point")
        .with_field("price", FieldType::Number, "product price")
        .with_field(
            "expirationDate",
            FieldType::Date,
            "product expiration date, if applicable",
        )
        .with_field("createdAt", FieldType::Date, "when the product was added")
        .with_field("updatedAt", FieldType::Date, "when the product was last updated");
        let products = EntitySpec {
            stock_threshold: Some(StockThreshold {
                quantity: "currentQuantity".to_string(),
                minimum: "minimumStockLevel".to_string(),
                flag_column: "is_low_stock".to_string(),
            }),
            ..products
        };

        let categories = EntitySpec::new("categories", "Categories", &["category"])
            .with_field("name", FieldType::String, "category name")
            .with_field("description", FieldType::String, "category description")
            .with_field("isActive", FieldType::Boolean, "whether category is active");

        let suppliers = EntitySpec::new("suppliers", "Suppliers", &["supplier", "vendors"])
            .with_field("name", FieldType::String, "supplier name")
            .with_field("email", FieldType::String, "supplier email")
            .with_field("phone", FieldType::String, "supplier phone")
            .with_field("company", FieldType::String, "supplier company name")
            .with_field("city", FieldType::String, "supplier location")
            .with_field("contactPerson", FieldType::String, "contact person")
            .with_field("paymentTerms", FieldType::String, "payment terms, e.g. Net 30")
            .with_field("isActive", FieldType::Boolean, "whether supplier is active")
            .with_field("createdAt", FieldType::Date, "when the supplier was added");

        let movements = EntitySpec::new(
            "stockmovements",
            "StockMovements",
            &["stockmovement", "stock_movements", "stock_movement", "movements"],
        )
        .with_reference("product", "products", "references Product")
        .with_field(
            "movementType",
            FieldType::Enum(vec!["in".to_string(), "out".to_string()]),
            "direction of the movement",
        )
        .with_field("quantity", FieldType::Number, "quantity moved")
        .with_field("reason", FieldType::String, "reason for movement")
        .with_field("movementDate", FieldType::Date, "when movement occurred")
        .with_field("createdAt", FieldType::Date, "record creation timestamp");

        Self {
            entities: vec![products, categories, suppliers, movements],
        }
    }

    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }

    /// Resolve a collection reference as written by the model
    /// (`products`, `Product`, `stock_movements`, `'suppliers'`).
    pub fn resolve_collection(&self, raw: &str) -> Option<&EntitySpec> {
        let normalized = raw
            .trim()
            .trim_matches(|c| c == '\'' || c == '"' || c == '`')
            .to_lowercase();
        self.entities.iter().find(|e| e.matches(&normalized))
    }

    /// Closest known collection name, for log messages.
    pub fn suggest_collection(&self, raw: &str) -> Option<&str> {
        let normalized = raw.trim().to_lowercase();
        self.entities
            .iter()
            .map(|e| (e.name.as_str(), strsim::jaro_winkler(&e.name, &normalized)))
            .filter(|(_, score)| *score > 0.8)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name)
    }

    pub fn is_read_stage(&self, name: &str) -> bool {
        READ_STAGES.contains(&name)
    }

    pub fn is_write_stage(&self, name: &str) -> bool {
        WRITE_STAGES.iter().any(|s| s.eq_ignore_ascii_case(name))
    }

    pub fn write_stages(&self) -> &'static [&'static str] {
        WRITE_STAGES
    }

    /// Schema text embedded in the translation prompt.
    pub fn describe(&self) -> String {
        self.entities
            .iter()
            .map(|entity| {
                let fields = entity
                    .fields
                    .iter()
                    .map(|f| {
                        let description = match entity.relations.iter().find(|r| r.field == f.name) {
                            Some(rel) => format!("references {}", rel.target),
                            None => f.description.clone(),
                        };
                        if description.is_empty() {
                            format!("- {}: {}", f.name, f.kind)
                        } else {
                            format!("- {}: {} ({})", f.name, f.kind, description)
                        }
                    })
                    .join("\n");
                format!(
                    "{} Schema (collection: {}):\n{}",
                    entity.label, entity.name, fields
                )
            })
            .join("\n\n")
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::inventory()
    }
}
