use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A registered student. Owned by the account service; we only read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            image: None,
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub attributes: OfferAttributes,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        title: impl Into<String>,
        attributes: OfferAttributes,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            title: title.into(),
            attributes,
            created_at: Utc::now(),
        }
    }
}

/// Category specific metadata of an offer, stored as structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum OfferAttributes {
    Books {
        isbn: Option<String>,
        author: Option<String>,
        edition: Option<String>,
    },
    Electronics {
        brand: Option<String>,
        model: Option<String>,
        condition: Condition,
    },
    Furniture {
        width_cm: Option<u32>,
        depth_cm: Option<u32>,
        height_cm: Option<u32>,
    },
    Housing {
        rooms: Option<u32>,
        monthly_rent_cents: Option<u64>,
        available_from: Option<chrono::NaiveDate>,
    },
    Other,
}

impl OfferAttributes {
    pub fn category(&self) -> &'static str {
        match self {
            OfferAttributes::Books { .. } => "books",
            OfferAttributes::Electronics { .. } => "electronics",
            OfferAttributes::Furniture { .. } => "furniture",
            OfferAttributes::Housing { .. } => "housing",
            OfferAttributes::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    New,
    LikeNew,
    Used,
    ForParts,
}
