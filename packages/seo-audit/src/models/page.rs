//! Crawled page model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::AuditId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headings {
    pub h1: Vec<String>,
    pub h2: Vec<String>,
    pub h3: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub src: String,
    pub alt: Option<String>,
}

impl ImageRecord {
    pub fn missing_alt(&self) -> bool {
        self.alt.as_deref().map_or(true, |a| a.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub url: String,
    pub text: String,
    /// Points at a different host than the page it was found on
    #[serde(default)]
    pub external: bool,
}

/// What was extracted from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageData {
    pub title: Option<String>,
    pub meta_description: Option<String>,
    #[serde(default)]
    pub headings: Headings,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    /// Fetch failure for pages that could not be read
    pub error: Option<String>,
}

/// One crawled page, owned by its audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AuditPage {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub audit_id: AuditId,
    pub url: String,
    #[builder(default, setter(strip_option))]
    pub status_code: Option<u16>,
    #[builder(default = true)]
    pub visited: bool,
    #[builder(default)]
    pub depth: usize,
    #[builder(default)]
    pub page_data: PageData,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl AuditPage {
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn is_ok(&self) -> bool {
        self.page_data.error.is_none() && self.status_code.is_some_and(|s| s < 400)
    }
}
