use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use super::{crawled_pages, encode, root_page};
use crate::error::AuditResult;
use crate::models::{PageData, StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

pub const TITLE_MAX_CHARS: usize = 65;
pub const DESCRIPTION_MAX_CHARS: usize = 160;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaCheck {
    title_length: usize,
    desc_length: usize,
    title_missing: bool,
    desc_missing: bool,
    title_too_long: bool,
    desc_too_long: bool,
}

impl MetaCheck {
    fn of(page: &PageData) -> Self {
        let title = page.title.as_deref().unwrap_or_default().trim();
        let desc = page.meta_description.as_deref().unwrap_or_default().trim();
        let title_length = title.chars().count();
        let desc_length = desc.chars().count();
        Self {
            title_length,
            desc_length,
            title_missing: title.is_empty(),
            desc_missing: desc.is_empty(),
            title_too_long: title_length > TITLE_MAX_CHARS,
            desc_too_long: desc_length > DESCRIPTION_MAX_CHARS,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageMeta {
    url: String,
    #[serde(flatten)]
    check: MetaCheck,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaAnalysis {
    /// Root page
    #[serde(flatten)]
    root: MetaCheck,
    pages_missing_title: usize,
    pages_missing_desc: usize,
    duplicate_titles: Vec<String>,
    pages: Vec<PageMeta>,
}

/// Title and meta description lengths and duplicates.
pub struct MetaStage;

#[async_trait]
impl UnitOfWork for MetaStage {
    fn name(&self) -> &str {
        StageKind::Meta.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let pages = crawled_pages(ctx.storage()?, unit.audit_id).await?;
        let readable: Vec<_> = pages.iter().filter(|p| p.is_ok()).collect();

        let mut analysis = MetaAnalysis {
            root: root_page(&pages)
                .map(|p| MetaCheck::of(&p.page_data))
                .unwrap_or_default(),
            ..Default::default()
        };

        let mut titles: BTreeMap<&str, usize> = BTreeMap::new();
        for page in &readable {
            let check = MetaCheck::of(&page.page_data);
            if check.title_missing {
                analysis.pages_missing_title += 1;
            } else if let Some(title) = page.page_data.title.as_deref() {
                *titles.entry(title.trim()).or_default() += 1;
            }
            if check.desc_missing {
                analysis.pages_missing_desc += 1;
            }
            analysis.pages.push(PageMeta {
                url: page.url.clone(),
                check,
            });
        }
        analysis.duplicate_titles = titles
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(title, _)| title.to_string())
            .collect();

        Ok(StageOutput::complete(encode("meta analysis", &analysis)?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::stages::fixtures;

    fn meta(title: Option<&str>, desc: Option<&str>) -> PageData {
        PageData {
            title: title.map(str::to_string),
            meta_description: desc.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_length_thresholds() {
        let check = MetaCheck::of(&meta(
            Some("t".repeat(66).as_str()),
            Some("d".repeat(160).as_str()),
        ));
        assert!(check.title_too_long);
        assert!(!check.desc_too_long);

        let check = MetaCheck::of(&meta(Some("  "), None));
        assert!(check.title_missing);
        assert!(check.desc_missing);
        assert_eq!(check.title_length, 0);
    }

    #[tokio::test]
    async fn test_root_flags_and_duplicates() {
        let (repository, audit) = fixtures::audit_with_pages(vec![
            ("https://example.com/", meta(Some("Shop"), None)),
            ("https://example.com/a", meta(Some("Shop"), Some("About us"))),
            ("https://example.com/b", meta(None, Some("B"))),
        ])
        .await;
        let ctx = fixtures::scoped(&repository).await;

        let output = MetaStage
            .run(&WorkUnit::new("meta", audit.id, json!({})), &ctx)
            .await
            .unwrap();
        let value = output.value;
        assert_eq!(value["titleLength"], 4);
        assert_eq!(value["descMissing"], true);
        assert_eq!(value["pagesMissingTitle"], 1);
        assert_eq!(value["pagesMissingDesc"], 1);
        assert_eq!(value["duplicateTitles"], json!(["Shop"]));
        assert_eq!(value["pages"].as_array().unwrap().len(), 3);
    }
}
