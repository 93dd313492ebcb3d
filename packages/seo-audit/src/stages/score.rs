use async_trait::async_trait;
use serde_json::{json, Value};

use super::{crawled_pages, root_page};
use crate::error::{AuditError, AuditResult};
use crate::models::{StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

const MISSING_TITLE_PENALTY: i64 = 10;
const MISSING_DESCRIPTION_PENALTY: i64 = 10;
const H1_PENALTY: i64 = 10;
const MISSING_ALT_PENALTY: i64 = 5;
const BROKEN_LINKS_PENALTY: i64 = 5;

/// Overall score: 100 minus a fixed penalty per problem found, never below 0.
///
/// Title, description and H1 are judged on the root page, alt text across all
/// pages. Broken links count only if the links stage has run.
pub struct ScoreStage;

#[async_trait]
impl UnitOfWork for ScoreStage {
    fn name(&self) -> &str {
        StageKind::Score.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let repository = ctx.storage()?;
        let audit = repository.load_audit(unit.audit_id).await?;
        let pages = crawled_pages(repository, audit.id).await?;
        let root = root_page(&pages)
            .ok_or_else(|| AuditError::Validation("no root page to score".into()))?;

        let mut score: i64 = 100;
        let mut reasons = Vec::new();
        let mut penalize = |points: i64, reason: &str| {
            score -= points;
            reasons.push(reason.to_string());
        };

        let data = &root.page_data;
        if data.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
            penalize(MISSING_TITLE_PENALTY, "Missing meta title");
        }
        if data
            .meta_description
            .as_deref()
            .map_or(true, |d| d.trim().is_empty())
        {
            penalize(MISSING_DESCRIPTION_PENALTY, "Missing meta description");
        }
        if data.headings.h1.len() != 1 {
            penalize(H1_PENALTY, "H1 problems (missing or multiple)");
        }
        if pages
            .iter()
            .any(|p| p.page_data.images.iter().any(|i| i.missing_alt()))
        {
            penalize(MISSING_ALT_PENALTY, "Images missing alt text");
        }
        let broken_links = audit
            .audit_data
            .get(StageKind::Links.result_key())
            .and_then(|stats| stats.get("broken"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if broken_links > 0 {
            penalize(BROKEN_LINKS_PENALTY, "Broken links");
        }

        Ok(StageOutput::complete(json!({
            "score": score.max(0),
            "reasons": reasons,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Headings, ImageRecord, PageData};
    use crate::stages::fixtures;

    fn good_page() -> PageData {
        PageData {
            title: Some("Shoes".into()),
            meta_description: Some("Handmade shoes".into()),
            headings: Headings {
                h1: vec!["Shoes".into()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_site_scores_full() {
        let (repository, audit) =
            fixtures::audit_with_pages(vec![("https://example.com/", good_page())]).await;
        let ctx = fixtures::scoped(&repository).await;

        let output = ScoreStage
            .run(&WorkUnit::new("score", audit.id, json!({})), &ctx)
            .await
            .unwrap();
        assert_eq!(output.value["score"], 100);
        assert_eq!(output.value["reasons"], json!([]));
    }

    #[tokio::test]
    async fn test_penalties_add_up() {
        let (repository, audit) = fixtures::audit_with_pages(vec![
            ("https://example.com/", PageData::default()),
            (
                "https://example.com/a",
                PageData {
                    images: vec![ImageRecord {
                        src: "/a.png".into(),
                        alt: None,
                    }],
                    ..good_page()
                },
            ),
        ])
        .await;
        repository
            .merge_audit_data(audit.id, "linkStats", json!({"broken": 2}), None)
            .await
            .unwrap();
        let ctx = fixtures::scoped(&repository).await;

        let output = ScoreStage
            .run(&WorkUnit::new("score", audit.id, json!({})), &ctx)
            .await
            .unwrap();
        assert_eq!(output.value["score"], 60);
        assert_eq!(output.value["reasons"].as_array().unwrap().len(), 5);
    }
}
