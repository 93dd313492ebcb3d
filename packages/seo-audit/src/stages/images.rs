use async_trait::async_trait;
use serde::Serialize;

use super::{crawled_pages, encode};
use crate::error::AuditResult;
use crate::models::{StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageAudit {
    page: String,
    src: String,
    alt: Option<String>,
    missing_alt: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageStats {
    total: usize,
    missing_alt: usize,
    pages_with_missing_alt: usize,
    images: Vec<ImageAudit>,
}

/// Alt-text coverage of every image on the crawled pages.
pub struct ImagesStage;

#[async_trait]
impl UnitOfWork for ImagesStage {
    fn name(&self) -> &str {
        StageKind::Images.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let pages = crawled_pages(ctx.storage()?, unit.audit_id).await?;

        let mut images = Vec::new();
        let mut pages_with_missing_alt = 0;
        for page in &pages {
            let before = images.len();
            images.extend(page.page_data.images.iter().map(|img| ImageAudit {
                page: page.url.clone(),
                src: img.src.clone(),
                alt: img.alt.clone(),
                missing_alt: img.missing_alt(),
            }));
            if images[before..].iter().any(|i| i.missing_alt) {
                pages_with_missing_alt += 1;
            }
        }

        let stats = ImageStats {
            total: images.len(),
            missing_alt: images.iter().filter(|i| i.missing_alt).count(),
            pages_with_missing_alt,
            images,
        };
        Ok(StageOutput::complete(encode("image stats", &stats)?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{ImageRecord, PageData};
    use crate::stages::fixtures;

    fn image(src: &str, alt: Option<&str>) -> ImageRecord {
        ImageRecord {
            src: src.to_string(),
            alt: alt.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_counts_missing_alt() {
        let (repository, audit) = fixtures::audit_with_pages(vec![
            (
                "https://example.com/",
                PageData {
                    images: vec![
                        image("/logo.png", Some("Logo")),
                        image("/hero.jpg", Some("   ")),
                    ],
                    ..Default::default()
                },
            ),
            (
                "https://example.com/a",
                PageData {
                    images: vec![image("/a.png", None)],
                    ..Default::default()
                },
            ),
            ("https://example.com/b", PageData::default()),
        ])
        .await;
        let ctx = fixtures::scoped(&repository).await;

        let output = ImagesStage
            .run(&WorkUnit::new("images", audit.id, json!({})), &ctx)
            .await
            .unwrap();
        assert_eq!(output.value["total"], 3);
        assert_eq!(output.value["missingAlt"], 2);
        assert_eq!(output.value["pagesWithMissingAlt"], 2);
        assert_eq!(output.value["images"][1]["missingAlt"], true);
    }
}
