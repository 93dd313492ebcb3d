use async_trait::async_trait;
use serde::Serialize;

use super::{crawled_pages, encode, root_page};
use crate::error::AuditResult;
use crate::models::{StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

/// Heading structure. The counts and flags describe the root page; the page
/// lists cover the whole crawl.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeadingsAnalysis {
    count_h1: usize,
    count_h2: usize,
    count_h3: usize,
    no_h1: bool,
    multiple_h1: bool,
    pages_without_h1: Vec<String>,
    pages_with_multiple_h1: Vec<String>,
}

pub struct HeadingsStage;

#[async_trait]
impl UnitOfWork for HeadingsStage {
    fn name(&self) -> &str {
        StageKind::Headings.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let pages = crawled_pages(ctx.storage()?, unit.audit_id).await?;

        let mut analysis = HeadingsAnalysis::default();
        if let Some(root) = root_page(&pages) {
            let headings = &root.page_data.headings;
            analysis.count_h1 = headings.h1.len();
            analysis.count_h2 = headings.h2.len();
            analysis.count_h3 = headings.h3.len();
            analysis.no_h1 = headings.h1.is_empty();
            analysis.multiple_h1 = headings.h1.len() > 1;
        }

        // Pages that failed to load have no headings to judge
        for page in pages.iter().filter(|p| p.is_ok()) {
            match page.page_data.headings.h1.len() {
                0 => analysis.pages_without_h1.push(page.url.clone()),
                1 => {}
                _ => analysis.pages_with_multiple_h1.push(page.url.clone()),
            }
        }

        Ok(StageOutput::complete(encode("headings analysis", &analysis)?))
    }
}
