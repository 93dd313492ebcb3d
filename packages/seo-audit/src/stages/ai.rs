use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{crawled_pages, root_page};
use crate::dependencies::{GuardedDependency, LanguageModel};
use crate::error::{AuditError, AuditResult};
use crate::models::{Audit, AuditPage, StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

const SYSTEM_PROMPT: &str = "You are an SEO consultant. Answer with a short list of concrete, \
     prioritized improvements, one per line, each starting with \"- \".";

/// Earlier results worth showing the model, when present.
const CONTEXT_KEYS: [&str; 5] = [
    "metaAnalysis",
    "headingsAnalysis",
    "imageStats",
    "performance_analysis",
    "seoScore",
];

/// Improvement suggestions from a language model, written to
/// `suggestions_data`.
pub struct AiSuggestionsStage {
    model: Arc<dyn LanguageModel>,
    guard: GuardedDependency,
}

impl AiSuggestionsStage {
    pub fn new(model: Arc<dyn LanguageModel>, guard: GuardedDependency) -> Self {
        Self { model, guard }
    }
}

fn build_prompt(audit: &Audit, root: &AuditPage) -> String {
    let data = &root.page_data;
    let mut prompt = format!("Suggest SEO improvements for {}.\n\n", audit.url);
    let _ = writeln!(prompt, "Title: {}", data.title.as_deref().unwrap_or("(missing)"));
    let _ = writeln!(
        prompt,
        "Meta description: {}",
        data.meta_description.as_deref().unwrap_or("(missing)")
    );
    let _ = writeln!(prompt, "H1: {}", data.headings.h1.join(" | "));
    let _ = writeln!(prompt, "H2: {}", data.headings.h2.join(" | "));
    let _ = writeln!(
        prompt,
        "Images: {} ({} without alt)",
        data.images.len(),
        data.images.iter().filter(|i| i.missing_alt()).count()
    );

    for key in CONTEXT_KEYS {
        if let Some(value) = audit.audit_data.get(key) {
            let _ = writeln!(prompt, "{}: {}", key, value);
        }
    }
    prompt
}

/// One suggestion per non-empty line, list markers stripped.
fn parse_suggestions(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['-', '*', '•'])
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')'])
                .trim()
        })
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl UnitOfWork for AiSuggestionsStage {
    fn name(&self) -> &str {
        StageKind::Ai.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let repository = ctx.storage()?;
        let audit = repository.load_audit(unit.audit_id).await?;
        let pages = crawled_pages(repository, audit.id).await?;
        let root = root_page(&pages)
            .ok_or_else(|| AuditError::Validation("no root page to analyze".into()))?;

        let prompt = build_prompt(&audit, root);
        let model = self.model.as_ref();
        let prompt_ref = prompt.as_str();
        let text = self
            .guard
            .call(model.name(), move || model.complete(SYSTEM_PROMPT, prompt_ref))
            .await?;

        let suggestions = parse_suggestions(&text);
        if suggestions.is_empty() {
            return Err(AuditError::Dependency {
                dependency: model.name().to_string(),
                message: "language model returned no suggestions".into(),
            });
        }

        Ok(StageOutput::complete(json!({
            "model": model.name(),
            "suggestions": suggestions,
        })))
    }
}
