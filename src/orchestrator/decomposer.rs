// ABOUTME: Feature decomposer that turns a title and description into typed sub-tasks.
// ABOUTME: Prefers an LLM-generated JSON plan and falls back to keyword rules.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::types::{Priority, SubTask};
use crate::providers::ProviderDispatcher;

const SYSTEM_CONTEXT: &str =
    "You are a technical project manager. Decompose features into clear, actionable subtasks.";

lazy_static! {
    static ref UI_TERMS: Regex =
        Regex::new(r"(?i)\b(component|ui|interface|react|jsx)").expect("valid UI keyword regex");
    static ref API_TERMS: Regex =
        Regex::new(r"(?i)\b(api|endpoint|backend|database|server)").expect("valid API keyword regex");
}

// =============================================================================
// Decomposer
// =============================================================================

pub struct Decomposer {
    dispatcher: Arc<ProviderDispatcher>,
}

impl Decomposer {
    pub fn new(dispatcher: Arc<ProviderDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Decompose a feature into sub-tasks. Never returns an empty plan.
    ///
    /// 1. Ask the provider dispatcher for a JSON array of sub-tasks
    /// 2. On no completion or unparsable output, use keyword rules
    /// 3. With no keyword match, use the fixed four-stage plan
    pub async fn decompose(&self, title: &str, description: &str) -> Vec<SubTask> {
        let prompt = build_prompt(title, description);
        match self.dispatcher.complete(&prompt, SYSTEM_CONTEXT, None).await {
            Some(raw) => match parse_plan(&raw) {
                Some(subtasks) => {
                    log::info!(
                        "[Decomposer] LLM generated {} subtasks for '{}'",
                        subtasks.len(),
                        title
                    );
                    return subtasks;
                }
                None => log::warn!("[Decomposer] Could not parse LLM plan; using fallback"),
            },
            None => log::info!("[Decomposer] No LLM completion; using fallback"),
        }
        fallback_plan(title, description)
    }
}

fn build_prompt(title: &str, description: &str) -> String {
    format!(
        r#"Decompose this feature into specific, actionable subtasks:

Feature: {}
Description: {}

Create a list of subtasks with:
- type: (frontend, backend, design, qa, etc.)
- description: What needs to be done
- priority: (high, medium, low)
- dependencies: Which subtasks must complete first

Return as JSON array with format:
[{{"type": "...", "description": "...", "priority": "...", "dependencies": []}}]

Focus on practical implementation steps. Be specific."#,
        title, description
    )
}

// =============================================================================
// Parsing model output
// =============================================================================

/// Parse the first JSON array in `raw` that yields at least one sub-task.
/// Arrays that hold no sub-task objects (citations like `[1]`, `[]`) are
/// skipped. Returns `None` if no array in the text is usable.
pub fn parse_plan(raw: &str) -> Option<Vec<SubTask>> {
    json_arrays(raw).find_map(|value| subtasks_from(&value))
}

fn subtasks_from(value: &serde_json::Value) -> Option<Vec<SubTask>> {
    let items = value.as_array()?;

    let mut taken = HashSet::new();
    let subtasks: Vec<SubTask> = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let task_type = obj
                .get("type")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())?;
            let description = obj
                .get("description")
                .or_else(|| obj.get("desc"))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())?
                .to_string();
            let priority = obj
                .get("priority")
                .and_then(|v| v.as_str())
                .map(Priority::parse)
                .unwrap_or_default();
            let dependencies = obj
                .get("dependencies")
                .and_then(|v| v.as_array())
                .map(|deps| {
                    deps.iter()
                        .filter_map(|d| match d {
                            serde_json::Value::String(s) => Some(s.clone()),
                            serde_json::Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            Some(SubTask {
                id: fresh_id(&mut taken),
                task_type,
                description,
                priority,
                dependencies,
            })
        })
        .collect();

    if subtasks.is_empty() { None } else { Some(subtasks) }
}

/// Find the first bracket-balanced substring of `raw` that parses as a JSON
/// array. Model output often wraps JSON in prose or code fences.
pub fn extract_json_array(raw: &str) -> Option<serde_json::Value> {
    json_arrays(raw).next()
}

/// Every bracket-balanced substring of `raw` that parses as a JSON array, in
/// order of its opening bracket.
fn json_arrays(raw: &str) -> impl Iterator<Item = serde_json::Value> + '_ {
    raw.char_indices()
        .filter(|(_, c)| *c == '[')
        .filter_map(|(start, _)| {
            let end = balanced_end(&raw[start..])?;
            match serde_json::from_str::<serde_json::Value>(&raw[start..start + end]) {
                Ok(value @ serde_json::Value::Array(_)) => Some(value),
                _ => None,
            }
        })
}

/// Byte length of the bracketed span starting at `text[0] == '['`, honoring
/// JSON string quoting.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Rule-based fallback
// =============================================================================

/// Keyword-driven plan. UI terms add design and frontend work, API/data
/// terms add backend work, and a verification step always closes the plan.
/// With no keyword match the fixed four-stage plan is used instead.
pub fn fallback_plan(title: &str, description: &str) -> Vec<SubTask> {
    let mut taken = HashSet::new();
    let mut subtasks = Vec::new();

    if UI_TERMS.is_match(description) {
        let design_id = fresh_id(&mut taken);
        subtasks.push(subtask(
            design_id.clone(),
            "design",
            format!("Design UI/UX for {}", title),
            Priority::High,
            vec![],
        ));
        subtasks.push(subtask(
            fresh_id(&mut taken),
            "frontend",
            format!("Implement React components for {}", title),
            Priority::High,
            vec![design_id],
        ));
    }

    if API_TERMS.is_match(description) {
        subtasks.push(subtask(
            fresh_id(&mut taken),
            "backend",
            format!("Implement API endpoints for {}", title),
            Priority::High,
            vec![],
        ));
    }

    if subtasks.is_empty() {
        return default_plan(title, &mut taken);
    }

    with_verification(subtasks, format!("Test and verify {}", title), &mut taken)
}

/// Design, frontend, backend, then verification of all three.
fn default_plan(title: &str, taken: &mut HashSet<String>) -> Vec<SubTask> {
    let stages = vec![
        subtask(
            fresh_id(taken),
            "design",
            format!("Design specifications for {}", title),
            Priority::High,
            vec![],
        ),
        subtask(
            fresh_id(taken),
            "frontend",
            format!("Implement frontend for {}", title),
            Priority::High,
            vec![],
        ),
        subtask(
            fresh_id(taken),
            "backend",
            format!("Implement backend for {}", title),
            Priority::High,
            vec![],
        ),
    ];
    with_verification(stages, format!("Test {}", title), taken)
}

fn with_verification(
    mut subtasks: Vec<SubTask>,
    description: String,
    taken: &mut HashSet<String>,
) -> Vec<SubTask> {
    let dependencies = subtasks.iter().map(|s| s.id.clone()).collect();
    subtasks.push(subtask(
        fresh_id(taken),
        "qa",
        description,
        Priority::Medium,
        dependencies,
    ));
    subtasks
}

fn subtask(
    id: String,
    task_type: &str,
    description: String,
    priority: Priority,
    dependencies: Vec<String>,
) -> SubTask {
    SubTask {
        id,
        task_type: task_type.to_string(),
        description,
        priority,
        dependencies,
    }
}

/// Short random id, unique among `taken`.
fn fresh_id(taken: &mut HashSet<String>) -> String {
    loop {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        if taken.insert(id.clone()) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::admission::AdmissionGate;
    use crate::providers::{CompletionRequest, DispatchLimits, Provider, ProviderError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CannedProvider(Result<&'static str, ()>);

    #[async_trait]
    impl Provider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(ProviderError::RateLimited {
                    provider: "canned".to_string(),
                    detail: "slow down".to_string(),
                }),
            }
        }
    }

    fn decomposer(dir: &tempfile::TempDir, provider: Option<CannedProvider>) -> Decomposer {
        let providers: Vec<Arc<dyn Provider>> = provider
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn Provider>)
            .collect();
        let gate = AdmissionGate::new(dir.path().join("llm.lock"), Duration::ZERO);
        Decomposer::new(Arc::new(ProviderDispatcher::new(
            providers,
            gate,
            DispatchLimits::default(),
        )))
    }

    fn types(subtasks: &[SubTask]) -> Vec<&str> {
        subtasks.iter().map(|s| s.task_type.as_str()).collect()
    }

    fn assert_unique_ids(subtasks: &[SubTask]) {
        let ids: HashSet<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), subtasks.len());
    }

    #[test]
    fn extracts_array_wrapped_in_prose_and_fences() {
        let raw = "Sure! Here is the plan:\n```json\n[{\"type\":\"design\",\"description\":\"Mockups\"}]\n```\nLet me know [if] you need more.";
        let value = extract_json_array(raw).unwrap();
        assert_eq!(value[0]["type"], "design");
    }

    #[test]
    fn citations_before_the_plan_do_not_hide_it() {
        let raw = r#"Following step [1] of the process (see []), here is the plan: [{"type":"design","description":"Wireframes"},{"type":"frontend","description":"Build the form"}]"#;
        let plan = parse_plan(raw).unwrap();
        assert_eq!(types(&plan), vec!["design", "frontend"]);
        assert_eq!(plan[1].description, "Build the form");
    }

    #[test]
    fn arrays_without_subtasks_are_not_a_plan() {
        assert!(parse_plan("Options: [1, 2, 3] or [\"a\"]").is_none());
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse_extraction() {
        let raw = r#"Plan: [{"type":"backend","description":"Parse ] and [ tokens"}] done"#;
        let value = extract_json_array(raw).unwrap();
        assert_eq!(value[0]["description"], "Parse ] and [ tokens");
    }

    #[test]
    fn skips_non_json_brackets_before_the_array() {
        let raw = r#"[Note] the plan follows: [{"type":"qa","desc":"Run suite"}]"#;
        let plan = parse_plan(raw).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].description, "Run suite");
    }

    #[test]
    fn parse_plan_assigns_fresh_unique_ids() {
        let raw = r#"Here you go:
[
  {"type": "Design", "description": "Wireframes", "priority": "high", "dependencies": []},
  {"type": "frontend", "description": "Build form", "priority": "medium", "dependencies": ["1"]},
  {"type": "qa", "description": "Test form", "priority": "low", "dependencies": [1, 2]}
]
Thanks!"#;
        let plan = parse_plan(raw).unwrap();
        assert_eq!(types(&plan), vec!["design", "frontend", "qa"]);
        assert_eq!(plan[0].priority, Priority::High);
        assert_eq!(plan[2].priority, Priority::Low);
        assert_eq!(plan[2].dependencies, vec!["1", "2"]);
        assert!(plan.iter().all(|s| s.id.len() == 8));
        assert_unique_ids(&plan);
    }

    #[test]
    fn parse_plan_rejects_garbage_and_empty_arrays() {
        assert!(parse_plan("I cannot help with that.").is_none());
        assert!(parse_plan("[]").is_none());
        assert!(parse_plan(r#"[{"oops": true}]"#).is_none());
        assert!(parse_plan("[1, 2").is_none());
    }

    #[test]
    fn component_description_yields_design_frontend_and_verification() {
        let plan = fallback_plan("Add login form", "component");
        assert_eq!(types(&plan), vec!["design", "frontend", "qa"]);

        let verification = plan.last().unwrap();
        let others: Vec<String> = plan[..plan.len() - 1].iter().map(|s| s.id.clone()).collect();
        assert_eq!(verification.dependencies, others);
        assert_eq!(plan[1].dependencies, vec![plan[0].id.clone()]);
        assert_unique_ids(&plan);
    }

    #[test]
    fn api_terms_add_backend_work() {
        let plan = fallback_plan("Orders", "Expose an API and a React page");
        assert_eq!(types(&plan), vec!["design", "frontend", "backend", "qa"]);
        assert_eq!(plan[3].dependencies.len(), 3);
    }

    #[test]
    fn no_keywords_uses_four_stage_plan() {
        let plan = fallback_plan("Mystery", "");
        assert_eq!(types(&plan), vec!["design", "frontend", "backend", "qa"]);
        assert_eq!(plan[3].description, "Test Mystery");
        assert_eq!(plan[3].dependencies.len(), 3);
    }

    #[test]
    fn keyword_match_requires_word_start() {
        let plan = fallback_plan("Pipeline", "rebuild the nightly job");
        assert_eq!(types(&plan), vec!["design", "frontend", "backend", "qa"]);
        assert_eq!(plan[0].description, "Design specifications for Pipeline");
    }

    #[test]
    fn fallback_is_deterministic_apart_from_ids() {
        let a = fallback_plan("Search", "server side search api");
        let b = fallback_plan("Search", "server side search api");
        let strip = |plan: &[SubTask]| -> Vec<(String, String)> {
            plan.iter()
                .map(|s| (s.task_type.clone(), s.description.clone()))
                .collect()
        };
        assert_eq!(strip(&a), strip(&b));
    }

    #[tokio::test]
    async fn uses_model_plan_when_parsable() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(
            &dir,
            Some(CannedProvider(Ok(
                r#"Plan: [{"type":"backend","description":"Add endpoint"}]"#,
            ))),
        );
        let plan = d.decompose("Export", "csv export").await;
        assert_eq!(types(&plan), vec!["backend"]);
    }

    #[tokio::test]
    async fn unparsable_model_output_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(&dir, Some(CannedProvider(Ok("no json here"))));
        let plan = d.decompose("Add login form", "component").await;
        assert_eq!(types(&plan), vec!["design", "frontend", "qa"]);
    }

    #[tokio::test]
    async fn rate_limited_providers_fall_back_to_rules() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(&dir, Some(CannedProvider(Err(()))));
        let plan = d.decompose("Add login form", "component").await;
        assert_eq!(types(&plan), vec!["design", "frontend", "qa"]);
    }

    #[tokio::test]
    async fn empty_description_without_providers_is_never_empty() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(&dir, None);
        let plan = d.decompose("", "").await;
        assert_eq!(plan.len(), 4);
    }
}
