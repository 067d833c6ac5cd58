// ABOUTME: Routing table that maps a sub-task to the worker best suited to run it.
// ABOUTME: Exact match on task type first, then first substring hit in the description.

use super::types::SubTask;

/// Default keyword → worker rules, in lookup order.
const DEFAULT_RULES: &[(&str, &str)] = &[
    ("design", "design"),
    ("ui", "frontend"),
    ("frontend", "frontend"),
    ("react", "frontend"),
    ("component", "frontend"),
    ("backend", "backend"),
    ("api", "backend"),
    ("endpoint", "backend"),
    ("database", "db"),
    ("db", "db"),
    ("schema", "db"),
    ("testing", "qa"),
    ("qa", "qa"),
    ("test", "qa"),
    ("verify", "qa"),
    ("devops", "devops"),
    ("deployment", "devops"),
    ("security", "security"),
    ("research", "research"),
];

/// Ordered keyword → worker id rules.
///
/// Description matching is first-match, not best-match: the first rule whose
/// keyword occurs anywhere in the description wins, in rule order.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    rules: Vec<(String, String)>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(
            DEFAULT_RULES
                .iter()
                .map(|(k, w)| (k.to_string(), w.to_string())),
        )
    }
}

impl RoutingTable {
    /// Keywords are stored lowercased; the first rule for a keyword wins.
    pub fn new<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut deduped: Vec<(String, String)> = Vec::new();
        for (keyword, worker) in rules {
            let keyword = keyword.trim().to_lowercase();
            if keyword.is_empty() || deduped.iter().any(|(k, _)| *k == keyword) {
                continue;
            }
            deduped.push((keyword, worker));
        }
        Self { rules: deduped }
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    /// Pick the worker for a sub-task, or `None` to leave it undelegated.
    pub fn route(&self, subtask: &SubTask) -> Option<&str> {
        self.route_parts(&subtask.task_type, &subtask.description)
    }

    pub fn route_parts(&self, task_type: &str, description: &str) -> Option<&str> {
        let task_type = task_type.trim().to_lowercase();
        if let Some((_, worker)) = self.rules.iter().find(|(k, _)| *k == task_type) {
            return Some(worker.as_str());
        }

        let description = description.to_lowercase();
        let hit = self
            .rules
            .iter()
            .find(|(keyword, _)| description.contains(keyword.as_str()));
        match hit {
            Some((keyword, worker)) => {
                log::debug!(
                    "[Router] No rule for type '{}'; description matched '{}'",
                    task_type,
                    keyword
                );
                Some(worker.as_str())
            }
            None => {
                log::info!("[Router] No worker for type '{}'; leaving undelegated", task_type);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::Priority;

    fn subtask(task_type: &str, description: &str) -> SubTask {
        SubTask {
            id: "s1".to_string(),
            task_type: task_type.to_string(),
            description: description.to_string(),
            priority: Priority::Medium,
            dependencies: vec![],
        }
    }

    #[test]
    fn exact_type_match_wins() {
        let table = RoutingTable::default();
        assert_eq!(table.route(&subtask("Frontend", "write the api")), Some("frontend"));
        assert_eq!(table.route(&subtask("database", "")), Some("db"));
        assert_eq!(table.route(&subtask("qa", "")), Some("qa"));
    }

    #[test]
    fn description_fallback_is_first_match_in_rule_order() {
        let table = RoutingTable::default();
        // "design" precedes "api" in the rules, so it wins despite appearing later in the text.
        assert_eq!(
            table.route(&subtask("misc", "Review api design")),
            Some("design")
        );
        // "ui" is matched as a substring, e.g. inside "build".
        assert_eq!(table.route(&subtask("chore", "build pipeline")), Some("frontend"));
    }

    #[test]
    fn unmatched_subtask_is_undelegated() {
        let table = RoutingTable::default();
        assert_eq!(table.route(&subtask("marketing", "write a tweet")), None);
    }

    #[test]
    fn routing_is_idempotent() {
        let table = RoutingTable::default();
        let s = subtask("integration", "verify webhook delivery");
        assert_eq!(table.route(&s), table.route(&s));
        assert_eq!(table.route(&s), Some("qa"));
    }

    #[test]
    fn custom_rules_keep_order_and_drop_duplicates() {
        let table = RoutingTable::new(vec![
            ("Docs".to_string(), "writer".to_string()),
            ("docs".to_string(), "ignored".to_string()),
            ("".to_string(), "nobody".to_string()),
        ]);
        assert_eq!(table.rules().len(), 1);
        assert_eq!(table.route(&subtask("docs", "")), Some("writer"));
    }
}
