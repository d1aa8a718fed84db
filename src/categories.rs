use std::collections::BTreeMap;

use crate::config::CategoryConfig;
use crate::report::ReportFormat;

/// A category with its API key resolved.
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub domain: String,
    pub report_prefix: String,
    pub format: ReportFormat,
    aliases: Vec<String>,
    api_key: Option<String>,
}

impl Category {
    fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    fn matches_key(&self, api_key: &str) -> bool {
        !api_key.is_empty() && self.api_key.as_deref() == Some(api_key)
    }
}

/// Maps API keys to caller categories.
///
/// The registry is built per request from the configuration and the
/// current environment, keys are never captured at start up.
#[derive(Debug)]
pub struct CategoryRegistry {
    categories: Vec<Category>,
}

impl CategoryRegistry {
    pub fn load(configs: &BTreeMap<String, CategoryConfig>) -> Self {
        let categories = configs
            .iter()
            .map(|(name, cfg)| Category {
                name: name.clone(),
                domain: cfg.domain.clone(),
                report_prefix: cfg.report_prefix.clone(),
                format: cfg.format,
                aliases: cfg.aliases.clone(),
                api_key: resolve_key(cfg),
            })
            .collect();

        Self { categories }
    }

    /// The category whose key is `api_key`, if any.
    pub fn by_key(&self, api_key: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.matches_key(api_key))
    }

    /// The category named `name` either directly or by alias.
    pub fn by_name(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.matches_name(name))
    }

    /// Checks `api_key` is the key expected for the declared category.
    pub fn verify(&self, name: &str, api_key: &str) -> Option<&Category> {
        self.by_name(name).filter(|c| c.matches_key(api_key))
    }
}

fn resolve_key(cfg: &CategoryConfig) -> Option<String> {
    let from_env = cfg
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty());

    from_env.or_else(|| cfg.api_key.clone().filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(domain: &str, env: Option<&str>, key: Option<&str>, aliases: &[&str]) -> CategoryConfig {
        CategoryConfig {
            domain: domain.to_string(),
            api_key_env: env.map(String::from),
            api_key: key.map(String::from),
            aliases: aliases.iter().map(|v| v.to_string()).collect(),
            report_prefix: "T".to_string(),
            format: ReportFormat::Html,
        }
    }

    #[test]
    fn test_lookup_by_key_and_alias() {
        let mut configs = BTreeMap::new();
        configs.insert("vehicle".to_string(), category("vehiclevibe.app", None, Some("vv-key"), &["vehiclevibe"]));
        configs.insert("food".to_string(), category("noforksgiven.app", None, Some("food-key"), &[]));

        let registry = CategoryRegistry::load(&configs);

        assert_eq!(registry.by_key("vv-key").map(|c| c.name.as_str()), Some("vehicle"));
        assert_eq!(registry.by_name("VehicleVibe").map(|c| c.domain.as_str()), Some("vehiclevibe.app"));
        assert!(registry.verify("vehicle", "vv-key").is_some());
        assert!(registry.verify("vehicle", "food-key").is_none());
        assert!(registry.by_key("unknown").is_none());
        assert!(registry.by_key("").is_none());
    }

    #[test]
    fn test_keys_are_read_when_loaded() {
        let var = "APPRAISE_TEST_CATEGORY_KEY_ROTATION";
        let mut configs = BTreeMap::new();
        configs.insert("travel".to_string(), category("travelling.app", Some(var), None, &[]));

        std::env::remove_var(var);
        assert!(CategoryRegistry::load(&configs).by_key("first").is_none());

        std::env::set_var(var, "first");
        assert!(CategoryRegistry::load(&configs).by_key("first").is_some());

        std::env::set_var(var, "second");
        let registry = CategoryRegistry::load(&configs);
        assert!(registry.by_key("first").is_none());
        assert!(registry.by_key("second").is_some());

        std::env::remove_var(var);
    }

    #[test]
    fn test_empty_env_falls_back_to_literal() {
        let var = "APPRAISE_TEST_CATEGORY_KEY_EMPTY";
        std::env::set_var(var, "");

        let mut configs = BTreeMap::new();
        configs.insert("food".to_string(), category("noforksgiven.app", Some(var), Some("literal"), &[]));

        let registry = CategoryRegistry::load(&configs);
        assert!(registry.by_key("literal").is_some());
        assert!(registry.by_key("").is_none());

        std::env::remove_var(var);
    }
}
