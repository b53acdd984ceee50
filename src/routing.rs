//! Category routing: maps a task category to the agent that runs it and
//! the number of concurrency slots the category gets.
//!
//! Resolved once from [`SupervisorConfig`]; call sites never look categories
//! up by string themselves.

use std::collections::HashMap;

use crate::config::SupervisorConfig;

/// Resolved route for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRoute {
    /// Agent that handles the category's instructions.
    pub agent: String,
    /// Maximum simultaneously running tasks in the category.
    pub concurrency: usize,
}

/// Immutable category table.
#[derive(Debug, Clone)]
pub struct CategoryRouter {
    routes: HashMap<String, CategoryRoute>,
    fallback: CategoryRoute,
}

impl CategoryRouter {
    /// Build the routing table from configuration.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        let fallback = CategoryRoute {
            agent: config.default_agent.clone(),
            concurrency: config.default_concurrency,
        };

        let routes = config
            .categories
            .iter()
            .map(|(name, category)| {
                let route = CategoryRoute {
                    agent: category
                        .agent
                        .clone()
                        .unwrap_or_else(|| fallback.agent.clone()),
                    concurrency: category.concurrency.unwrap_or(fallback.concurrency),
                };
                (name.clone(), route)
            })
            .collect();

        Self { routes, fallback }
    }

    /// Route for `category`, or the default route for unknown categories.
    pub fn resolve(&self, category: &str) -> &CategoryRoute {
        self.routes.get(category).unwrap_or(&self.fallback)
    }

    /// Whether `category` has an explicit entry.
    pub fn is_known(&self, category: &str) -> bool {
        self.routes.contains_key(category)
    }
}
