use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use tracing::trace;

/// Default bound on transitive reachability searches.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Key under which edges without a domain are stored.
const NO_DOMAIN: &str = "";

/// A pluggable pattern predicate: `(candidate, stored_label) -> bool`.
pub type MatchingFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

struct NamedMatcher {
    label: String,
    matches: MatchingFn,
}

impl std::fmt::Debug for NamedMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMatcher").field("label", &self.label).finish()
    }
}

/// Directed graph of role inheritance, optionally scoped by domain.
///
/// Vertices are role names; an edge `a → b` records that `a` has role `b`.
/// Reachability queries run a breadth-first search bounded by `max_depth`,
/// so cyclic or adversarial inputs cannot cause unbounded work. A stored
/// vertex or domain label can act as a pattern when a matching predicate is
/// installed, which lets policies grant roles like `/proj/*` inside the
/// graph itself instead of only in the outer matcher expression.
#[derive(Debug)]
pub struct RoleGraph {
    max_depth: usize,
    // domain -> source -> direct roles
    edges: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    name_matcher: Option<NamedMatcher>,
    domain_matcher: Option<NamedMatcher>,
}

impl Default for RoleGraph {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl RoleGraph {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            edges: BTreeMap::new(),
            name_matcher: None,
            domain_matcher: None,
        }
    }

    /// Install a role-name pattern predicate. Stored vertex labels are then
    /// treated as patterns against candidate names.
    pub fn add_matching_fn(&mut self, label: impl Into<String>, matches: MatchingFn) {
        self.name_matcher = Some(NamedMatcher {
            label: label.into(),
            matches,
        });
    }

    /// Install a domain pattern predicate. Stored domain labels are then
    /// treated as patterns against the requested domain.
    pub fn add_domain_matching_fn(&mut self, label: impl Into<String>, matches: MatchingFn) {
        self.domain_matcher = Some(NamedMatcher {
            label: label.into(),
            matches,
        });
    }

    pub fn add_link(&mut self, name1: &str, name2: &str, domain: Option<&str>) {
        self.edges
            .entry(domain.unwrap_or(NO_DOMAIN).to_string())
            .or_default()
            .entry(name1.to_string())
            .or_default()
            .insert(name2.to_string());
    }

    /// Remove a direct edge. Returns false when it did not exist.
    pub fn delete_link(&mut self, name1: &str, name2: &str, domain: Option<&str>) -> bool {
        let Some(sources) = self.edges.get_mut(domain.unwrap_or(NO_DOMAIN)) else {
            return false;
        };
        let Some(roles) = sources.get_mut(name1) else {
            return false;
        };
        let removed = roles.remove(name2);
        if roles.is_empty() {
            sources.remove(name1);
        }
        removed
    }

    /// Remove every edge; matchers and the depth bound survive.
    pub fn clear(&mut self) {
        self.edges.clear();
    }

    /// Transitive reachability from `name1` to `name2`, bounded by the
    /// configured depth. Reflexive: a name always reaches itself.
    pub fn has_link(&self, name1: &str, name2: &str, domain: Option<&str>) -> bool {
        if self.names_match(name1, name2) {
            return true;
        }

        let domains = self.candidate_domains(domain);
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<String> = VecDeque::new();
        visited.insert(name1.to_string());
        frontier.push_back(name1.to_string());

        for depth in 0..self.max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = VecDeque::new();
            while let Some(current) = frontier.pop_front() {
                for role in self.direct_roles(&current, &domains) {
                    if self.names_match(&role, name2) || self.names_match(name2, &role) {
                        trace!(from = name1, to = name2, depth, "role link found");
                        return true;
                    }
                    if visited.insert(role.clone()) {
                        next.push_back(role);
                    }
                }
            }
            frontier = next;
        }
        false
    }

    /// Direct successors of `name`, deduplicated and in stable order.
    pub fn get_roles(&self, name: &str, domain: Option<&str>) -> Vec<String> {
        let domains = self.candidate_domains(domain);
        let mut roles: BTreeSet<String> = BTreeSet::new();
        for role in self.direct_roles(name, &domains) {
            roles.insert(role);
        }
        roles.into_iter().collect()
    }

    /// Stored domain keys matching the requested domain, either literally
    /// or through the domain pattern predicate.
    fn candidate_domains(&self, domain: Option<&str>) -> Vec<String> {
        let requested = domain.unwrap_or(NO_DOMAIN);
        match &self.domain_matcher {
            None => vec![requested.to_string()],
            Some(matcher) => {
                let mut domains: Vec<String> = self
                    .edges
                    .keys()
                    .filter(|stored| stored.as_str() == requested || (matcher.matches)(requested, stored))
                    .cloned()
                    .collect();
                if domains.is_empty() {
                    domains.push(requested.to_string());
                }
                domains
            }
        }
    }

    fn direct_roles(&self, name: &str, domains: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for domain in domains {
            let Some(sources) = self.edges.get(domain) else { continue };
            for (source, roles) in sources {
                if source == name || self.pattern_matches(name, source) {
                    out.extend(roles.iter().cloned());
                }
            }
        }
        out
    }

    /// Literal equality, or a pattern hit in either direction.
    fn names_match(&self, candidate: &str, stored: &str) -> bool {
        candidate == stored || self.pattern_matches(candidate, stored)
    }

    fn pattern_matches(&self, candidate: &str, stored: &str) -> bool {
        self.name_matcher
            .as_ref()
            .is_some_and(|m| (m.matches)(candidate, stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;
    use crate::value::Value;

    fn graph() -> RoleGraph {
        RoleGraph::new(DEFAULT_MAX_DEPTH)
    }

    #[test]
    fn direct_and_transitive_links() {
        let mut g = graph();
        g.add_link("alice", "admin", None);
        g.add_link("admin", "superuser", None);

        assert!(g.has_link("alice", "admin", None));
        assert!(g.has_link("alice", "superuser", None));
        assert!(!g.has_link("admin", "alice", None));
        assert!(!g.has_link("bob", "admin", None));
    }

    #[test]
    fn reflexive_reachability() {
        let mut g = graph();
        g.add_link("alice", "admin", None);
        assert!(g.has_link("alice", "alice", None));
        assert!(g.has_link("admin", "admin", None));
        // Reflexivity holds even for names the graph has never seen.
        assert!(g.has_link("ghost", "ghost", None));
    }

    #[test]
    fn depth_bound_cuts_long_chains() {
        let mut g = RoleGraph::new(3);
        for i in 0..6 {
            g.add_link(&format!("n{i}"), &format!("n{}", i + 1), None);
        }
        assert!(g.has_link("n0", "n3", None));
        assert!(!g.has_link("n0", "n6", None));
    }

    #[test]
    fn cycles_terminate() {
        let mut g = graph();
        g.add_link("a", "b", None);
        g.add_link("b", "c", None);
        g.add_link("c", "a", None);
        assert!(g.has_link("a", "c", None));
        assert!(!g.has_link("a", "d", None));
    }

    #[test]
    fn domains_are_isolated() {
        let mut g = graph();
        g.add_link("alice", "admin", Some("tenant1"));

        assert!(g.has_link("alice", "admin", Some("tenant1")));
        assert!(!g.has_link("alice", "admin", Some("tenant2")));
        assert!(!g.has_link("alice", "admin", None));
    }

    #[test]
    fn delete_link_removes_only_that_edge() {
        let mut g = graph();
        g.add_link("alice", "admin", None);
        g.add_link("alice", "editor", None);

        assert!(g.delete_link("alice", "admin", None));
        assert!(!g.delete_link("alice", "admin", None));
        assert!(!g.has_link("alice", "admin", None));
        assert!(g.has_link("alice", "editor", None));
    }

    #[test]
    fn clear_drops_edges() {
        let mut g = graph();
        g.add_link("alice", "admin", None);
        g.clear();
        assert!(!g.has_link("alice", "admin", None));
        assert!(g.get_roles("alice", None).is_empty());
    }

    #[test]
    fn get_roles_lists_direct_successors_only() {
        let mut g = graph();
        g.add_link("alice", "admin", None);
        g.add_link("admin", "superuser", None);
        assert_eq!(g.get_roles("alice", None), vec!["admin"]);
        assert_eq!(g.get_roles("admin", None), vec!["superuser"]);
    }

    #[test]
    fn name_pattern_matching() {
        let mut g = graph();
        g.add_matching_fn(
            "keyMatch",
            Arc::new(|candidate, stored| {
                builtins::key_match(
                    &[Value::from(candidate), Value::from(stored)],
                )
                .is_ok_and(|v| v == Value::Bool(true))
            }),
        );
        g.add_link("/proj/*", "project_admin", None);

        assert!(g.has_link("/proj/website", "project_admin", None));
        assert!(!g.has_link("/other/website", "project_admin", None));
    }

    #[test]
    fn domain_pattern_matching() {
        let mut g = graph();
        g.add_domain_matching_fn(
            "keyMatch",
            Arc::new(|candidate, stored| {
                builtins::key_match(
                    &[Value::from(candidate), Value::from(stored)],
                )
                .is_ok_and(|v| v == Value::Bool(true))
            }),
        );
        g.add_link("alice", "admin", Some("tenant/*"));

        assert!(g.has_link("alice", "admin", Some("tenant/1")));
        assert!(g.has_link("alice", "admin", Some("tenant/2")));
        assert!(!g.has_link("alice", "admin", Some("corp/1")));
    }
}
