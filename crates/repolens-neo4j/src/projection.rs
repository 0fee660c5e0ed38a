//! Cypher specifications for the three projection shapes.
//!
//! Each projection is created with `gds.graph.project.cypher` from a
//! deterministic node query and relationship query tied to its name
//! template. The `$repo_id` / `$active_repo_id` / `$reference_repo_id`
//! placeholders are bound through the GDS `parameters` option.

use repolens::store::ProjectionScope;

/// `(node_query, relationship_query)` for a projection scope.
pub(crate) fn cypher_spec(scope: &ProjectionScope) -> (&'static str, &'static str) {
    match scope {
        ProjectionScope::Code { .. } => (
            "MATCH (n:Code) WHERE n.repo_id = $repo_id
             RETURN id(n) AS id, labels(n) AS labels, properties(n) AS properties",
            "MATCH (n:Code)-[r:CALLS|IMPORTS|DEFINES|DEPENDS_ON|CONTAINS]->(m:Code)
             WHERE n.repo_id = $repo_id AND m.repo_id = $repo_id
             RETURN id(n) AS source, id(m) AS target, type(r) AS type, properties(r) AS properties",
        ),
        ProjectionScope::Pattern { .. } => (
            "MATCH (n)
             WHERE (n:Pattern AND n.repo_id = $repo_id) OR
                   (n:Code AND n.repo_id = $repo_id) OR
                   (n:Repository AND n.id = $repo_id)
             RETURN id(n) AS id, labels(n) AS labels, properties(n) AS properties",
            "MATCH (n:Pattern {repo_id: $repo_id})-[r:EXTRACTED_FROM]->(m:Code {repo_id: $repo_id})
             RETURN id(n) AS source, id(m) AS target, type(r) AS type, properties(r) AS properties
             UNION
             MATCH (n:Repository {id: $repo_id})-[r:REFERENCE_PATTERN|APPLIED_PATTERN]->(m:Pattern)
             RETURN id(n) AS source, id(m) AS target, type(r) AS type, properties(r) AS properties",
        ),
        ProjectionScope::Combined { .. } => (
            "MATCH (n)
             WHERE (n:Code AND (n.repo_id = $active_repo_id OR n.repo_id = $reference_repo_id)) OR
                   (n:Pattern AND (n.repo_id = $active_repo_id OR n.repo_id = $reference_repo_id))
             RETURN id(n) AS id, labels(n) AS labels, properties(n) AS properties",
            "MATCH (s)-[r]->(t)
             WHERE (s:Code OR s:Pattern) AND (t:Code OR t:Pattern) AND
                   (s.repo_id = $active_repo_id OR s.repo_id = $reference_repo_id) AND
                   (t.repo_id = $active_repo_id OR t.repo_id = $reference_repo_id)
             RETURN id(s) AS source, id(t) AS target, type(r) AS type, properties(r) AS properties",
        ),
    }
}

/// Cypher counting the nodes a scope would project; zero means `ensure`
/// skips creation.
pub(crate) fn count_query(scope: &ProjectionScope) -> &'static str {
    match scope {
        ProjectionScope::Code { .. } => {
            "MATCH (n:Code {repo_id: $repo_id}) RETURN count(n) AS count"
        }
        ProjectionScope::Pattern { .. } => {
            "MATCH (n:Pattern {repo_id: $repo_id}) RETURN count(n) AS count"
        }
        ProjectionScope::Combined { .. } => {
            "MATCH (n)
             WHERE (n:Code OR n:Pattern) AND
                   (n.repo_id = $active_repo_id OR n.repo_id = $reference_repo_id)
             RETURN count(n) AS count"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_projection_edges_are_structural_only() {
        let scope = ProjectionScope::Code { repo_id: 1 };
        let (nodes, rels) = cypher_spec(&scope);
        assert!(nodes.contains(":Code"));
        for edge in ["CALLS", "IMPORTS", "DEFINES", "DEPENDS_ON", "CONTAINS"] {
            assert!(rels.contains(edge), "missing edge type {edge}");
        }
        assert!(!rels.contains("EXTRACTED_FROM"));
    }

    #[test]
    fn pattern_projection_includes_repo_edges() {
        let scope = ProjectionScope::Pattern { repo_id: 1 };
        let (nodes, rels) = cypher_spec(&scope);
        assert!(nodes.contains(":Repository"));
        assert!(rels.contains("EXTRACTED_FROM"));
        assert!(rels.contains("REFERENCE_PATTERN|APPLIED_PATTERN"));
    }

    #[test]
    fn combined_projection_spans_both_repos() {
        let scope = ProjectionScope::Combined {
            active_repo_id: 1,
            reference_repo_id: 2,
        };
        let (nodes, rels) = cypher_spec(&scope);
        assert!(nodes.contains("$active_repo_id"));
        assert!(nodes.contains("$reference_repo_id"));
        // Any edge with both endpoints inside the node set qualifies.
        assert!(rels.contains("(s)-[r]->(t)"));
    }

    #[test]
    fn count_queries_cover_each_scope() {
        assert!(count_query(&ProjectionScope::Code { repo_id: 1 }).contains(":Code"));
        assert!(count_query(&ProjectionScope::Pattern { repo_id: 1 }).contains(":Pattern"));
        assert!(count_query(&ProjectionScope::Combined {
            active_repo_id: 1,
            reference_repo_id: 2
        })
        .contains("$reference_repo_id"));
    }
}
