//! NF-003: Template resolution, resource references, and dependency ordering.
//!
//! Resolves `{{params.key}}` templates and `${resource.field}` references.
//! Computes topological order over the dependency graph using Kahn's
//! algorithm with deterministic (alphabetical) tie-breaking.

use super::error::{EngineError, EngineResult};
use super::output::{all, Output};
use super::stack::ResourceHandle;
use super::types::yaml_value_to_string;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Range;

/// Resolve all `{{params.key}}` variables in a string.
pub fn resolve_template(
    template: &str,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(param_key) = key.strip_prefix("params.") {
            params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?
        } else {
            return Err(format!("unknown template variable: {}", key));
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Resolve templates in every string inside a property value.
pub fn resolve_value_templates(
    value: &Value,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<Value, String> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_template(s, params)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value_templates(v, params))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value_templates(v, params)?)))
                .collect::<Result<_, String>>()?,
        ),
        other => other.clone(),
    })
}

/// A `${resource.field}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub resource: String,
    pub field: String,
}

/// Find every `${resource.field}` reference in a string.
pub fn find_references(s: &str) -> Result<Vec<(Range<usize>, Reference)>, String> {
    let mut refs = Vec::new();
    let mut start = 0;
    while let Some(open) = s[start..].find("${") {
        let open = start + open;
        let close = s[open..]
            .find('}')
            .ok_or_else(|| format!("unclosed reference at position {}", open))?;
        let close = open + close + 1;
        let body = s[open + 2..close - 1].trim();
        let (resource, field) = body
            .split_once('.')
            .filter(|(r, f)| !r.is_empty() && !f.is_empty())
            .ok_or_else(|| format!("invalid reference '${{{}}}': expected ${{resource.field}}", body))?;
        refs.push((
            open..close,
            Reference {
                resource: resource.to_string(),
                field: field.to_string(),
            },
        ));
        start = close;
    }
    Ok(refs)
}

/// References in a property value. Only string properties may hold them.
pub fn value_references(value: &Value) -> Result<Vec<Reference>, String> {
    match value {
        Value::String(s) => Ok(find_references(s)?.into_iter().map(|(_, r)| r).collect()),
        _ => Ok(Vec::new()),
    }
}

/// Turn a property value into a deferred input, wiring references to handles.
///
/// A string that is exactly one reference takes the producer's value as-is;
/// references embedded in text are interpolated once they resolve.
pub fn resolve_references(
    value: &Value,
    handles: &IndexMap<String, ResourceHandle>,
) -> Result<Output<Value>, String> {
    let Value::String(s) = value else {
        return Ok(Output::known(value.clone()));
    };
    let refs = find_references(s)?;
    if refs.is_empty() {
        return Ok(Output::known(value.clone()));
    }

    let mut outputs = Vec::with_capacity(refs.len());
    for (_, r) in &refs {
        let handle = handles
            .get(&r.resource)
            .ok_or_else(|| format!("reference to unknown resource '{}'", r.resource))?;
        let output = handle.output(&r.field).ok_or_else(|| {
            format!(
                "resource '{}' ({}) has no field '{}'",
                r.resource, handle.type_token, r.field
            )
        })?;
        outputs.push(output);
    }

    if refs.len() == 1 && refs[0].0 == (0..s.len()) {
        return Ok(outputs.remove(0));
    }

    let template = s.clone();
    let spans: Vec<Range<usize>> = refs.into_iter().map(|(span, _)| span).collect();
    Ok(all(&outputs).apply(move |values| {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for (span, value) in spans.iter().zip(values) {
            out.push_str(&template[last..span.start]);
            match value {
                Value::String(v) => out.push_str(&v),
                other => out.push_str(&other.to_string()),
            }
            last = span.end;
        }
        out.push_str(&template[last..]);
        Value::String(out)
    }))
}

/// Topological order over `node → dependencies`.
///
/// Kahn's algorithm with alphabetical tie-breaking, so the order is
/// deterministic. An unknown dependency is a validation error; leftover
/// nodes form a cycle.
pub fn topo_order(graph: &IndexMap<String, Vec<String>>) -> EngineResult<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in graph.keys() {
        in_degree.insert(id.as_str(), 0);
        adjacency.insert(id.as_str(), Vec::new());
    }

    for (id, deps) in graph {
        let id = id.as_str();
        let unique: HashSet<&str> = deps.iter().map(String::as_str).collect();
        for dep in unique {
            let Some(dependents) = adjacency.get_mut(dep) else {
                return Err(EngineError::Validation(format!(
                    "resource '{}' depends on unknown '{}'",
                    id, dep
                )));
            };
            dependents.push(id);
            *in_degree.entry(id).or_default() += 1;
        }
    }

    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    zero_degree.sort_unstable();
    let mut queue: VecDeque<&str> = zero_degree.into();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        for &neighbor in adjacency.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(neighbor) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(neighbor);
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != graph.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut members: Vec<String> = graph
            .keys()
            .filter(|id| !ordered.contains(id.as_str()))
            .cloned()
            .collect();
        members.sort();
        return Err(EngineError::DependencyCycle { members });
    }

    Ok(order)
}

/// Group nodes into waves: every node's dependencies sit in earlier waves.
pub fn execution_waves(graph: &IndexMap<String, Vec<String>>) -> EngineResult<Vec<Vec<String>>> {
    let order = topo_order(graph)?;
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut waves: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for id in &order {
        let d = graph
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|dep| depth.get(dep.as_str()))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(id.as_str(), d);
        waves.entry(d).or_default().push(id.clone());
    }
    Ok(waves.into_values().collect())
}

/// Drop edges to nodes outside the graph (e.g. records already gone).
pub fn prune_unknown(graph: &IndexMap<String, Vec<String>>) -> IndexMap<String, Vec<String>> {
    graph
        .iter()
        .map(|(id, deps)| {
            let kept = deps
                .iter()
                .filter(|d| graph.contains_key(d.as_str()))
                .cloned()
                .collect();
            (id.clone(), kept)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor;
    use crate::core::options::ResourceOptions;
    use crate::core::stack::Stack;
    use proptest::prelude::*;
    use serde_json::json;

    fn graph(edges: &[(&str, &[&str])]) -> IndexMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_nf003_resolve_params() {
        let mut params = HashMap::new();
        params.insert(
            "region".to_string(),
            serde_yaml_ng::Value::String("aws-us-east-2".to_string()),
        );
        let result = resolve_template("region {{params.region}}", &params).unwrap();
        assert_eq!(result, "region aws-us-east-2");
    }

    #[test]
    fn test_nf003_resolve_unknown_param() {
        let params = HashMap::new();
        let result = resolve_template("{{params.missing}}", &params);
        assert!(result.unwrap_err().contains("unknown param"));
        assert!(resolve_template("{{machine.x}}", &params).is_err());
        assert!(resolve_template("{{params.x", &params).is_err());
    }

    #[test]
    fn test_nf003_resolve_value_templates_recurses() {
        let mut params = HashMap::new();
        params.insert("a".to_string(), serde_yaml_ng::Value::String("X".to_string()));
        let v = json!({"k": ["{{params.a}}-1", 3]});
        assert_eq!(
            resolve_value_templates(&v, &params).unwrap(),
            json!({"k": ["X-1", 3]})
        );
    }

    #[test]
    fn test_nf003_find_references() {
        let refs = find_references("postgres://${role.name}:${role.password}@${ep.host}/app").unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].1.resource, "role");
        assert_eq!(refs[1].1.field, "password");
        assert!(find_references("${broken").is_err());
        assert!(find_references("${nofield}").is_err());
        assert!(find_references("plain").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nf003_resolve_references_whole_and_embedded() {
        let mut stack = Stack::new("demo");
        let p = stack
            .register(
                descriptor::lookup("project").unwrap(),
                "project",
                [
                    ("name".to_string(), Output::known(json!("demo"))),
                    ("regionId".to_string(), Output::known(json!("r"))),
                ]
                .into_iter()
                .collect(),
                ResourceOptions::default(),
            )
            .unwrap();
        let handles = IndexMap::from([("project".to_string(), p)]);

        let whole = resolve_references(&json!("${project.id}"), &handles).unwrap();
        assert!(whole.producers().contains("project"));
        let embedded = resolve_references(&json!("proj-${project.id}-x"), &handles).unwrap();
        assert!(embedded.is_pending());
        let plain = resolve_references(&json!(5), &handles).unwrap();
        assert_eq!(plain.get().await, Ok(json!(5)));
        assert!(resolve_references(&json!("${nope.id}"), &handles).is_err());
        assert!(resolve_references(&json!("${project.bogus}"), &handles).is_err());

        let reg = stack.into_registrations().remove(0);
        reg.resolvers.resolve("p-7", &Default::default());
        assert_eq!(whole.get().await, Ok(json!("p-7")));
        assert_eq!(embedded.get().await, Ok(json!("proj-p-7-x")));
    }

    #[test]
    fn test_nf003_topo_linear() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        assert_eq!(topo_order(&g).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_nf003_topo_parallel_alphabetical() {
        let g = graph(&[("beta", &[]), ("alpha", &[])]);
        assert_eq!(topo_order(&g).unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_nf003_topo_diamond() {
        let g = graph(&[
            ("bottom", &["left", "right"]),
            ("right", &["top"]),
            ("left", &["top"]),
            ("top", &[]),
        ]);
        assert_eq!(topo_order(&g).unwrap(), vec!["top", "left", "right", "bottom"]);
        assert_eq!(
            execution_waves(&g).unwrap(),
            vec![vec!["top"], vec!["left", "right"], vec!["bottom"]]
        );
    }

    #[test]
    fn test_nf003_topo_cycle_names_members() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("free", &[])]);
        assert_eq!(
            topo_order(&g).unwrap_err(),
            EngineError::DependencyCycle {
                members: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_nf003_topo_unknown_dependency() {
        let g = graph(&[("a", &["ghost"])]);
        assert!(matches!(topo_order(&g), Err(EngineError::Validation(_))));
        assert_eq!(topo_order(&prune_unknown(&g)).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_nf003_duplicate_edges_counted_once() {
        let g = graph(&[("b", &["a", "a"]), ("a", &[])]);
        assert_eq!(topo_order(&g).unwrap(), vec!["a", "b"]);
    }

    proptest! {
        /// Edges only point from higher to lower index, so the graph is a DAG.
        #[test]
        fn prop_nf003_topo_respects_every_edge(edges in prop::collection::vec((0usize..12, 0usize..12), 0..40)) {
            let mut g: IndexMap<String, Vec<String>> =
                (0..12).map(|i| (format!("n{:02}", i), Vec::new())).collect();
            for (a, b) in edges {
                if a > b {
                    g[a].push(format!("n{:02}", b));
                }
            }
            let order = topo_order(&g).unwrap();
            prop_assert_eq!(order.len(), 12);
            let pos: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
            for (node, deps) in &g {
                for dep in deps {
                    prop_assert!(pos[dep.as_str()] < pos[node.as_str()]);
                }
            }
        }
    }
}
