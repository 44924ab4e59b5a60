//! GraphQL dictionary client for SubQuery-style NEAR dictionaries.
//!
//! Each plan entity becomes one connection query over `blockHeight`, with
//! the plan's entries OR-ed together and each entry's conditions AND-ed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use nearindex_core::dictionary::{DictionaryQueryEntry, DictionaryResult};
use nearindex_core::{Dictionary, IndexerError, QueryPlan};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// Dictionary served over GraphQL.
#[derive(Debug, Clone)]
pub struct GraphqlDictionary {
    endpoint: String,
    http: reqwest::Client,
}

impl GraphqlDictionary {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, query: String) -> Result<Value, IndexerError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| IndexerError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(IndexerError::Connection(format!(
                "dictionary returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        let body: GraphqlResponse = resp
            .json()
            .await
            .map_err(|e| IndexerError::Other(format!("invalid dictionary response: {e}")))?;
        if let Some(err) = body.errors.first() {
            return Err(IndexerError::Other(format!("dictionary query failed: {}", err.message)));
        }
        body.data
            .ok_or_else(|| IndexerError::Other("dictionary response has no data".into()))
    }
}

#[async_trait]
impl Dictionary for GraphqlDictionary {
    async fn query_heights(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        plan: &QueryPlan,
    ) -> Result<Option<DictionaryResult>, IndexerError> {
        let data = self.post(build_query(start, end, limit, &plan.entries)).await?;
        Ok(parse_result(&data, start, end, limit))
    }
}

fn group_by_entity(entries: &[DictionaryQueryEntry]) -> BTreeMap<&str, Vec<&DictionaryQueryEntry>> {
    let mut groups: BTreeMap<&str, Vec<&DictionaryQueryEntry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.entity.as_str()).or_default().push(entry);
    }
    groups
}

fn build_query(start: u64, end: u64, limit: usize, entries: &[DictionaryQueryEntry]) -> String {
    let mut query = String::from("query {\n  _metadata { lastProcessedHeight }\n");
    for (entity, group) in group_by_entity(entries) {
        let alternatives: Vec<String> = group
            .iter()
            .map(|entry| {
                let conditions: Vec<String> = entry
                    .conditions
                    .iter()
                    .map(|c| format!("{{ {}: {{ {}: {} }} }}", c.field, c.matcher, Value::from(c.value.as_str())))
                    .collect();
                format!("{{ and: [{}] }}", conditions.join(", "))
            })
            .collect();
        query.push_str(&format!(
            "  {entity}(first: {limit}, orderBy: BLOCK_HEIGHT_ASC, distinct: [BLOCK_HEIGHT], \
             filter: {{ blockHeight: {{ greaterThanOrEqualTo: \"{start}\", lessThanOrEqualTo: \"{end}\" }}, \
             or: [{}] }}) {{ nodes {{ blockHeight }} }}\n",
            alternatives.join(", ")
        ));
    }
    query.push('}');
    query
}

fn as_height(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_u64(),
    }
}

/// Heights are complete up to the `limit`-th distinct height, or up to the
/// dictionary's own progress when no entity hit the limit.
fn parse_result(data: &Value, start: u64, end: u64, limit: usize) -> Option<DictionaryResult> {
    let indexed = as_height(&data["_metadata"]["lastProcessedHeight"])?;
    if indexed < start {
        return None;
    }

    let mut heights = BTreeSet::new();
    if let Some(map) = data.as_object() {
        for (entity, value) in map {
            if entity == "_metadata" {
                continue;
            }
            let nodes = value["nodes"].as_array()?;
            heights.extend(nodes.iter().filter_map(|n| as_height(&n["blockHeight"])));
        }
    }

    let mut heights: Vec<u64> = heights.into_iter().filter(|h| (start..=end).contains(h)).collect();
    let last_scanned = if limit > 0 && heights.len() >= limit {
        heights.truncate(limit);
        heights[limit - 1]
    } else {
        indexed.min(end)
    };
    Some(DictionaryResult {
        heights,
        last_scanned,
    })
}
