use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::Attributes;

/// Where and how to fetch a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub api_host: String,
    pub streaming_host: String,
    pub client_key: String,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
    /// When set, the server evaluates features for this user and returns a reduced payload.
    pub remote_eval: Option<RemoteEvalRequest>,
}

/// User context sent to the server for remote evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvalRequest {
    pub attributes: Attributes,
    pub forced_variations: HashMap<String, usize>,
    /// Sent as an array of `[key, value]` pairs.
    #[serde(serialize_with = "serialize_pairs")]
    pub forced_features: HashMap<String, Value>,
    pub url: String,
    /// Attributes that make up the cache key. All attributes are used when `None`.
    #[serde(skip)]
    pub cache_key_attributes: Option<Vec<String>>,
}

#[derive(Serialize)]
struct RemoteEvalCacheKey<'a> {
    ca: Attributes,
    fv: BTreeMap<&'a str, usize>,
    url: &'a str,
}

impl FetchRequest {
    pub fn new(api_host: impl Into<String>, client_key: impl Into<String>) -> FetchRequest {
        let api_host = api_host.into().trim_end_matches('/').to_owned();
        FetchRequest {
            streaming_host: api_host.clone(),
            api_host,
            client_key: client_key.into(),
            headers: HashMap::new(),
            remote_eval: None,
        }
    }

    /// Key shared by every consumer of the same `(api_host, client_key)`. Streams and
    /// subscriptions are grouped by this key.
    pub fn key(&self) -> String {
        format!("{}||{}", self.api_host, self.client_key)
    }

    /// Key of the cache entry. Remote evaluation requests for different users don't collide.
    pub fn cache_key(&self) -> String {
        let key = self.key();
        let Some(remote_eval) = &self.remote_eval else {
            return key;
        };

        let ca = match &remote_eval.cache_key_attributes {
            Some(names) => remote_eval
                .attributes
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => remote_eval.attributes.clone(),
        };
        let suffix = serde_json::to_string(&RemoteEvalCacheKey {
            ca,
            fv: remote_eval
                .forced_variations
                .iter()
                .map(|(key, variation)| (key.as_str(), *variation))
                .collect(),
            url: &remote_eval.url,
        })
        .unwrap_or_default();

        key + &suffix
    }
}

fn serialize_pairs<S: serde::Serializer>(
    map: &HashMap<String, Value>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(map.iter())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FetchRequest, RemoteEvalRequest};

    #[test]
    fn keys_ignore_trailing_slash() {
        let request = FetchRequest::new("https://cdn.growthbook.io/", "sdk-abc");
        assert_eq!(request.key(), "https://cdn.growthbook.io||sdk-abc");
        assert_eq!(request.cache_key(), request.key());
    }

    #[test]
    fn remote_eval_cache_key_uses_selected_attributes() {
        let mut request = FetchRequest::new("https://cdn.growthbook.io", "sdk-abc");
        let remote_eval = RemoteEvalRequest {
            attributes: json!({"id": "1", "company": "acme"})
                .as_object()
                .cloned()
                .unwrap(),
            cache_key_attributes: Some(vec!["id".to_owned()]),
            ..Default::default()
        };
        request.remote_eval = Some(remote_eval.clone());

        assert_eq!(
            request.cache_key(),
            r#"https://cdn.growthbook.io||sdk-abc{"ca":{"id":"1"},"fv":{},"url":""}"#
        );

        let mut other_company = remote_eval;
        other_company
            .attributes
            .insert("company".to_owned(), json!("globex"));
        let other = FetchRequest {
            remote_eval: Some(other_company),
            ..request.clone()
        };
        assert_eq!(other.cache_key(), request.cache_key());
    }

    #[test]
    fn remote_eval_body_sends_forced_features_as_pairs() {
        let body = RemoteEvalRequest {
            forced_features: [("dark-mode".to_owned(), json!(true))].into(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "attributes": {},
                "forcedVariations": {},
                "forcedFeatures": [["dark-mode", true]],
                "url": ""
            })
        );
    }
}
