use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{Flow, Middleware, ProviderRequest};
use crate::{
    origin::{host_of, origin_or_raw},
    rpc::ResponseResult,
    site::SiteRefs,
};

/// Keys that never leave the wallet, wherever they appear in a response.
pub const DEFAULT_SANITIZED_FIELDS: &[&str] = &[
    "stack",
    "__internal",
    "__bridge",
    "bridgeId",
    "webviewId",
    "privateKey",
    "mnemonic",
    "password",
];

/// Stamps the page's current origin and metadata onto every request.
pub struct OriginTag {
    site: SiteRefs,
}

impl OriginTag {
    pub fn new(site: SiteRefs) -> Self {
        Self { site }
    }
}

#[async_trait]
impl Middleware for OriginTag {
    fn name(&self) -> &'static str {
        "origin-tag"
    }

    async fn on_request(&self, request: &mut ProviderRequest) -> Flow {
        let site = self.site.snapshot();
        request.session.origin = origin_or_raw(&site.url);
        request.session.hostname = host_of(&site.url).unwrap_or_default();
        request.session.name = site.title;
        request.session.icon = site.icon;
        Flow::Next
    }
}

/// Removes denylisted keys from results and error data.
pub struct Sanitize {
    fields: HashSet<String>,
}

impl Sanitize {
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: HashSet<String> = DEFAULT_SANITIZED_FIELDS
            .iter()
            .map(|field| field.to_string())
            .collect();
        fields.extend(extra.into_iter().map(Into::into));
        Self { fields }
    }

    fn strip(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                map.retain(|key, _| !self.fields.contains(key));
                for nested in map.values_mut() {
                    self.strip(nested);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.strip(item);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Middleware for Sanitize {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    fn on_response(&self, _request: &ProviderRequest, response: &mut ResponseResult) {
        match response {
            ResponseResult::Success(result) => self.strip(result),
            ResponseResult::Error(error) => {
                if let Some(data) = error.data.as_mut() {
                    self.strip(data);
                }
            }
        }
    }
}
