//! Outbound HTTP with the ambient correlation id attached.
//!
//! Requests built through [`CorrelatedClient`] carry the current id in a
//! header, so downstream services can join their logs to the job that
//! called them. Outside a correlation scope requests go out unchanged.

use std::sync::Arc;

use reqwest::header::HeaderName;
use reqwest::{Client, Method, RequestBuilder};
use tracing::debug;

use crate::correlation::{AmbientAccessor, CorrelationContextAccessor, non_blank};

#[derive(Clone)]
pub struct CorrelatedClient {
    inner: Client,
    header: HeaderName,
    accessor: Arc<dyn CorrelationContextAccessor>,
}

impl CorrelatedClient {
    /// Wrap `inner`, stamping the default `CorrelationId` header.
    pub fn new(inner: Client) -> Self {
        Self {
            inner,
            // `CorrelationId`; header names are stored lowercase.
            header: HeaderName::from_static("correlationid"),
            accessor: Arc::new(AmbientAccessor),
        }
    }

    pub fn with_header(mut self, header: HeaderName) -> Self {
        self.header = header;
        self
    }

    pub fn with_accessor(mut self, accessor: Arc<dyn CorrelationContextAccessor>) -> Self {
        self.accessor = accessor;
        self
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.inner.request(method, url);
        let id = self
            .accessor
            .correlation_context()
            .and_then(|context| non_blank(Some(context.correlation_id)));
        match id {
            Some(id) => {
                debug!(correlation.id = %id, header = %self.header, "stamping outbound request");
                builder.header(self.header.clone(), id)
            }
            None => builder,
        }
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }
}

impl Default for CorrelatedClient {
    fn default() -> Self {
        Self::new(Client::new())
    }
}
