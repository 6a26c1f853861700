use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::SyncError;
use crate::models::StudentState;
use crate::persistence::{RemoteSync, SyncFuture};

/// Remote sync callback that POSTs the whole snapshot to
/// `{base_url}/api/progress/save`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    endpoint: String,
}

impl HttpRemote {
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        let endpoint = format!("{}/api/progress/save", base_url.trim_end_matches('/'));
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RemoteSync for HttpRemote {
    fn push(&self, snapshot: StudentState) -> SyncFuture {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            debug!(student = %snapshot.student_id, %endpoint, "pushing progress snapshot");
            client
                .post(&endpoint)
                .json(&snapshot)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
    }
}
